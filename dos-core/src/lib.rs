//! Dos Core - coordination and replica logic for a small replicated object store

pub mod api;
pub mod client;
pub mod datanode;
pub mod error;
pub mod namenode;
pub mod protocol;

pub use client::DosClient;
pub use datanode::{
    DataNodeOptions, GhostAgent, LeaseHub, LeaseNotification, LeasePublisher, LocalStore,
    MemoryQueue, RecoveryInstall, RedisQueue, ReplicaAgent, SqliteStore,
};
pub use error::{DosError, Result};
pub use namenode::{CreateOutcome, NameNode, NameNodeOptions, NameNodeStatus, RecoveryReport};
pub use protocol::{
    Command, GhostFrame, GhostStatus, NodeFrame, NodeFrameBody, ObjectPayload, Outbound,
    RequestId, ServerFrame,
};
