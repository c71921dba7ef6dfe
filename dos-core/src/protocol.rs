//! Frames exchanged over the control and ghost channels.
//!
//! Every frame is one JSON document. Object bytes travel base64-encoded so
//! that frames stay valid UTF-8 text on any message transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlates a node's acknowledgment with the request awaiting it.
///
/// Allocated from a per-connection counter, so two outstanding requests on
/// one connection can never share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPayload {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ObjectPayload {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Server to node command. Everything but `Create` and `Registered` carries
/// a broadcast sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// First frame on a new control stream: the last sequence this node
    /// will not receive. Not acked.
    Registered {
        sequence: u64,
    },
    Create {
        object_name: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Commit {
        sequence: u64,
        object_name: String,
    },
    Delete {
        sequence: u64,
        object_name: String,
    },
    Update {
        sequence: u64,
        object_name: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    DistributedRead {
        sequence: u64,
        object_names: Vec<String>,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Registered { .. } => "registered",
            Command::Create { .. } => "create",
            Command::Commit { .. } => "commit",
            Command::Delete { .. } => "delete",
            Command::Update { .. } => "update",
            Command::DistributedRead { .. } => "distributed-read",
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            Command::Registered { .. } | Command::Create { .. } => None,
            Command::Commit { sequence, .. }
            | Command::Delete { sequence, .. }
            | Command::Update { sequence, .. }
            | Command::DistributedRead { sequence, .. } => Some(*sequence),
        }
    }

    /// `kind:object@node`, or `kind:N-objects@node` for batch reads. Used in
    /// log lines only; correlation goes through [`RequestId`].
    pub fn label(&self, node_id: &str) -> String {
        match self {
            Command::Registered { sequence } => {
                format!("{}@lamport{}@{}", self.kind(), sequence, node_id)
            }
            Command::Create { object_name, .. }
            | Command::Commit { object_name, .. }
            | Command::Delete { object_name, .. }
            | Command::Update { object_name, .. } => {
                format!("{}:{}@{}", self.kind(), object_name, node_id)
            }
            Command::DistributedRead { object_names, .. } => {
                format!("{}:{}-objects@{}", self.kind(), object_names.len(), node_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub message_tag: RequestId,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeFrameBody {
    Beat,
    Ack {
        message_tag: RequestId,
    },
    DistributedReadResult {
        message_tag: RequestId,
        #[serde(default)]
        payload: Vec<ObjectPayload>,
    },
}

/// Node to server frame. Size and object list are only meaningful on beats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFrame {
    pub id: String,
    #[serde(default)]
    pub reported_size: u64,
    #[serde(default)]
    pub object_names: Vec<String>,
    #[serde(default)]
    pub lease_endpoint: String,
    #[serde(flatten)]
    pub body: NodeFrameBody,
}

impl NodeFrame {
    pub fn beat(
        id: impl Into<String>,
        lease_endpoint: impl Into<String>,
        reported_size: u64,
        object_names: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            reported_size,
            object_names,
            lease_endpoint: lease_endpoint.into(),
            body: NodeFrameBody::Beat,
        }
    }

    pub fn ack(id: impl Into<String>, message_tag: RequestId) -> Self {
        Self {
            id: id.into(),
            reported_size: 0,
            object_names: Vec::new(),
            lease_endpoint: String::new(),
            body: NodeFrameBody::Ack { message_tag },
        }
    }

    pub fn read_result(
        id: impl Into<String>,
        message_tag: RequestId,
        payload: Vec<ObjectPayload>,
    ) -> Self {
        Self {
            id: id.into(),
            reported_size: 0,
            object_names: Vec::new(),
            lease_endpoint: String::new(),
            body: NodeFrameBody::DistributedReadResult {
                message_tag,
                payload,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GhostStatus {
    Done,
}

/// Recovery payload pushed down a ghost channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostFrame {
    pub status: GhostStatus,
    pub sequence: u64,
    pub create_entries: Vec<ObjectPayload>,
}

/// What a session writes to its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Command(ServerFrame),
    Recovery(GhostFrame),
}

impl Outbound {
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Outbound::Command(frame) => serde_json::to_string(frame),
            Outbound::Recovery(frame) => serde_json::to_string(frame),
        }
    }
}

pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
