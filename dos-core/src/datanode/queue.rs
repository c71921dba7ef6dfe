use crate::error::{DosError, Result};
use crate::protocol::{base64_bytes, Command, ObjectPayload};
use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;

/// A sequenced command parked until its predecessors have been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockedCommand {
    Commit {
        name: String,
    },
    Delete {
        name: String,
    },
    Update {
        name: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Distributed reads are answered on receipt; only their slot in the
    /// sequence is kept.
    Read,
}

impl BlockedCommand {
    pub fn from_command(command: &Command) -> Option<Self> {
        match command {
            Command::Registered { .. } | Command::Create { .. } => None,
            Command::Commit { object_name, .. } => Some(Self::Commit {
                name: object_name.clone(),
            }),
            Command::Delete { object_name, .. } => Some(Self::Delete {
                name: object_name.clone(),
            }),
            Command::Update {
                object_name, data, ..
            } => Some(Self::Update {
                name: object_name.clone(),
                data: data.clone(),
            }),
            Command::DistributedRead { .. } => Some(Self::Read),
        }
    }
}

/// Pending-create FIFOs and the blocked-command set of one data node.
/// Only the node's own command loop touches it.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    async fn push_create(&self, entry: ObjectPayload) -> Result<()>;

    /// Next staged create for `name`, oldest first.
    async fn pull_create(&self, name: &str) -> Result<Option<ObjectPayload>>;

    async fn block(&self, sequence: u64, command: BlockedCommand) -> Result<()>;

    /// Lowest parked sequence, if any.
    async fn peek_blocked(&self) -> Result<Option<u64>>;

    async fn pop_blocked(&self) -> Result<Option<(u64, BlockedCommand)>>;
}

#[derive(Default)]
struct MemoryQueueInner {
    creates: HashMap<String, VecDeque<ObjectPayload>>,
    blocked: BTreeMap<u64, BlockedCommand>,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandQueue for MemoryQueue {
    async fn push_create(&self, entry: ObjectPayload) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .creates
            .entry(entry.name.clone())
            .or_default()
            .push_back(entry);
        Ok(())
    }

    async fn pull_create(&self, name: &str) -> Result<Option<ObjectPayload>> {
        let mut inner = self.inner.lock().await;
        let Some(queue) = inner.creates.get_mut(name) else {
            return Ok(None);
        };
        let entry = queue.pop_front();
        if queue.is_empty() {
            inner.creates.remove(name);
        }
        Ok(entry)
    }

    async fn block(&self, sequence: u64, command: BlockedCommand) -> Result<()> {
        self.inner.lock().await.blocked.insert(sequence, command);
        Ok(())
    }

    async fn peek_blocked(&self) -> Result<Option<u64>> {
        let inner = self.inner.lock().await;
        Ok(inner.blocked.keys().next().copied())
    }

    async fn pop_blocked(&self) -> Result<Option<(u64, BlockedCommand)>> {
        Ok(self.inner.lock().await.blocked.pop_first())
    }
}

#[derive(Serialize, Deserialize)]
struct BlockedMember {
    sequence: u64,
    #[serde(flatten)]
    command: BlockedCommand,
}

/// Redis-backed queue: one list per staged object and one sorted set of
/// blocked commands scored by sequence.
pub struct RedisQueue {
    conn: Mutex<redis::aio::MultiplexedConnection>,
    prefix: String,
}

impl RedisQueue {
    /// Connect and clear whatever an earlier run of this node left behind.
    pub async fn new(url: &str, node_id: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| DosError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DosError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| DosError::Config(format!("Redis ping failed: {}", e)))?;

        let queue = Self {
            conn: Mutex::new(conn),
            prefix: node_id.to_string(),
        };
        queue.clear_stale().await?;
        Ok(queue)
    }

    fn create_key(&self, name: &str) -> String {
        format!("{}:create-objects:{}", self.prefix, name)
    }

    fn creates_pattern(&self) -> String {
        format!("{}:create-objects:*", self.prefix)
    }

    fn blocked_key(&self) -> String {
        format!("{}:delivery-queue", self.prefix)
    }

    async fn clear_stale(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut stale: Vec<String> = conn.keys(self.creates_pattern()).await?;
        stale.push(self.blocked_key());

        let removed: i64 = conn.del(&stale).await?;
        if removed > 0 {
            tracing::info!("cleared {} stale queue keys for {}", removed, self.prefix);
        }
        Ok(())
    }
}

#[async_trait]
impl CommandQueue for RedisQueue {
    async fn push_create(&self, entry: ObjectPayload) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let key = self.create_key(&entry.name);
        let value = serde_json::to_string(&entry)?;
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn pull_create(&self, name: &str) -> Result<Option<ObjectPayload>> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = conn.lpop(self.create_key(name), None).await?;
        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn block(&self, sequence: u64, command: BlockedCommand) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let member = serde_json::to_string(&BlockedMember { sequence, command })?;
        let _: () = conn.zadd(self.blocked_key(), member, sequence).await?;
        Ok(())
    }

    async fn peek_blocked(&self) -> Result<Option<u64>> {
        let mut conn = self.conn.lock().await;
        let head: Vec<(String, u64)> = conn.zrange_withscores(self.blocked_key(), 0, 0).await?;
        Ok(head.first().map(|(_, score)| *score))
    }

    async fn pop_blocked(&self) -> Result<Option<(u64, BlockedCommand)>> {
        let mut conn = self.conn.lock().await;
        let popped: Vec<(String, u64)> = conn.zpopmin(self.blocked_key(), 1).await?;
        match popped.into_iter().next() {
            Some((raw, _)) => {
                let member: BlockedMember = serde_json::from_str(&raw)?;
                Ok(Some((member.sequence, member.command)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_creates_are_fifo_per_name() {
        let queue = MemoryQueue::new();
        queue.push_create(ObjectPayload::new("a", b"1".to_vec())).await.unwrap();
        queue.push_create(ObjectPayload::new("b", b"x".to_vec())).await.unwrap();
        queue.push_create(ObjectPayload::new("a", b"2".to_vec())).await.unwrap();

        assert_eq!(queue.pull_create("a").await.unwrap().unwrap().data, b"1".to_vec());
        assert_eq!(queue.pull_create("a").await.unwrap().unwrap().data, b"2".to_vec());
        assert!(queue.pull_create("a").await.unwrap().is_none());
        assert!(queue.pull_create("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_blocked_pops_lowest_sequence() {
        let queue = MemoryQueue::new();
        assert!(queue.peek_blocked().await.unwrap().is_none());

        queue
            .block(5, BlockedCommand::Delete { name: "a".to_string() })
            .await
            .unwrap();
        queue.block(3, BlockedCommand::Read).await.unwrap();

        assert_eq!(queue.peek_blocked().await.unwrap(), Some(3));
        assert_eq!(
            queue.pop_blocked().await.unwrap(),
            Some((3, BlockedCommand::Read))
        );
        assert_eq!(queue.peek_blocked().await.unwrap(), Some(5));
    }

    #[test]
    fn test_blocked_member_carries_sequence() {
        let member = BlockedMember {
            sequence: 4,
            command: BlockedCommand::Commit {
                name: "a".to_string(),
            },
        };
        let value = serde_json::to_value(&member).unwrap();
        assert_eq!(value["type"], "commit");
        assert_eq!(value["sequence"], 4);
        assert_eq!(value["name"], "a");
    }
}
