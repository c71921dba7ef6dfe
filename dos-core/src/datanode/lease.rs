use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    Create,
    Update,
    Delete,
}

impl LeaseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseEvent::Create => "create",
            LeaseEvent::Update => "update",
            LeaseEvent::Delete => "delete",
        }
    }
}

/// One committed mutation, as seen by lease holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseNotification {
    pub object_name: String,
    pub event: LeaseEvent,
    pub revision: i64,
    pub payload: Option<Vec<u8>>,
}

impl LeaseNotification {
    pub fn created(object_name: &str, revision: i64, data: &[u8]) -> Self {
        Self {
            object_name: object_name.to_string(),
            event: LeaseEvent::Create,
            revision,
            payload: Some(data.to_vec()),
        }
    }

    pub fn updated(object_name: &str, revision: i64, data: &[u8]) -> Self {
        Self {
            object_name: object_name.to_string(),
            event: LeaseEvent::Update,
            revision,
            payload: Some(data.to_vec()),
        }
    }

    pub fn deleted(object_name: &str, revision: i64) -> Self {
        Self {
            object_name: object_name.to_string(),
            event: LeaseEvent::Delete,
            revision,
            payload: None,
        }
    }

    /// `<object>:<event>`
    pub fn topic(&self) -> String {
        format!("{}:{}", self.object_name, self.event.as_str())
    }

    /// `<topic> <revision>` followed by the base64 payload when there is one.
    pub fn message(&self) -> String {
        match &self.payload {
            Some(data) => format!("{} {} {}", self.topic(), self.revision, STANDARD.encode(data)),
            None => format!("{} {}", self.topic(), self.revision),
        }
    }
}

pub trait LeasePublisher: Send + Sync {
    fn publish(&self, notification: LeaseNotification);
}

/// In-process fan-out to lease subscribers. Slow subscribers lag and drop
/// messages rather than holding up the command loop.
pub struct LeaseHub {
    sender: broadcast::Sender<LeaseNotification>,
}

impl LeaseHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseNotification> {
        self.sender.subscribe()
    }
}

impl Default for LeaseHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LeasePublisher for LeaseHub {
    fn publish(&self, notification: LeaseNotification) {
        tracing::debug!("lease {}", notification.topic());
        let _ = self.sender.send(notification);
    }
}

/// Keeps every notification. Handy for inspecting what a node published.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<LeaseNotification>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<LeaseNotification> {
        match self.published.lock() {
            Ok(published) => published.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl LeasePublisher for RecordingPublisher {
    fn publish(&self, notification: LeaseNotification) {
        match self.published.lock() {
            Ok(mut published) => published.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}
