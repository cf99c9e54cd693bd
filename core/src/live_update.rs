/// Per-task live update channels.
///
/// Each running task owns one broadcast channel. Publishing never blocks and
/// silently drops events nobody is listening for; clients that miss events
/// catch up through the task's stored history.
use crate::session::{Message, MessageRole, Task, TaskStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Events buffered per subscriber before it starts lagging
const CHANNEL_CAPACITY: usize = 256;

/// Event pushed to live subscribers of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveUpdateEvent {
    Message {
        content: serde_json::Value,
        message_type: String,
        role: MessageRole,
        timestamp: DateTime<Utc>,
    },
    TaskUpdate {
        task: Task,
    },
    TaskComplete {
        status: TaskStatus,
    },
    Error {
        message: String,
    },
    /// Greeting sent once per connection, before any live event
    Connected {
        task_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl LiveUpdateEvent {
    pub fn message(message: &Message) -> Self {
        LiveUpdateEvent::Message {
            content: message.content.clone(),
            message_type: message.message_type.clone(),
            role: message.role,
            timestamp: message.timestamp,
        }
    }

    pub fn task_update(task: &Task) -> Self {
        LiveUpdateEvent::TaskUpdate {
            task: task.summary(),
        }
    }

    pub fn connected(task_id: Uuid) -> Self {
        LiveUpdateEvent::Connected {
            task_id,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LiveUpdateEvent::TaskComplete { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failed: {}"}}"#, e)
        })
    }
}

/// Registry of open task channels.
#[derive(Debug, Default)]
pub struct LiveUpdateHub {
    channels: DashMap<Uuid, broadcast::Sender<LiveUpdateEvent>>,
}

impl LiveUpdateHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the channel for `task_id`. Reopening an open channel keeps it.
    pub fn open(&self, task_id: Uuid) {
        self.channels
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
    }

    /// Deliver `event` to current subscribers, dropping it if there are none.
    pub fn publish(&self, task_id: Uuid, event: LiveUpdateEvent) {
        if let Some(sender) = self.channels.get(&task_id) {
            if sender.send(event).is_err() {
                debug!("No live subscribers for task {}", task_id);
            }
        }
    }

    /// Receiver for an open channel; `None` once the task has finished.
    pub fn subscribe(&self, task_id: Uuid) -> Option<broadcast::Receiver<LiveUpdateEvent>> {
        self.channels.get(&task_id).map(|sender| sender.subscribe())
    }

    /// Close the channel; subscribers see end-of-stream after draining.
    pub fn close(&self, task_id: Uuid) {
        self.channels.remove(&task_id);
    }

    pub fn subscriber_count(&self, task_id: Uuid) -> usize {
        self.channels
            .get(&task_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StartTaskRequest;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn test_event_wire_format() {
        let event = LiveUpdateEvent::TaskComplete {
            status: TaskStatus::Error,
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["type"], "task_complete");
        assert_eq!(json["status"], "error");

        let message = Message::text(MessageRole::Assistant, "Listing files");
        let json = serde_json::to_value(LiveUpdateEvent::message(&message)).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "Listing files");
        assert_eq!(json["message_type"], "text");

        let task = Task::new(Uuid::new_v4(), StartTaskRequest::new("list files"));
        let json = serde_json::to_value(LiveUpdateEvent::task_update(&task)).unwrap();
        assert_eq!(json["type"], "task_update");
        assert_eq!(json["task"]["status"], "pending");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let hub = LiveUpdateHub::new();
        let task_id = Uuid::new_v4();

        // Neither an unopened nor an unobserved channel errors
        hub.publish(task_id, LiveUpdateEvent::Error { message: "x".into() });
        hub.open(task_id);
        hub.publish(task_id, LiveUpdateEvent::Error { message: "y".into() });

        let mut rx = hub.subscribe(task_id).unwrap();
        hub.publish(task_id, LiveUpdateEvent::Error { message: "z".into() });
        assert_eq!(
            rx.recv().await.unwrap(),
            LiveUpdateEvent::Error { message: "z".into() }
        );
    }

    #[tokio::test]
    async fn test_close_ends_stream_after_draining() {
        let hub = LiveUpdateHub::new();
        let task_id = Uuid::new_v4();
        hub.open(task_id);
        let mut rx = hub.subscribe(task_id).unwrap();
        assert_eq!(hub.subscriber_count(task_id), 1);

        hub.publish(task_id, LiveUpdateEvent::TaskComplete { status: TaskStatus::Completed });
        hub.close(task_id);

        assert!(rx.recv().await.unwrap().is_terminal());
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert!(hub.subscribe(task_id).is_none());
        assert_eq!(hub.open_channels(), 0);
    }
}
