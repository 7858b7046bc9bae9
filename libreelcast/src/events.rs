//! Progress events for publish tasks
//!
//! The engine emits events on an in-process broadcast bus so embedders (the
//! CLI's `--wait` mode, a websocket bridge, tests) can follow a task without
//! polling the store.
//!
//! # Non-Blocking Behavior
//!
//! If nobody is subscribed, events are dropped immediately. Lagging
//! subscribers lose the oldest events; emitters never wait.
//!
//! # Example
//!
//! ```no_run
//! use libreelcast::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::TaskCancelled { task_id: "abc123".to_string() });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{PlatformId, PublishRecord, PublishStats, TaskStatus};

pub type EventReceiver = broadcast::Receiver<Event>;

/// Broadcast bus for engine events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before lagging receivers drop events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means there are no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task accepted and its sub-jobs enqueued
    TaskSubmitted {
        task_id: String,
        platforms: Vec<PlatformId>,
    },

    /// A worker picked up a sub-job; `attempt` is 1-based
    AttemptStarted {
        task_id: String,
        platform: PlatformId,
        attempt: u32,
    },

    /// A sub-job will run again after `delay_ms`
    RetryScheduled {
        task_id: String,
        platform: PlatformId,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },

    /// A record was written after an attempt
    RecordUpdated { record: PublishRecord },

    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    TaskCancelled { task_id: String },

    /// An account must be connected again before it can publish
    ReauthorizationRequired {
        account_id: String,
        platform: PlatformId,
        reason: String,
    },

    /// Fresh per-account stats, emitted whenever a record becomes terminal
    StatsUpdated {
        account_id: String,
        stats: PublishStats,
    },
}

impl Event {
    /// Task the event belongs to, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskSubmitted { task_id, .. }
            | Event::AttemptStarted { task_id, .. }
            | Event::RetryScheduled { task_id, .. }
            | Event::TaskStatusChanged { task_id, .. }
            | Event::TaskCancelled { task_id } => Some(task_id),
            Event::RecordUpdated { record } => Some(&record.task_id),
            Event::ReauthorizationRequired { .. } | Event::StatsUpdated { .. } => None,
        }
    }
}
