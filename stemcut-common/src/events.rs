//! Service event types and broadcast bus
//!
//! Events feed the `/events` SSE stream. Emission never blocks and never
//! fails the caller when nobody is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while tracks move through the service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceEvent {
    /// Operator-facing log line
    LogLine {
        session_id: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// A queue item changed status or progress
    QueueItemUpdated {
        filename: String,
        status: String,
        progress: u8,
        step: String,
        worker: Option<usize>,
    },

    /// All edits for a track were written and reported
    TrackCompleted {
        track_name: String,
        files: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A track failed after all retry attempts
    TrackFailed {
        filename: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A track's files were deleted (confirmation, expiry, or cleanup)
    TrackDeleted {
        track_name: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Pending count crossed a warning level
    PendingWarning {
        level: String,
        count: usize,
        message: String,
    },
}

impl ServiceEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            ServiceEvent::LogLine { .. } => "LogLine",
            ServiceEvent::QueueItemUpdated { .. } => "QueueItemUpdated",
            ServiceEvent::TrackCompleted { .. } => "TrackCompleted",
            ServiceEvent::TrackFailed { .. } => "TrackFailed",
            ServiceEvent::TrackDeleted { .. } => "TrackDeleted",
            ServiceEvent::PendingWarning { .. } => "PendingWarning",
        }
    }
}

/// Broadcast bus for [`ServiceEvent`]
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; returns the number of subscribers that received it
    pub fn emit(&self, event: ServiceEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
