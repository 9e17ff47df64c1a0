//! # Event Bus
//!
//! Progress events for the sync pipeline over `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The pipeline itself is single-threaded and synchronous; it emits events
//! with the non-blocking [`EventBus::emit`] between items. A host runs the
//! pipeline on a background thread and consumes the stream asynchronously
//! (or with `try_recv` from another thread). Slow subscribers lag rather
//! than block the pipeline.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::events::{EventBus, SyncEvent, SyncStage};
//!
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(SyncEvent::StageStarted { stage: SyncStage::Remove, total: 3 });
//! assert!(matches!(rx.try_recv(), Ok(SyncEvent::StageStarted { .. })));
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// The pipeline stage an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Integrity,
    Scan,
    Fingerprint,
    Diff,
    Remove,
    UpdateFile,
    UpdateMetadata,
    Add,
    PlayCounts,
    Ratings,
    Artwork,
    WriteDatabase,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Integrity => "integrity",
            SyncStage::Scan => "scan",
            SyncStage::Fingerprint => "fingerprint",
            SyncStage::Diff => "diff",
            SyncStage::Remove => "remove",
            SyncStage::UpdateFile => "update_file",
            SyncStage::UpdateMetadata => "update_metadata",
            SyncStage::Add => "add",
            SyncStage::PlayCounts => "play_counts",
            SyncStage::Ratings => "ratings",
            SyncStage::Artwork => "artwork",
            SyncStage::WriteDatabase => "write_database",
        }
    }
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events emitted over the course of one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Started,
    StageStarted {
        stage: SyncStage,
        total: usize,
    },
    Progress {
        stage: SyncStage,
        current: usize,
        total: usize,
        item: String,
    },
    StageFinished {
        stage: SyncStage,
    },
    Completed,
    Failed {
        message: String,
    },
    Cancelled,
}

/// Broadcast channel for [`SyncEvent`]s.
///
/// Cloning the bus clones the sender; every subscriber receives every event
/// emitted after it subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event. A send with no live subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.emit(SyncEvent::Started);
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::Started);
        bus.emit(SyncEvent::StageStarted {
            stage: SyncStage::Diff,
            total: 10,
        });

        assert!(matches!(rx.try_recv(), Ok(SyncEvent::Started)));
        match rx.try_recv() {
            Ok(SyncEvent::StageStarted { stage, total }) => {
                assert_eq!(stage, SyncStage::Diff);
                assert_eq!(total, 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(16);
        bus.emit(SyncEvent::Started);

        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::Completed);

        assert!(matches!(rx.try_recv(), Ok(SyncEvent::Completed)));
        assert!(rx.try_recv().is_err());
    }
}
