//! In-process change feed for the capstan settings store.
//!
//! Every committed settings mutation publishes a [`SettingsChange`] on a
//! [`ChangeBus`] built over `tokio::broadcast`. The feed is a liveliness
//! signal, not a log: delivery is at-least-once while a subscriber keeps up,
//! nothing is replayed, and a subscriber that falls behind receives a
//! [`SettingsEvent::Lagged`] marker so it can recover by re-reading the
//! revision counter directly.

use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};

/// Default broadcast capacity; generous for administrative-cadence changes.
const DEFAULT_CAPACITY: usize = 256;

/// Row mutation kind carried by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    /// Rows were inserted.
    Insert,
    /// Rows were updated or replaced in place.
    Update,
    /// Rows were deleted.
    Delete,
}

impl ChangeOp {
    /// Wire label for the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Record emitted after a watched settings table changes.
///
/// All records queued by one mutating call share a single `revision`;
/// revisions are monotonic at publish time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SettingsChange {
    /// Watched table the mutation touched, e.g. `app_profile`.
    pub table: String,
    /// Revision the owning transaction committed at.
    pub revision: i64,
    /// Kind of row mutation.
    pub operation: ChangeOp,
}

/// Item yielded by a [`SettingsStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsEvent {
    /// A change record delivered in publish order.
    Change(SettingsChange),
    /// The subscriber fell behind and the given number of records were
    /// dropped; re-read the revision counter to resynchronise.
    Lagged(u64),
}

/// Shared fan-out bus for settings change records.
#[derive(Clone)]
pub struct ChangeBus {
    sender: Sender<SettingsChange>,
}

impl ChangeBus {
    /// Construct a bus with a custom channel capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Construct a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Publish a change record to all current subscribers.
    ///
    /// Publishing never blocks; with no subscribers the record is dropped.
    pub fn publish(&self, change: SettingsChange) {
        if self.sender.send(change).is_err() {
            tracing::trace!("settings change dropped: no subscribers");
        }
    }

    /// Subscribe to change records published after this call.
    #[must_use]
    pub fn subscribe(&self) -> SettingsStream {
        SettingsStream {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the change feed.
pub struct SettingsStream {
    receiver: Receiver<SettingsChange>,
}

impl SettingsStream {
    /// Receive the next feed item, or `None` once every bus handle has been
    /// dropped.
    pub async fn next(&mut self) -> Option<SettingsEvent> {
        match self.receiver.recv().await {
            Ok(change) => Some(SettingsEvent::Change(change)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(SettingsEvent::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// High-level torrent states mirrored by the runtime status cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    /// Accepted but not yet started.
    Queued,
    /// Resolving metadata before any payload transfer.
    FetchingMetadata,
    /// Actively downloading payload data.
    Downloading,
    /// Download finished; uploading to peers.
    Seeding,
    /// All payload data downloaded and finalised.
    Completed,
    /// The engine reported a fatal error for this torrent.
    Failed {
        /// Failure detail reported by the engine.
        message: String,
    },
    /// Paused or stopped by request.
    Stopped,
}

impl TorrentState {
    /// Stable label for persistence and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::FetchingMetadata => "fetching_metadata",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(revision: i64) -> SettingsChange {
        SettingsChange {
            table: "app_profile".to_string(),
            revision,
            operation: ChangeOp::Update,
        }
    }

    #[tokio::test]
    async fn delivers_changes_in_publish_order() {
        let bus = ChangeBus::with_capacity(16);
        let mut stream = bus.subscribe();

        for revision in 1..=3 {
            bus.publish(change(revision));
        }

        for expected in 1..=3 {
            let event = stream.next().await.expect("stream should stay open");
            assert_eq!(event, SettingsEvent::Change(change(expected)));
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_sees_marker_then_latest() {
        let bus = ChangeBus::with_capacity(2);
        let mut stream = bus.subscribe();

        for revision in 1..=5 {
            bus.publish(change(revision));
        }

        let first = stream.next().await.expect("stream should stay open");
        assert!(matches!(first, SettingsEvent::Lagged(skipped) if skipped > 0));

        let mut last_seen = None;
        while let Some(SettingsEvent::Change(item)) = stream.next().await {
            last_seen = Some(item.revision);
            if last_seen == Some(5) {
                break;
            }
        }
        assert_eq!(last_seen, Some(5));
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus = ChangeBus::new();
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = ChangeBus::new();
        bus.publish(change(1));
    }

    #[test]
    fn change_op_wire_labels_are_stable() {
        assert_eq!(ChangeOp::Insert.as_str(), "INSERT");
        assert_eq!(ChangeOp::Update.as_str(), "UPDATE");
        assert_eq!(ChangeOp::Delete.as_str(), "DELETE");
        let encoded = serde_json::to_string(&ChangeOp::Delete).expect("serialize");
        assert_eq!(encoded, "\"DELETE\"");
    }

    #[test]
    fn torrent_state_labels_are_stable() {
        assert_eq!(TorrentState::Queued.label(), "queued");
        assert_eq!(TorrentState::FetchingMetadata.label(), "fetching_metadata");
        assert_eq!(
            TorrentState::Failed {
                message: "tracker unreachable".to_string(),
            }
            .label(),
            "failed"
        );
        let encoded = serde_json::to_string(&TorrentState::Seeding).expect("serialize");
        assert_eq!(encoded, "\"seeding\"");
    }
}
