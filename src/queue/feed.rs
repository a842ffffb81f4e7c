//! Broadcast of committed status transitions

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use super::types::{CommandId, CommandKind, CommandRecord, CommandStatus, UplinkId};

const DEFAULT_CAPACITY: usize = 256;

/// One committed status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandTransition {
    pub kind: CommandKind,
    pub id: CommandId,
    /// `None` for newly enqueued items
    pub from: Option<CommandStatus>,
    pub to: CommandStatus,
    pub delivered_in: Option<UplinkId>,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

impl CommandTransition {
    pub(crate) fn of(record: &CommandRecord, from: Option<CommandStatus>) -> Self {
        Self {
            kind: record.kind,
            id: record.id,
            from,
            to: record.status,
            delivered_in: record.delivered_in,
            error_message: record.error_message.clone(),
            at: record.updated_at,
        }
    }
}

/// Fan-out of transitions to any number of subscribers.
///
/// Slow subscribers that fall behind the channel capacity skip the missed
/// transitions instead of blocking queue operations.
#[derive(Debug, Clone)]
pub struct TransitionFeed {
    sender: broadcast::Sender<CommandTransition>,
}

impl TransitionFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, transition: CommandTransition) {
        trace!(
            "{} #{}: {:?} -> {}",
            transition.kind, transition.id, transition.from, transition.to
        );
        // No subscribers is fine
        let _ = self.sender.send(transition);
    }

    pub fn subscribe(&self) -> impl Stream<Item = CommandTransition> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| async move { item.ok() })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TransitionFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
