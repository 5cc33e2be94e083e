use crate::db::models::{ChannelKind, Notification};
use async_trait::async_trait;
use log::info;

/// Result of one delivery attempt by an external channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
    /// Channel asked us to slow down; retried without counting as a failure
    Throttled,
}

/// Contract with the external delivery collaborators (push/SMS/voice/email).
/// One adapter per channel kind; adapters may block on network calls, which is
/// why delivery runs on its own task.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(&self, notification: &Notification) -> DeliveryOutcome;
}

/// Development adapter that only logs. Useful until real channel integrations
/// are wired in.
pub struct LogChannel {
    kind: ChannelKind,
}

impl LogChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ChannelAdapter for LogChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, notification: &Notification) -> DeliveryOutcome {
        info!(
            "[{}] alert for alarm {} to recipient {} ({})",
            self.kind, notification.alarm_id, notification.recipient_id, notification.transition
        );
        DeliveryOutcome::Delivered
    }
}
