use crate::db::models::{
    AlarmEvent, AlarmHistoryEntry, ChannelKind, EmergencyContact, Notification,
};
use crate::detection::AlarmType;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence contract for alarms. The store is the single source of truth
/// for the current projection and the append-only history; `commit` writes
/// both atomically per transition.
#[async_trait]
pub trait AlarmStore: Send + Sync {
    async fn fetch(&self, id: Uuid) -> Result<Option<AlarmEvent>>;

    /// Upsert the projection and append one history entry, transactionally
    async fn commit(&self, alarm: &AlarmEvent, entry: &AlarmHistoryEntry) -> Result<()>;

    /// Ordered history for one alarm id, in append order
    async fn history(&self, alarm_id: Uuid) -> Result<Vec<AlarmHistoryEntry>>;

    /// Armed deadlines of all non-terminal alarms, for scheduler rebuild
    async fn pending_deadlines(&self) -> Result<Vec<(Uuid, DateTime<Utc>)>>;

    /// Most recently dismissed alarm for the subject and type since `since`,
    /// used for the re-open-instead-of-duplicate path
    async fn find_recent_dismissed(
        &self,
        subject_id: Uuid,
        event_type: AlarmType,
        since: DateTime<Utc>,
    ) -> Result<Option<AlarmEvent>>;
}

/// Persistence contract for notification rows, owned by the dispatcher
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, notification: &Notification) -> Result<()>;

    async fn fetch(&self, id: Uuid) -> Result<Option<Notification>>;

    async fn update(&self, notification: &Notification) -> Result<()>;

    /// Compare-and-set pending -> sending; false when the row is already
    /// claimed or terminal, so no two attempts run concurrently
    async fn claim_sending(&self, id: Uuid) -> Result<bool>;

    /// Whether a row already exists for the dispatch dedup key
    async fn exists(
        &self,
        alarm_id: Uuid,
        transition: &str,
        recipient_id: Uuid,
        channel: ChannelKind,
    ) -> Result<bool>;

    /// Cancel all pending rows for an alarm; returns the number canceled
    async fn cancel_pending(&self, alarm_id: Uuid) -> Result<u64>;
}

/// Read-only lookup of a subject's emergency contacts
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contacts_for(&self, subject_id: Uuid) -> Result<Vec<EmergencyContact>>;
}
