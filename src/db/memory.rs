use crate::db::models::{
    AlarmEvent, AlarmHistoryEntry, ChannelKind, EmergencyContact, Notification,
    NotificationStatus,
};
use crate::db::store::{AlarmStore, ContactDirectory, NotificationStore};
use crate::detection::AlarmType;
use crate::lifecycle::state::ConfirmationState;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// In-memory store implementing all persistence contracts. Backs engine and
/// dispatcher tests and local development without a PostgreSQL instance.
#[derive(Default)]
pub struct MemoryStore {
    alarms: Mutex<HashMap<Uuid, AlarmEvent>>,
    history: Mutex<Vec<AlarmHistoryEntry>>,
    notifications: Mutex<HashMap<Uuid, Notification>>,
    contacts: Mutex<Vec<EmergencyContact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_contact(&self, contact: EmergencyContact) {
        self.contacts.lock().unwrap().push(contact);
    }

    pub fn notifications_for(&self, alarm_id: Uuid) -> Vec<Notification> {
        let mut rows: Vec<Notification> = self
            .notifications
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.alarm_id == alarm_id)
            .cloned()
            .collect();
        rows.sort_by_key(|n| n.created_at);
        rows
    }

    pub fn all_notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl AlarmStore for MemoryStore {
    async fn fetch(&self, id: Uuid) -> Result<Option<AlarmEvent>> {
        Ok(self.alarms.lock().unwrap().get(&id).cloned())
    }

    async fn commit(&self, alarm: &AlarmEvent, entry: &AlarmHistoryEntry) -> Result<()> {
        let mut alarms = self.alarms.lock().unwrap();
        let mut history = self.history.lock().unwrap();
        alarms.insert(alarm.id, alarm.clone());
        history.push(entry.clone());
        Ok(())
    }

    async fn history(&self, alarm_id: Uuid) -> Result<Vec<AlarmHistoryEntry>> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.alarm_id == alarm_id)
            .cloned()
            .collect())
    }

    async fn pending_deadlines(&self) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        Ok(self
            .alarms
            .lock()
            .unwrap()
            .values()
            .filter(|a| !a.is_terminal())
            .filter_map(|a| a.pending_until.map(|deadline| (a.id, deadline)))
            .collect())
    }

    async fn find_recent_dismissed(
        &self,
        subject_id: Uuid,
        event_type: AlarmType,
        since: DateTime<Utc>,
    ) -> Result<Option<AlarmEvent>> {
        Ok(self
            .alarms
            .lock()
            .unwrap()
            .values()
            .filter(|a| {
                a.subject_id == subject_id
                    && a.event_type == event_type
                    && a.confirmation_state == ConfirmationState::Dismissed
                    && !a.canceled
                    && a.last_action_at >= since
            })
            .max_by_key(|a| a.last_action_at)
            .cloned())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.notifications.lock().unwrap().get(&id).cloned())
    }

    async fn update(&self, notification: &Notification) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn claim_sending(&self, id: Uuid) -> Result<bool> {
        let mut notifications = self.notifications.lock().unwrap();
        match notifications.get_mut(&id) {
            Some(n) if n.status == NotificationStatus::Pending => {
                n.status = NotificationStatus::Sending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(
        &self,
        alarm_id: Uuid,
        transition: &str,
        recipient_id: Uuid,
        channel: ChannelKind,
    ) -> Result<bool> {
        Ok(self.notifications.lock().unwrap().values().any(|n| {
            n.alarm_id == alarm_id
                && n.transition == transition
                && n.recipient_id == recipient_id
                && n.channel == channel
        }))
    }

    async fn cancel_pending(&self, alarm_id: Uuid) -> Result<u64> {
        let mut notifications = self.notifications.lock().unwrap();
        let mut canceled = 0;
        for n in notifications.values_mut() {
            if n.alarm_id == alarm_id && n.status == NotificationStatus::Pending {
                n.status = NotificationStatus::Canceled;
                n.resolved_at = Some(Utc::now());
                canceled += 1;
            }
        }
        Ok(canceled)
    }
}

#[async_trait]
impl ContactDirectory for MemoryStore {
    async fn contacts_for(&self, subject_id: Uuid) -> Result<Vec<EmergencyContact>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.subject_id == subject_id)
            .cloned()
            .collect())
    }
}
