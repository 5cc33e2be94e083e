use crate::config::DispatchConfig;
use crate::db::models::{AlarmEvent, ChannelKind, Notification, NotificationStatus};
use crate::db::store::{ContactDirectory, NotificationStore};
use crate::error::Error;
use anyhow::Result;
use chrono::Utc;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub mod channel;

pub use channel::{ChannelAdapter, DeliveryOutcome, LogChannel};

/// Fans an alarm transition out to the subject's emergency contacts and
/// drives delivery per (recipient, channel) row with retry and backoff.
///
/// Delivery failure is reported on the notification row and never feeds back
/// into the alarm lifecycle; escalation is driven by actor inaction alone.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    contacts: Arc<dyn ContactDirectory>,
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
    config: DispatchConfig,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        contacts: Arc<dyn ContactDirectory>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            contacts,
            adapters: HashMap::new(),
            config,
        }
    }

    /// Register the adapter for one channel kind
    pub fn register_adapter(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Create and deliver notifications for one transition of one alarm.
    /// Recipients are the subject's enabled contacts whose alert_level is
    /// within the given escalation tier. Duplicate dispatch requests for the
    /// same (alarm, transition, recipient, channel) coalesce into the
    /// existing row. Returns the ids of the rows created.
    pub async fn dispatch(
        &self,
        alarm: &AlarmEvent,
        transition: &str,
        tier: i32,
    ) -> Result<Vec<Uuid>> {
        let contacts = self.contacts.contacts_for(alarm.subject_id).await?;
        let mut created = Vec::new();

        for contact in contacts
            .iter()
            .filter(|c| c.enabled && c.alert_level <= tier)
        {
            for channel in &contact.channels {
                if self
                    .store
                    .exists(alarm.id, transition, contact.id, *channel)
                    .await?
                {
                    debug!(
                        "Coalescing duplicate dispatch for alarm {} / {} / {} / {}",
                        alarm.id, transition, contact.id, channel
                    );
                    continue;
                }

                let notification = Notification {
                    id: Uuid::new_v4(),
                    alarm_id: alarm.id,
                    recipient_id: contact.id,
                    channel: *channel,
                    transition: transition.to_string(),
                    severity: alarm.event_type.severity() as i32,
                    status: NotificationStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    created_at: Utc::now(),
                    sent_at: None,
                    delivered_at: None,
                    acknowledged_at: None,
                    resolved_at: None,
                };
                self.store.insert(&notification).await?;
                created.push(notification.id);

                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher.deliver(notification).await;
                });
            }
        }

        Ok(created)
    }

    /// Delivery loop for one notification row. Claims the row before each
    /// attempt so two attempts never run concurrently, retries failures with
    /// exponential backoff up to the attempt cap, and retries throttles at a
    /// fixed interval without consuming attempts.
    pub async fn deliver(&self, mut notification: Notification) {
        loop {
            match self.store.claim_sending(notification.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Notification {} already claimed or settled; skipping",
                        notification.id
                    );
                    return;
                }
                Err(e) => {
                    warn!("Failed to claim notification {}: {}", notification.id, e);
                    return;
                }
            }
            notification.status = NotificationStatus::Sending;

            let adapter = match self.adapters.get(&notification.channel) {
                Some(adapter) => Arc::clone(adapter),
                None => {
                    notification.status = NotificationStatus::Failed;
                    notification.last_error = Some(
                        Error::Dispatch(format!(
                            "No adapter for channel {}",
                            notification.channel
                        ))
                        .to_string(),
                    );
                    notification.resolved_at = Some(Utc::now());
                    self.persist(&notification).await;
                    return;
                }
            };

            match adapter.send(&notification).await {
                DeliveryOutcome::Delivered => {
                    let now = Utc::now();
                    notification.attempts += 1;
                    notification.sent_at.get_or_insert(now);
                    notification.delivered_at = Some(now);
                    notification.status = NotificationStatus::Delivered;
                    self.persist(&notification).await;
                    return;
                }
                DeliveryOutcome::Throttled => {
                    notification.status = NotificationStatus::Pending;
                    self.persist(&notification).await;
                    tokio::time::sleep(Duration::from_millis(self.config.throttle_retry_ms)).await;
                }
                DeliveryOutcome::Failed(reason) => {
                    notification.attempts += 1;
                    notification.last_error = Some(reason);
                    if notification.attempts >= self.config.max_attempts as i32 {
                        notification.status = NotificationStatus::Failed;
                        notification.resolved_at = Some(Utc::now());
                        self.persist(&notification).await;
                        warn!(
                            "Notification {} failed terminally after {} attempts: {}; \
                             alarm {} lifecycle unaffected",
                            notification.id,
                            notification.attempts,
                            notification.last_error.as_deref().unwrap_or("unknown"),
                            notification.alarm_id
                        );
                        return;
                    }
                    notification.status = NotificationStatus::Pending;
                    self.persist(&notification).await;
                    tokio::time::sleep(self.backoff(notification.attempts)).await;
                }
            }
        }
    }

    /// Record a recipient acknowledgement for a delivered notification
    pub async fn acknowledge(&self, notification_id: Uuid, actor: Uuid) -> Result<Notification> {
        let mut notification = self
            .store
            .fetch(notification_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Notification {}", notification_id)))?;

        if notification.status != NotificationStatus::Delivered {
            return Err(Error::InvalidTransition(format!(
                "Notification {} is {}, not delivered",
                notification_id, notification.status
            ))
            .into());
        }

        let now = Utc::now();
        notification.status = NotificationStatus::Acknowledged;
        notification.acknowledged_at = Some(now.max(notification.delivered_at.unwrap_or(now)));
        self.store.update(&notification).await?;
        debug!(
            "Notification {} acknowledged by {}",
            notification_id, actor
        );
        Ok(notification)
    }

    /// Cancel all still-pending notifications of an alarm (on resolve/cancel)
    pub async fn stop_for_alarm(&self, alarm_id: Uuid) -> Result<u64> {
        let canceled = self.store.cancel_pending(alarm_id).await?;
        if canceled > 0 {
            debug!("Canceled {} pending notifications for alarm {}", canceled, alarm_id);
        }
        Ok(canceled)
    }

    fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16) as u32;
        let base = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.backoff_max_ms);
        let jitter = if self.config.backoff_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.backoff_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    async fn persist(&self, notification: &Notification) {
        if let Err(e) = self.store.update(notification).await {
            warn!(
                "Failed to persist notification {} state: {}",
                notification.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::models::EmergencyContact;
    use crate::detection::AlarmType;
    use crate::lifecycle::state::{ConfirmationState, LifecycleState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedAdapter {
        kind: ChannelKind,
        outcomes: std::sync::Mutex<Vec<DeliveryOutcome>>,
        sends: AtomicU32,
    }

    impl ScriptedAdapter {
        fn new(kind: ChannelKind, outcomes: Vec<DeliveryOutcome>) -> Self {
            Self {
                kind,
                outcomes: std::sync::Mutex::new(outcomes),
                sends: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, _notification: &Notification) -> DeliveryOutcome {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes[0].clone()
            }
        }
    }

    fn alarm(subject_id: Uuid) -> AlarmEvent {
        AlarmEvent {
            id: Uuid::new_v4(),
            subject_id,
            area_id: Uuid::new_v4(),
            camera_ids: vec![Uuid::new_v4()],
            event_type: AlarmType::Fall,
            confidence: 0.8,
            reliability: 0.8,
            lifecycle_state: LifecycleState::Active,
            confirmation_state: ConfirmationState::AwaitingConfirmation,
            created_at: Utc::now(),
            pending_until: None,
            escalation_count: 0,
            canceled: false,
            proposed_event_type: None,
            proposed_status: None,
            proposed_reason: None,
            last_actor: None,
            last_action_at: Utc::now(),
            context: serde_json::json!({}),
        }
    }

    fn contact(subject_id: Uuid, alert_level: i32, channels: Vec<ChannelKind>) -> EmergencyContact {
        EmergencyContact {
            id: Uuid::new_v4(),
            subject_id,
            name: "caregiver".to_string(),
            alert_level,
            channels,
            enabled: true,
        }
    }

    fn dispatcher(
        store: Arc<MemoryStore>,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
    ) -> Arc<NotificationDispatcher> {
        let mut dispatcher = NotificationDispatcher::new(
            store.clone(),
            store,
            DispatchConfig {
                backoff_jitter_ms: 0,
                ..DispatchConfig::default()
            },
        );
        for adapter in adapters {
            dispatcher.register_adapter(adapter);
        }
        Arc::new(dispatcher)
    }

    #[tokio::test]
    async fn dispatch_fans_out_per_recipient_and_channel() {
        let store = Arc::new(MemoryStore::new());
        let subject = Uuid::new_v4();
        store.add_contact(contact(subject, 0, vec![ChannelKind::Push, ChannelKind::Sms]));
        store.add_contact(contact(subject, 1, vec![ChannelKind::Voice]));
        let dispatcher = dispatcher(
            store.clone(),
            vec![Arc::new(ScriptedAdapter::new(
                ChannelKind::Push,
                vec![DeliveryOutcome::Delivered],
            ))],
        );
        let alarm = alarm(subject);

        // tier 0: only the first contact qualifies, on both of its channels
        let created = dispatcher.dispatch(&alarm, "created", 0).await.unwrap();
        assert_eq!(created.len(), 2);

        // tier 1 widens to the voice contact; existing rows coalesce
        let widened = dispatcher.dispatch(&alarm, "created", 1).await.unwrap();
        assert_eq!(widened.len(), 1);

        // re-dispatching the same transition creates nothing new
        let repeat = dispatcher.dispatch(&alarm, "created", 1).await.unwrap();
        assert!(repeat.is_empty());
        assert_eq!(store.notifications_for(alarm.id).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_retries_up_to_cap_then_marks_failed() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            ChannelKind::Push,
            vec![DeliveryOutcome::Failed("unreachable".to_string())],
        ));
        let dispatcher = dispatcher(store.clone(), vec![adapter.clone()]);
        let alarm = alarm(Uuid::new_v4());

        let notification = Notification {
            id: Uuid::new_v4(),
            alarm_id: alarm.id,
            recipient_id: Uuid::new_v4(),
            channel: ChannelKind::Push,
            transition: "created".to_string(),
            severity: 1,
            status: NotificationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
            acknowledged_at: None,
            resolved_at: None,
        };
        NotificationStore::insert(&*store, &notification).await.unwrap();

        dispatcher.deliver(notification.clone()).await;

        let row = NotificationStore::fetch(&*store, notification.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, NotificationStatus::Failed);
        assert_eq!(row.attempts, 3);
        assert_eq!(adapter.sends.load(Ordering::SeqCst), 3);
        assert_eq!(row.last_error.as_deref(), Some("unreachable"));
    }

    #[tokio::test]
    async fn missing_adapter_marks_the_row_failed() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(store.clone(), Vec::new());
        let alarm = alarm(Uuid::new_v4());

        let notification = Notification {
            id: Uuid::new_v4(),
            alarm_id: alarm.id,
            recipient_id: Uuid::new_v4(),
            channel: ChannelKind::Voice,
            transition: "created".to_string(),
            severity: 1,
            status: NotificationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
            acknowledged_at: None,
            resolved_at: None,
        };
        NotificationStore::insert(&*store, &notification).await.unwrap();

        dispatcher.deliver(notification.clone()).await;

        let row = NotificationStore::fetch(&*store, notification.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, NotificationStatus::Failed);
        assert!(row.resolved_at.is_some());
        assert!(row
            .last_error
            .as_deref()
            .unwrap()
            .contains("No adapter for channel voice"));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_retries_do_not_consume_attempts() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            ChannelKind::Sms,
            vec![
                DeliveryOutcome::Throttled,
                DeliveryOutcome::Throttled,
                DeliveryOutcome::Delivered,
            ],
        ));
        let dispatcher = dispatcher(store.clone(), vec![adapter.clone()]);

        let notification = Notification {
            id: Uuid::new_v4(),
            alarm_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            channel: ChannelKind::Sms,
            transition: "created".to_string(),
            severity: 2,
            status: NotificationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
            acknowledged_at: None,
            resolved_at: None,
        };
        NotificationStore::insert(&*store, &notification).await.unwrap();

        dispatcher.deliver(notification.clone()).await;

        let row = NotificationStore::fetch(&*store, notification.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, NotificationStatus::Delivered);
        assert_eq!(row.attempts, 1);
        assert_eq!(adapter.sends.load(Ordering::SeqCst), 3);
        assert!(row.delivered_at.unwrap() >= row.sent_at.unwrap());
        assert!(row.sent_at.unwrap() >= row.created_at);
    }

    #[tokio::test]
    async fn claimed_row_is_not_delivered_twice() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            ChannelKind::Push,
            vec![DeliveryOutcome::Delivered],
        ));
        let dispatcher = dispatcher(store.clone(), vec![adapter.clone()]);

        let notification = Notification {
            id: Uuid::new_v4(),
            alarm_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            channel: ChannelKind::Push,
            transition: "created".to_string(),
            severity: 1,
            status: NotificationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
            acknowledged_at: None,
            resolved_at: None,
        };
        NotificationStore::insert(&*store, &notification).await.unwrap();

        // another worker holds the claim
        assert!(NotificationStore::claim_sending(&*store, notification.id)
            .await
            .unwrap());
        dispatcher.deliver(notification.clone()).await;
        assert_eq!(adapter.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn acknowledge_requires_delivery_and_is_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            ChannelKind::Push,
            vec![DeliveryOutcome::Delivered],
        ));
        let dispatcher = dispatcher(store.clone(), vec![adapter]);

        let mut notification = Notification {
            id: Uuid::new_v4(),
            alarm_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            channel: ChannelKind::Push,
            transition: "created".to_string(),
            severity: 1,
            status: NotificationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
            acknowledged_at: None,
            resolved_at: None,
        };
        NotificationStore::insert(&*store, &notification).await.unwrap();

        // not yet delivered
        assert!(dispatcher
            .acknowledge(notification.id, Uuid::new_v4())
            .await
            .is_err());

        dispatcher.deliver(notification.clone()).await;
        notification = NotificationStore::fetch(&*store, notification.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.status, NotificationStatus::Delivered);

        let acknowledged = dispatcher
            .acknowledge(notification.id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(acknowledged.status, NotificationStatus::Acknowledged);
        assert!(acknowledged.acknowledged_at.unwrap() >= notification.delivered_at.unwrap());
    }
}
