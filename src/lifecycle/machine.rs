use crate::config::LifecycleConfig;
use crate::db::models::{AlarmEvent, AlarmHistoryEntry};
use crate::db::store::AlarmStore;
use crate::detection::{AlarmRequest, AlarmType};
use crate::dispatch::NotificationDispatcher;
use crate::error::Error;
use crate::fusion::FusionEngine;
use crate::lifecycle::state::{actions, ConfirmationState, LifecycleState};
use crate::messaging::broker::MessageBrokerTrait;
use crate::messaging::event::EventType;
use crate::scheduler::{DeadlineHandler, DeadlineScheduler};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Drives every alarm through its lifecycle. All transitions funnel through
/// this engine, which serializes them per alarm id, persists the new
/// projection together with exactly one history entry, and only then performs
/// side effects (timer arming, event publishing, notification fan-out).
///
/// An illegal transition is rejected with `InvalidTransition` and leaves no
/// trace in the history.
pub struct LifecycleEngine {
    store: Arc<dyn AlarmStore>,
    scheduler: Arc<DeadlineScheduler>,
    dispatcher: Arc<NotificationDispatcher>,
    broker: Option<Arc<dyn MessageBrokerTrait>>,
    fusion: Option<Arc<FusionEngine>>,
    config: LifecycleConfig,
    // per-alarm transition locks; entries are tiny and never reaped
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        scheduler: Arc<DeadlineScheduler>,
        dispatcher: Arc<NotificationDispatcher>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            dispatcher,
            broker: None,
            fusion: None,
            config,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Attach the broker used to broadcast transitions
    pub fn with_broker(mut self, broker: Arc<dyn MessageBrokerTrait>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Attach the fusion engine so actor verdicts feed camera reliability
    pub fn with_fusion(mut self, fusion: Arc<FusionEngine>) -> Self {
        self.fusion = Some(fusion);
        self
    }

    /// Admit a fused alarm request as a new alarm, or re-open a recently
    /// dismissed alarm of the same subject and type. New alarms start their
    /// severity-dependent confirmation window; a re-open escalates instead, on
    /// the theory that a repeat detection contradicts the dismissal.
    pub async fn create(&self, request: AlarmRequest) -> Result<AlarmEvent> {
        if !(0.0..=1.0).contains(&request.confidence) || request.confidence.is_nan() {
            return Err(Error::InvalidInput(format!(
                "Alarm confidence out of range: {}",
                request.confidence
            ))
            .into());
        }

        let now = Utc::now();
        let since = now - Duration::seconds(self.config.dismissal_cooldown_secs as i64);
        if let Some(prior) = self
            .store
            .find_recent_dismissed(request.subject_id, request.event_type, since)
            .await?
        {
            info!(
                "Repeat {} detection within cool-down; re-opening alarm {}",
                request.event_type, prior.id
            );
            return self.reopen(prior.id, &request).await;
        }

        let id = Uuid::new_v4();
        let _guard = self.lock(id).await;
        let pending_until = now + self.confirmation_window(request.event_type);
        let alarm = AlarmEvent {
            id,
            subject_id: request.subject_id,
            area_id: request.area_id,
            camera_ids: request.camera_ids.clone(),
            event_type: request.event_type,
            confidence: request.confidence,
            reliability: request.reliability,
            lifecycle_state: LifecycleState::Active,
            confirmation_state: ConfirmationState::AwaitingConfirmation,
            created_at: now,
            pending_until: Some(pending_until),
            escalation_count: 0,
            canceled: false,
            proposed_event_type: None,
            proposed_status: None,
            proposed_reason: None,
            last_actor: None,
            last_action_at: now,
            context: request.context.clone(),
        };
        let prev = (
            LifecycleState::Detected,
            ConfirmationState::AwaitingConfirmation,
        );
        let entry = Self::entry(&alarm, actions::CREATED, None, prev, None, None);
        self.store.commit(&alarm, &entry).await?;

        self.scheduler.arm(id, pending_until);
        self.publish(EventType::AlarmRaised, &alarm, prev).await;
        self.notify(&alarm, actions::CREATED).await;
        info!(
            "Alarm {} raised: {} for subject {} (confidence {:.2}, reliability {:.2})",
            alarm.id, alarm.event_type, alarm.subject_id, alarm.confidence, alarm.reliability
        );
        Ok(alarm)
    }

    /// Caregiver confirms the alarm is a real incident
    pub async fn confirm(
        &self,
        alarm_id: Uuid,
        actor: Uuid,
        reason: Option<String>,
    ) -> Result<AlarmEvent> {
        let _guard = self.lock(alarm_id).await;
        let mut alarm = self.load(alarm_id).await?;
        Self::ensure_open(&alarm)?;
        if !alarm.confirmation_state.accepts_actor_decision() {
            return Err(Error::InvalidTransition(format!(
                "Cannot confirm alarm {} in state {}",
                alarm_id, alarm.confirmation_state
            ))
            .into());
        }

        let prev = (alarm.lifecycle_state, alarm.confirmation_state);
        let now = Utc::now();
        let response_ms = (now - alarm.last_action_at).num_milliseconds();
        alarm.confirmation_state = ConfirmationState::Confirmed;
        alarm.pending_until = None;
        Self::clear_proposal(&mut alarm);
        alarm.last_actor = Some(actor);
        alarm.last_action_at = now;
        let entry = Self::entry(
            &alarm,
            actions::CONFIRMED,
            Some(actor),
            prev,
            reason,
            Some(response_ms),
        );
        self.store.commit(&alarm, &entry).await?;

        self.scheduler.disarm(alarm_id);
        if let Some(fusion) = &self.fusion {
            fusion.record_outcome(&alarm.camera_ids, false);
        }
        self.publish(EventType::AlarmConfirmed, &alarm, prev).await;
        self.notify(&alarm, actions::CONFIRMED).await;
        Ok(alarm)
    }

    /// Caregiver dismisses the alarm as a false positive. The alarm closes
    /// but stays re-openable by a repeat detection for the cool-down period.
    pub async fn dismiss(
        &self,
        alarm_id: Uuid,
        actor: Uuid,
        reason: Option<String>,
    ) -> Result<AlarmEvent> {
        let _guard = self.lock(alarm_id).await;
        let mut alarm = self.load(alarm_id).await?;
        Self::ensure_open(&alarm)?;
        if !alarm.confirmation_state.accepts_actor_decision() {
            return Err(Error::InvalidTransition(format!(
                "Cannot dismiss alarm {} in state {}",
                alarm_id, alarm.confirmation_state
            ))
            .into());
        }

        let prev = (alarm.lifecycle_state, alarm.confirmation_state);
        let now = Utc::now();
        let response_ms = (now - alarm.last_action_at).num_milliseconds();
        alarm.lifecycle_state = LifecycleState::Resolved;
        alarm.confirmation_state = ConfirmationState::Dismissed;
        alarm.pending_until = None;
        Self::clear_proposal(&mut alarm);
        alarm.last_actor = Some(actor);
        alarm.last_action_at = now;
        let entry = Self::entry(
            &alarm,
            actions::DISMISSED,
            Some(actor),
            prev,
            reason,
            Some(response_ms),
        );
        self.store.commit(&alarm, &entry).await?;

        self.scheduler.disarm(alarm_id);
        if let Some(fusion) = &self.fusion {
            fusion.record_outcome(&alarm.camera_ids, true);
        }
        if let Err(e) = self.dispatcher.stop_for_alarm(alarm_id).await {
            warn!("Failed to stop notifications for alarm {}: {}", alarm_id, e);
        }
        self.publish(EventType::AlarmDismissed, &alarm, prev).await;
        self.notify(&alarm, actions::DISMISSED).await;
        Ok(alarm)
    }

    /// Propose an amendment to the alarm's type and/or final status. The
    /// alarm moves into arbitration until a second actor accepts or rejects,
    /// or the arbitration window elapses. A newer proposal replaces the
    /// current one; each gets its own history entry.
    pub async fn propose(
        &self,
        alarm_id: Uuid,
        actor: Uuid,
        proposed_type: Option<AlarmType>,
        proposed_status: Option<ConfirmationState>,
        reason: String,
    ) -> Result<AlarmEvent> {
        if proposed_type.is_none() && proposed_status.is_none() {
            return Err(
                Error::InvalidInput("Proposal must amend the type or the status".to_string())
                    .into(),
            );
        }
        if let Some(status) = proposed_status {
            if !matches!(
                status,
                ConfirmationState::Confirmed | ConfirmationState::Dismissed
            ) {
                return Err(Error::InvalidInput(format!(
                    "Cannot propose target status {}",
                    status
                ))
                .into());
            }
        }

        // any open alarm can be proposed against, including one already
        // confirmed or escalated; only a closed alarm is off limits
        let _guard = self.lock(alarm_id).await;
        let mut alarm = self.load(alarm_id).await?;
        Self::ensure_open(&alarm)?;

        let prev = (alarm.lifecycle_state, alarm.confirmation_state);
        let now = Utc::now();
        alarm.confirmation_state = ConfirmationState::AwaitingArbitration;
        alarm.proposed_event_type = proposed_type;
        alarm.proposed_status = proposed_status;
        alarm.proposed_reason = Some(reason.clone());
        alarm.pending_until =
            Some(now + Duration::seconds(self.config.arbitration_window_secs as i64));
        alarm.last_actor = Some(actor);
        alarm.last_action_at = now;
        let entry = Self::entry(
            &alarm,
            actions::PROPOSED,
            Some(actor),
            prev,
            Some(reason),
            None,
        );
        self.store.commit(&alarm, &entry).await?;

        if let Some(deadline) = alarm.pending_until {
            self.scheduler.arm(alarm_id, deadline);
        }
        self.publish(EventType::ProposalSubmitted, &alarm, prev)
            .await;
        Ok(alarm)
    }

    /// Accept or reject the pending proposal. Rejection restores the state
    /// the alarm was in before arbitration started, with a fresh window.
    pub async fn arbitrate(
        &self,
        alarm_id: Uuid,
        actor: Uuid,
        accept: bool,
        reason: Option<String>,
    ) -> Result<AlarmEvent> {
        let _guard = self.lock(alarm_id).await;
        let alarm = self.load(alarm_id).await?;
        Self::ensure_open(&alarm)?;
        if alarm.confirmation_state != ConfirmationState::AwaitingArbitration {
            return Err(Error::InvalidTransition(format!(
                "Alarm {} has no proposal awaiting arbitration",
                alarm_id
            ))
            .into());
        }

        let action = if accept {
            actions::PROPOSAL_ACCEPTED
        } else {
            actions::PROPOSAL_REJECTED
        };
        self.settle_proposal(alarm, Some(actor), accept, action, reason)
            .await
    }

    /// Operator cancels the alarm outright (maintenance, drill, known false
    /// trigger). Pre-empts any armed window and stops pending notifications.
    pub async fn cancel(
        &self,
        alarm_id: Uuid,
        actor: Option<Uuid>,
        reason: String,
    ) -> Result<AlarmEvent> {
        let _guard = self.lock(alarm_id).await;
        let mut alarm = self.load(alarm_id).await?;
        Self::ensure_open(&alarm)?;

        let prev = (alarm.lifecycle_state, alarm.confirmation_state);
        let now = Utc::now();
        alarm.lifecycle_state = LifecycleState::Canceled;
        alarm.canceled = true;
        alarm.pending_until = None;
        Self::clear_proposal(&mut alarm);
        alarm.last_actor = actor.or(alarm.last_actor);
        alarm.last_action_at = now;
        let entry = Self::entry(&alarm, actions::CANCELED, actor, prev, Some(reason), None);
        self.store.commit(&alarm, &entry).await?;

        self.scheduler.disarm(alarm_id);
        if let Err(e) = self.dispatcher.stop_for_alarm(alarm_id).await {
            warn!("Failed to stop notifications for alarm {}: {}", alarm_id, e);
        }
        self.publish(EventType::AlarmCanceled, &alarm, prev).await;
        info!("Alarm {} canceled", alarm_id);
        Ok(alarm)
    }

    /// Close out a confirmed or escalated incident after it has been handled
    pub async fn resolve(
        &self,
        alarm_id: Uuid,
        actor: Uuid,
        reason: Option<String>,
    ) -> Result<AlarmEvent> {
        let _guard = self.lock(alarm_id).await;
        let mut alarm = self.load(alarm_id).await?;
        Self::ensure_open(&alarm)?;
        if !matches!(
            alarm.confirmation_state,
            ConfirmationState::Confirmed | ConfirmationState::Escalated
        ) {
            return Err(Error::InvalidTransition(format!(
                "Cannot resolve alarm {} in state {}; confirm or dismiss it first",
                alarm_id, alarm.confirmation_state
            ))
            .into());
        }

        let prev = (alarm.lifecycle_state, alarm.confirmation_state);
        let now = Utc::now();
        alarm.lifecycle_state = LifecycleState::Resolved;
        alarm.pending_until = None;
        alarm.last_actor = Some(actor);
        alarm.last_action_at = now;
        let entry = Self::entry(&alarm, actions::RESOLVED, Some(actor), prev, reason, None);
        self.store.commit(&alarm, &entry).await?;

        self.scheduler.disarm(alarm_id);
        if let Err(e) = self.dispatcher.stop_for_alarm(alarm_id).await {
            warn!("Failed to stop notifications for alarm {}: {}", alarm_id, e);
        }
        self.publish(EventType::AlarmResolved, &alarm, prev).await;
        info!("Alarm {} resolved", alarm_id);
        Ok(alarm)
    }

    pub async fn fetch(&self, alarm_id: Uuid) -> Result<Option<AlarmEvent>> {
        self.store.fetch(alarm_id).await
    }

    pub async fn history(&self, alarm_id: Uuid) -> Result<Vec<AlarmHistoryEntry>> {
        self.store.history(alarm_id).await
    }

    /// Re-open a dismissed alarm for a repeat detection within the cool-down
    async fn reopen(&self, alarm_id: Uuid, request: &AlarmRequest) -> Result<AlarmEvent> {
        let _guard = self.lock(alarm_id).await;
        let mut alarm = self.load(alarm_id).await?;
        if alarm.confirmation_state != ConfirmationState::Dismissed || alarm.canceled {
            // the dismissal raced with another transition since the lookup
            if alarm.lifecycle_state == LifecycleState::Active {
                debug!(
                    "Alarm {} already active again; folding repeat detection into it",
                    alarm_id
                );
                return Ok(alarm);
            }
            return Err(Error::InvalidTransition(format!(
                "Alarm {} is no longer dismissed",
                alarm_id
            ))
            .into());
        }

        let prev = (alarm.lifecycle_state, alarm.confirmation_state);
        let now = Utc::now();
        alarm.lifecycle_state = LifecycleState::Active;
        alarm.confirmation_state = ConfirmationState::Escalated;
        alarm.escalation_count += 1;
        alarm.confidence = alarm.confidence.max(request.confidence);
        alarm.reliability = alarm.reliability.max(request.reliability);
        for camera_id in &request.camera_ids {
            if !alarm.camera_ids.contains(camera_id) {
                alarm.camera_ids.push(*camera_id);
            }
        }
        alarm.pending_until = self.escalation_deadline(&alarm, now);
        alarm.last_action_at = now;
        let entry = Self::entry(
            &alarm,
            actions::REOPENED,
            None,
            prev,
            Some("repeat detection within dismissal cool-down".to_string()),
            None,
        );
        self.store.commit(&alarm, &entry).await?;

        match alarm.pending_until {
            Some(deadline) => self.scheduler.arm(alarm_id, deadline),
            None => self.scheduler.disarm(alarm_id),
        }
        self.publish(EventType::AlarmReopened, &alarm, prev).await;
        self.notify(&alarm, actions::REOPENED).await;
        Ok(alarm)
    }

    /// Escalate after a pending window elapsed without actor action. Caller
    /// holds the per-alarm lock.
    async fn escalate_locked(&self, mut alarm: AlarmEvent, reason: &str) -> Result<AlarmEvent> {
        let prev = (alarm.lifecycle_state, alarm.confirmation_state);
        let now = Utc::now();
        alarm.confirmation_state = ConfirmationState::Escalated;
        alarm.escalation_count += 1;
        alarm.pending_until = self.escalation_deadline(&alarm, now);
        alarm.last_action_at = now;
        let entry = Self::entry(
            &alarm,
            actions::ESCALATED,
            None,
            prev,
            Some(reason.to_string()),
            None,
        );
        self.store.commit(&alarm, &entry).await?;

        match alarm.pending_until {
            Some(deadline) => self.scheduler.arm(alarm.id, deadline),
            None => {
                self.scheduler.disarm(alarm.id);
                info!(
                    "Alarm {} reached the escalation ceiling; awaiting human resolution",
                    alarm.id
                );
            }
        }
        self.publish(EventType::AlarmEscalated, &alarm, prev).await;
        self.notify(&alarm, actions::ESCALATED).await;
        Ok(alarm)
    }

    /// Resolve a pending proposal: apply it, or restore the pre-proposal
    /// state. Caller holds the per-alarm lock and has checked the state.
    async fn settle_proposal(
        &self,
        mut alarm: AlarmEvent,
        actor: Option<Uuid>,
        accept: bool,
        action: &str,
        reason: Option<String>,
    ) -> Result<AlarmEvent> {
        let prev = (alarm.lifecycle_state, alarm.confirmation_state);
        let now = Utc::now();

        if accept {
            if let Some(event_type) = alarm.proposed_event_type {
                alarm.event_type = event_type;
            }
            match alarm.proposed_status {
                Some(ConfirmationState::Confirmed) => {
                    alarm.confirmation_state = ConfirmationState::Confirmed;
                    alarm.pending_until = None;
                }
                Some(ConfirmationState::Dismissed) => {
                    alarm.lifecycle_state = LifecycleState::Resolved;
                    alarm.confirmation_state = ConfirmationState::Dismissed;
                    alarm.pending_until = None;
                }
                _ => {
                    // type-only amendment: restart confirmation for the new type
                    alarm.confirmation_state = ConfirmationState::AwaitingConfirmation;
                    alarm.pending_until = Some(now + self.confirmation_window(alarm.event_type));
                }
            }
        } else {
            let restored = self.pre_proposal_state(alarm.id).await?;
            alarm.confirmation_state = restored;
            alarm.pending_until = match restored {
                ConfirmationState::AwaitingConfirmation => {
                    Some(now + self.confirmation_window(alarm.event_type))
                }
                ConfirmationState::Escalated => self.escalation_deadline(&alarm, now),
                _ => None,
            };
        }

        Self::clear_proposal(&mut alarm);
        alarm.last_actor = actor.or(alarm.last_actor);
        alarm.last_action_at = now;
        let entry = Self::entry(&alarm, action, actor, prev, reason, None);
        self.store.commit(&alarm, &entry).await?;

        match alarm.pending_until {
            Some(deadline) => self.scheduler.arm(alarm.id, deadline),
            None => self.scheduler.disarm(alarm.id),
        }
        if accept {
            match alarm.confirmation_state {
                ConfirmationState::Confirmed => {
                    if let Some(fusion) = &self.fusion {
                        fusion.record_outcome(&alarm.camera_ids, false);
                    }
                }
                ConfirmationState::Dismissed => {
                    if let Some(fusion) = &self.fusion {
                        fusion.record_outcome(&alarm.camera_ids, true);
                    }
                    if let Err(e) = self.dispatcher.stop_for_alarm(alarm.id).await {
                        warn!(
                            "Failed to stop notifications for alarm {}: {}",
                            alarm.id, e
                        );
                    }
                }
                _ => {}
            }
        }
        self.publish(EventType::ProposalArbitrated, &alarm, prev)
            .await;
        match alarm.confirmation_state {
            ConfirmationState::Confirmed if accept => {
                self.notify(&alarm, actions::CONFIRMED).await;
            }
            ConfirmationState::Dismissed if accept => {
                self.notify(&alarm, actions::DISMISSED).await;
            }
            _ => {}
        }
        Ok(alarm)
    }

    /// Confirmation state the alarm held before arbitration started, from the
    /// history. Skips over stacked proposals.
    async fn pre_proposal_state(&self, alarm_id: Uuid) -> Result<ConfirmationState> {
        let history = self.store.history(alarm_id).await?;
        for entry in history.iter().rev() {
            if entry.action == actions::PROPOSED
                && entry.previous_confirmation_state != ConfirmationState::AwaitingArbitration
            {
                return Ok(entry.previous_confirmation_state);
            }
        }
        Ok(ConfirmationState::AwaitingConfirmation)
    }

    fn confirmation_window(&self, event_type: AlarmType) -> Duration {
        let secs = match event_type {
            AlarmType::ManualEmergency => self.config.confirmation_window_manual_emergency_secs,
            AlarmType::Seizure => self.config.confirmation_window_seizure_secs,
            AlarmType::Fall => self.config.confirmation_window_fall_secs,
            AlarmType::Other => self.config.confirmation_window_other_secs,
        };
        Duration::seconds(secs as i64)
    }

    /// Deadline for the alarm's current escalation tier, or None once the
    /// ceiling is reached and the alarm waits for explicit resolution
    fn escalation_deadline(
        &self,
        alarm: &AlarmEvent,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if alarm.escalation_count as u32 >= self.config.max_escalations {
            return None;
        }
        let windows = &self.config.escalation_windows_secs;
        let idx = (alarm.escalation_count.max(1) as usize - 1).min(windows.len().saturating_sub(1));
        let secs = windows.get(idx).copied().unwrap_or(60);
        Some(now + Duration::seconds(secs as i64))
    }

    async fn lock(&self, alarm_id: Uuid) -> OwnedMutexGuard<()> {
        let cell = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(locks.entry(alarm_id).or_default())
        };
        cell.lock_owned().await
    }

    async fn load(&self, alarm_id: Uuid) -> Result<AlarmEvent> {
        Ok(self
            .store
            .fetch(alarm_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Alarm {}", alarm_id)))?)
    }

    fn ensure_open(alarm: &AlarmEvent) -> Result<(), Error> {
        if alarm.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "Alarm {} is {} and closed to further actions",
                alarm.id, alarm.lifecycle_state
            )));
        }
        Ok(())
    }

    fn clear_proposal(alarm: &mut AlarmEvent) {
        alarm.proposed_event_type = None;
        alarm.proposed_status = None;
        alarm.proposed_reason = None;
    }

    fn entry(
        alarm: &AlarmEvent,
        action: &str,
        actor: Option<Uuid>,
        prev: (LifecycleState, ConfirmationState),
        reason: Option<String>,
        response_time_ms: Option<i64>,
    ) -> AlarmHistoryEntry {
        AlarmHistoryEntry {
            id: Uuid::new_v4(),
            alarm_id: alarm.id,
            action: action.to_string(),
            actor,
            actor_role: None,
            previous_lifecycle_state: prev.0,
            previous_confirmation_state: prev.1,
            new_lifecycle_state: alarm.lifecycle_state,
            new_confirmation_state: alarm.confirmation_state,
            reason,
            created_at: Utc::now(),
            response_time_ms,
        }
    }

    async fn publish(
        &self,
        event_type: EventType,
        alarm: &AlarmEvent,
        prev: (LifecycleState, ConfirmationState),
    ) {
        let Some(broker) = &self.broker else {
            return;
        };
        let routing = event_type.to_string();
        let payload = json!({
            "event_id": alarm.id,
            "subject_id": alarm.subject_id,
            "event_type": alarm.event_type,
            "previous_state": format!("{}/{}", prev.0, prev.1),
            "new_state": format!("{}/{}", alarm.lifecycle_state, alarm.confirmation_state),
            "escalation_count": alarm.escalation_count,
            "timestamp": Utc::now(),
        });
        if let Err(e) = broker.publish(event_type, Some(alarm.id), payload).await {
            warn!("Failed to publish {} for alarm {}: {}", routing, alarm.id, e);
        }
    }

    /// Fan the transition out to emergency contacts. Dispatch failures are
    /// logged and never fail the transition.
    async fn notify(&self, alarm: &AlarmEvent, transition: &str) {
        if let Err(e) = self
            .dispatcher
            .dispatch(alarm, transition, alarm.recipient_tier())
            .await
        {
            warn!(
                "Notification dispatch failed for alarm {} ({}): {}",
                alarm.id, transition, e
            );
        }
    }
}

#[async_trait]
impl DeadlineHandler for LifecycleEngine {
    /// A pending window elapsed. Revalidated against the persisted deadline
    /// under the per-alarm lock: a timer that raced with a transition is
    /// dropped as stale. An expired arbitration auto-rejects the proposal;
    /// any other expired window escalates.
    async fn deadline_elapsed(&self, alarm_id: Uuid, deadline: DateTime<Utc>) -> Result<()> {
        let _guard = self.lock(alarm_id).await;
        let alarm = match self.store.fetch(alarm_id).await? {
            Some(alarm) => alarm,
            None => {
                debug!("Deadline fired for unknown alarm {}", alarm_id);
                return Ok(());
            }
        };
        if alarm.is_terminal() || alarm.pending_until != Some(deadline) {
            debug!(
                "Ignoring stale deadline {} for alarm {} (current {:?})",
                deadline, alarm_id, alarm.pending_until
            );
            return Ok(());
        }

        if alarm.confirmation_state == ConfirmationState::AwaitingArbitration {
            self.settle_proposal(
                alarm,
                None,
                false,
                actions::PROPOSAL_EXPIRED,
                Some("arbitration window elapsed".to_string()),
            )
            .await?;
        } else {
            self.escalate_locked(alarm, "pending window elapsed without actor action")
                .await?;
        }
        Ok(())
    }
}
