use crate::db::models::{AlarmEvent, AlarmHistoryEntry};
use crate::db::store::AlarmStore;
use crate::detection::AlarmType;
use crate::error::Error;
use crate::lifecycle::state::{ConfirmationState, LifecycleState};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

/// Alarms repository over the `alarm_events` and `alarm_history` tables.
/// Transition commits are transactional: projection upsert plus exactly one
/// history append.
#[derive(Clone)]
pub struct AlarmsRepository {
    pool: Arc<PgPool>,
}

impl AlarmsRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn alarm_from_row(row: &PgRow) -> Result<AlarmEvent> {
        let event_type: String = row.try_get("event_type")?;
        let lifecycle_state: String = row.try_get("lifecycle_state")?;
        let confirmation_state: String = row.try_get("confirmation_state")?;
        let proposed_event_type: Option<String> = row.try_get("proposed_event_type")?;
        let proposed_status: Option<String> = row.try_get("proposed_status")?;

        Ok(AlarmEvent {
            id: row.try_get("id")?,
            subject_id: row.try_get("subject_id")?,
            area_id: row.try_get("area_id")?,
            camera_ids: row.try_get("camera_ids")?,
            event_type: event_type.parse::<AlarmType>()?,
            confidence: row.try_get("confidence")?,
            reliability: row.try_get("reliability")?,
            lifecycle_state: lifecycle_state.parse::<LifecycleState>()?,
            confirmation_state: confirmation_state.parse::<ConfirmationState>()?,
            created_at: row.try_get("created_at")?,
            pending_until: row.try_get("pending_until")?,
            escalation_count: row.try_get("escalation_count")?,
            canceled: row.try_get("canceled")?,
            proposed_event_type: proposed_event_type
                .map(|s| s.parse::<AlarmType>())
                .transpose()?,
            proposed_status: proposed_status
                .map(|s| s.parse::<ConfirmationState>())
                .transpose()?,
            proposed_reason: row.try_get("proposed_reason")?,
            last_actor: row.try_get("last_actor")?,
            last_action_at: row.try_get("last_action_at")?,
            context: row.try_get("context")?,
        })
    }

    fn entry_from_row(row: &PgRow) -> Result<AlarmHistoryEntry> {
        let previous_lifecycle: String = row.try_get("previous_lifecycle_state")?;
        let previous_confirmation: String = row.try_get("previous_confirmation_state")?;
        let new_lifecycle: String = row.try_get("new_lifecycle_state")?;
        let new_confirmation: String = row.try_get("new_confirmation_state")?;

        Ok(AlarmHistoryEntry {
            id: row.try_get("id")?,
            alarm_id: row.try_get("alarm_id")?,
            action: row.try_get("action")?,
            actor: row.try_get("actor")?,
            actor_role: row.try_get("actor_role")?,
            previous_lifecycle_state: previous_lifecycle.parse::<LifecycleState>()?,
            previous_confirmation_state: previous_confirmation.parse::<ConfirmationState>()?,
            new_lifecycle_state: new_lifecycle.parse::<LifecycleState>()?,
            new_confirmation_state: new_confirmation.parse::<ConfirmationState>()?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
            response_time_ms: row.try_get("response_time_ms")?,
        })
    }
}

#[async_trait]
impl AlarmStore for AlarmsRepository {
    async fn fetch(&self, id: Uuid) -> Result<Option<AlarmEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, subject_id, area_id, camera_ids, event_type, confidence, reliability,
                   lifecycle_state, confirmation_state, created_at, pending_until,
                   escalation_count, canceled, proposed_event_type, proposed_status,
                   proposed_reason, last_actor, last_action_at, context
            FROM alarm_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fetch alarm: {}", e)))?;

        row.as_ref().map(Self::alarm_from_row).transpose()
    }

    async fn commit(&self, alarm: &AlarmEvent, entry: &AlarmHistoryEntry) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO alarm_events (
                id, subject_id, area_id, camera_ids, event_type, confidence, reliability,
                lifecycle_state, confirmation_state, created_at, pending_until,
                escalation_count, canceled, proposed_event_type, proposed_status,
                proposed_reason, last_actor, last_action_at, context
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                confidence = EXCLUDED.confidence,
                reliability = EXCLUDED.reliability,
                lifecycle_state = EXCLUDED.lifecycle_state,
                confirmation_state = EXCLUDED.confirmation_state,
                pending_until = EXCLUDED.pending_until,
                escalation_count = EXCLUDED.escalation_count,
                canceled = EXCLUDED.canceled,
                proposed_event_type = EXCLUDED.proposed_event_type,
                proposed_status = EXCLUDED.proposed_status,
                proposed_reason = EXCLUDED.proposed_reason,
                last_actor = EXCLUDED.last_actor,
                last_action_at = EXCLUDED.last_action_at,
                context = EXCLUDED.context
            "#,
        )
        .bind(alarm.id)
        .bind(alarm.subject_id)
        .bind(alarm.area_id)
        .bind(&alarm.camera_ids)
        .bind(alarm.event_type.to_string())
        .bind(alarm.confidence)
        .bind(alarm.reliability)
        .bind(alarm.lifecycle_state.to_string())
        .bind(alarm.confirmation_state.to_string())
        .bind(alarm.created_at)
        .bind(alarm.pending_until)
        .bind(alarm.escalation_count)
        .bind(alarm.canceled)
        .bind(alarm.proposed_event_type.map(|t| t.to_string()))
        .bind(alarm.proposed_status.map(|s| s.to_string()))
        .bind(&alarm.proposed_reason)
        .bind(alarm.last_actor)
        .bind(alarm.last_action_at)
        .bind(&alarm.context)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert alarm: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO alarm_history (
                id, alarm_id, action, actor, actor_role,
                previous_lifecycle_state, previous_confirmation_state,
                new_lifecycle_state, new_confirmation_state,
                reason, created_at, response_time_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id)
        .bind(entry.alarm_id)
        .bind(&entry.action)
        .bind(entry.actor)
        .bind(&entry.actor_role)
        .bind(entry.previous_lifecycle_state.to_string())
        .bind(entry.previous_confirmation_state.to_string())
        .bind(entry.new_lifecycle_state.to_string())
        .bind(entry.new_confirmation_state.to_string())
        .bind(&entry.reason)
        .bind(entry.created_at)
        .bind(entry.response_time_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to append alarm history: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit transition: {}", e)))?;

        Ok(())
    }

    async fn history(&self, alarm_id: Uuid) -> Result<Vec<AlarmHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, alarm_id, action, actor, actor_role,
                   previous_lifecycle_state, previous_confirmation_state,
                   new_lifecycle_state, new_confirmation_state,
                   reason, created_at, response_time_ms
            FROM alarm_history
            WHERE alarm_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(alarm_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fetch alarm history: {}", e)))?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn pending_deadlines(&self) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, pending_until
            FROM alarm_events
            WHERE pending_until IS NOT NULL
              AND lifecycle_state NOT IN ('resolved', 'canceled')
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load pending deadlines: {}", e)))?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("id")?;
                let deadline: DateTime<Utc> = row.try_get("pending_until")?;
                Ok((id, deadline))
            })
            .collect()
    }

    async fn find_recent_dismissed(
        &self,
        subject_id: Uuid,
        event_type: AlarmType,
        since: DateTime<Utc>,
    ) -> Result<Option<AlarmEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, subject_id, area_id, camera_ids, event_type, confidence, reliability,
                   lifecycle_state, confirmation_state, created_at, pending_until,
                   escalation_count, canceled, proposed_event_type, proposed_status,
                   proposed_reason, last_actor, last_action_at, context
            FROM alarm_events
            WHERE subject_id = $1
              AND event_type = $2
              AND confirmation_state = 'dismissed'
              AND canceled = FALSE
              AND last_action_at >= $3
            ORDER BY last_action_at DESC
            LIMIT 1
            "#,
        )
        .bind(subject_id)
        .bind(event_type.to_string())
        .bind(since)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to find dismissed alarm: {}", e)))?;

        row.as_ref().map(Self::alarm_from_row).transpose()
    }
}
