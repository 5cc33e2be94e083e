use crate::detection::AlarmType;
use crate::lifecycle::state::{ConfirmationState, LifecycleState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current-state projection of one alarm. Owned exclusively by the lifecycle
/// engine; everything else reads it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub area_id: Uuid,
    /// Originating camera(s); two when the detection was corroborated
    pub camera_ids: Vec<Uuid>,
    pub event_type: AlarmType,
    /// Post-fusion confidence in [0, 1]
    pub confidence: f64,
    /// Derived reliability score
    pub reliability: f64,
    pub lifecycle_state: LifecycleState,
    pub confirmation_state: ConfirmationState,
    pub created_at: DateTime<Utc>,
    /// Deadline for the current pending/arbitration/escalation window
    pub pending_until: Option<DateTime<Utc>>,
    pub escalation_count: i32,
    pub canceled: bool,
    /// Proposed amendment awaiting arbitration
    pub proposed_event_type: Option<AlarmType>,
    pub proposed_status: Option<ConfirmationState>,
    pub proposed_reason: Option<String>,
    pub last_actor: Option<Uuid>,
    pub last_action_at: DateTime<Utc>,
    pub context: serde_json::Value,
}

impl AlarmEvent {
    pub fn is_terminal(&self) -> bool {
        self.lifecycle_state.is_terminal()
    }

    /// Severity tier notified right now: the base tier plus one per escalation
    pub fn recipient_tier(&self) -> i32 {
        self.escalation_count
    }
}

/// One immutable step of an alarm's state trajectory. Append-only; the ordered
/// sequence for an alarm id replays into its current projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmHistoryEntry {
    pub id: Uuid,
    pub alarm_id: Uuid,
    pub action: String,
    /// None for system actions (timer expiry, auto-escalation)
    pub actor: Option<Uuid>,
    pub actor_role: Option<String>,
    pub previous_lifecycle_state: LifecycleState,
    pub previous_confirmation_state: ConfirmationState,
    pub new_lifecycle_state: LifecycleState,
    pub new_confirmation_state: ConfirmationState,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Milliseconds since the previous entry for this alarm
    pub response_time_ms: Option<i64>,
}
