use crate::db::models::alarm_models::AlarmHistoryEntry;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Coarse alarm lifecycle. `Detected` only exists transiently while an alarm
/// request is being admitted; persisted alarms are `Active` until they reach a
/// terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Detected,
    Active,
    Resolved,
    Canceled,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Canceled)
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detected => write!(f, "detected"),
            Self::Active => write!(f, "active"),
            Self::Resolved => write!(f, "resolved"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for LifecycleState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(Self::Detected),
            "active" => Ok(Self::Active),
            "resolved" => Ok(Self::Resolved),
            "canceled" => Ok(Self::Canceled),
            _ => Err(Error::Database(format!("Unknown lifecycle state: {}", s))),
        }
    }
}

/// Confirmation sub-state of an active alarm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    /// Waiting for a caregiver to confirm or dismiss within the pending window
    AwaitingConfirmation,
    /// A proposed type/status change is waiting for arbitration
    AwaitingArbitration,
    Confirmed,
    Dismissed,
    /// Pending window elapsed without actor action at least once
    Escalated,
}

impl ConfirmationState {
    /// States in which a direct confirm or dismiss is still open. Escalated
    /// alarms are past the decision windows and close via resolve or cancel.
    pub fn accepts_actor_decision(&self) -> bool {
        matches!(self, Self::AwaitingConfirmation | Self::AwaitingArbitration)
    }
}

impl Display for ConfirmationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingConfirmation => write!(f, "awaiting_confirmation"),
            Self::AwaitingArbitration => write!(f, "awaiting_arbitration"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Dismissed => write!(f, "dismissed"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

impl FromStr for ConfirmationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_confirmation" => Ok(Self::AwaitingConfirmation),
            "awaiting_arbitration" => Ok(Self::AwaitingArbitration),
            "confirmed" => Ok(Self::Confirmed),
            "dismissed" => Ok(Self::Dismissed),
            "escalated" => Ok(Self::Escalated),
            _ => Err(Error::Database(format!(
                "Unknown confirmation state: {}",
                s
            ))),
        }
    }
}

/// History actions appended by the lifecycle engine
pub mod actions {
    pub const CREATED: &str = "created";
    pub const CONFIRMED: &str = "confirmed";
    pub const DISMISSED: &str = "dismissed";
    pub const PROPOSED: &str = "proposed";
    pub const PROPOSAL_ACCEPTED: &str = "proposal_accepted";
    pub const PROPOSAL_REJECTED: &str = "proposal_rejected";
    pub const PROPOSAL_EXPIRED: &str = "proposal_expired";
    pub const ESCALATED: &str = "escalated";
    pub const REOPENED: &str = "reopened";
    pub const CANCELED: &str = "canceled";
    pub const RESOLVED: &str = "resolved";
}

/// State snapshot reconstructed from an ordered alarm history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmProjection {
    pub lifecycle_state: LifecycleState,
    pub confirmation_state: ConfirmationState,
    pub escalation_count: i32,
    pub canceled: bool,
}

impl AlarmProjection {
    /// Replay an append-only history into the current state projection. The
    /// entry sequence must be in append order for one alarm id.
    pub fn replay(entries: &[AlarmHistoryEntry]) -> Option<Self> {
        let mut projection: Option<Self> = None;
        for entry in entries {
            let escalations = projection.as_ref().map_or(0, |p| p.escalation_count)
                + match entry.action.as_str() {
                    actions::ESCALATED | actions::REOPENED => 1,
                    _ => 0,
                };
            projection = Some(Self {
                lifecycle_state: entry.new_lifecycle_state,
                confirmation_state: entry.new_confirmation_state,
                escalation_count: escalations,
                canceled: projection.map_or(false, |p| p.canceled)
                    || entry.action == actions::CANCELED,
            });
        }
        projection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(
        action: &str,
        prev: (LifecycleState, ConfirmationState),
        new: (LifecycleState, ConfirmationState),
    ) -> AlarmHistoryEntry {
        AlarmHistoryEntry {
            id: Uuid::new_v4(),
            alarm_id: Uuid::new_v4(),
            action: action.to_string(),
            actor: None,
            actor_role: None,
            previous_lifecycle_state: prev.0,
            previous_confirmation_state: prev.1,
            new_lifecycle_state: new.0,
            new_confirmation_state: new.1,
            reason: None,
            created_at: Utc::now(),
            response_time_ms: None,
        }
    }

    #[test]
    fn state_strings_round_trip() {
        for state in [
            LifecycleState::Detected,
            LifecycleState::Active,
            LifecycleState::Resolved,
            LifecycleState::Canceled,
        ] {
            assert_eq!(state.to_string().parse::<LifecycleState>().unwrap(), state);
        }
        for state in [
            ConfirmationState::AwaitingConfirmation,
            ConfirmationState::AwaitingArbitration,
            ConfirmationState::Confirmed,
            ConfirmationState::Dismissed,
            ConfirmationState::Escalated,
        ] {
            assert_eq!(
                state.to_string().parse::<ConfirmationState>().unwrap(),
                state
            );
        }
    }

    #[test]
    fn replay_follows_escalation_and_cancel() {
        use ConfirmationState::*;
        use LifecycleState::*;
        let entries = vec![
            entry(
                actions::CREATED,
                (Detected, AwaitingConfirmation),
                (Active, AwaitingConfirmation),
            ),
            entry(
                actions::ESCALATED,
                (Active, AwaitingConfirmation),
                (Active, Escalated),
            ),
            entry(actions::ESCALATED, (Active, Escalated), (Active, Escalated)),
            entry(actions::CANCELED, (Active, Escalated), (Canceled, Escalated)),
        ];
        let projection = AlarmProjection::replay(&entries).unwrap();
        assert_eq!(projection.lifecycle_state, Canceled);
        assert_eq!(projection.confirmation_state, Escalated);
        assert_eq!(projection.escalation_count, 2);
        assert!(projection.canceled);
    }

    #[test]
    fn only_awaiting_states_accept_decisions() {
        assert!(ConfirmationState::AwaitingConfirmation.accepts_actor_decision());
        assert!(ConfirmationState::AwaitingArbitration.accepts_actor_decision());
        assert!(!ConfirmationState::Confirmed.accepts_actor_decision());
        assert!(!ConfirmationState::Dismissed.accepts_actor_decision());
        assert!(!ConfirmationState::Escalated.accepts_actor_decision());
    }

    #[test]
    fn replay_of_empty_history_is_none() {
        assert!(AlarmProjection::replay(&[]).is_none());
    }
}
