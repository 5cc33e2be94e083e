use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Event types published on the realtime channels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    // Alarm lifecycle transitions (outbound broadcast)
    AlarmRaised,
    AlarmConfirmed,
    AlarmDismissed,
    AlarmEscalated,
    AlarmReopened,
    AlarmResolved,
    AlarmCanceled,

    // Proposal arbitration
    ProposalSubmitted,
    ProposalArbitrated,

    // Console / manual trigger channel (inbound) and its acks
    ActionRequested,
    ActionAck,

    // System events
    SystemStartup,
    SystemShutdown,

    // Custom event
    Custom(String),
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlarmRaised => write!(f, "alarm.raised"),
            Self::AlarmConfirmed => write!(f, "alarm.confirmed"),
            Self::AlarmDismissed => write!(f, "alarm.dismissed"),
            Self::AlarmEscalated => write!(f, "alarm.escalated"),
            Self::AlarmReopened => write!(f, "alarm.reopened"),
            Self::AlarmResolved => write!(f, "alarm.resolved"),
            Self::AlarmCanceled => write!(f, "alarm.canceled"),
            Self::ProposalSubmitted => write!(f, "proposal.submitted"),
            Self::ProposalArbitrated => write!(f, "proposal.arbitrated"),
            Self::ActionRequested => write!(f, "console.action"),
            Self::ActionAck => write!(f, "console.ack"),
            Self::SystemStartup => write!(f, "system.startup"),
            Self::SystemShutdown => write!(f, "system.shutdown"),
            Self::Custom(name) => write!(f, "custom.{}", name),
        }
    }
}

/// Event message structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique message ID
    pub id: Uuid,
    /// Event type
    pub event_type: EventType,
    /// Event source ID (e.g., alarm ID)
    pub source_id: Option<Uuid>,
    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Event data payload
    pub payload: serde_json::Value,
}

impl EventMessage {
    /// Create a new event message
    pub fn new(
        event_type: EventType,
        source_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source_id,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    /// Get the routing key for the event
    pub fn routing_key(&self) -> String {
        match &self.source_id {
            Some(id) => format!("{}.{}", self.event_type, id),
            None => self.event_type.to_string(),
        }
    }
}
