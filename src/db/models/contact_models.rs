use crate::db::models::notification_models::ChannelKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Emergency contact of a monitored subject. Consulted read-only by the
/// notification dispatcher when fanning out a transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub name: String,
    /// Escalation tier at which this contact joins the recipient set; 0 is
    /// notified on the initial alert
    pub alert_level: i32,
    pub channels: Vec<ChannelKind>,
    pub enabled: bool,
}
