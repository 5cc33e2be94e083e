use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Delivery channels handled by external channel adapters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Push,
    Sms,
    Voice,
    Email,
}

impl Display for ChannelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Sms => write!(f, "sms"),
            Self::Voice => write!(f, "voice"),
            Self::Email => write!(f, "email"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            "sms" => Ok(Self::Sms),
            "voice" => Ok(Self::Voice),
            "email" => Ok(Self::Email),
            _ => Err(Error::InvalidInput(format!("Unknown channel: {}", s))),
        }
    }
}

/// Per-row delivery status. `Sending` doubles as the claim that guards against
/// two concurrent attempts on one row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sending,
    Delivered,
    Acknowledged,
    Failed,
    Canceled,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed | Self::Canceled)
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sending => write!(f, "sending"),
            Self::Delivered => write!(f, "delivered"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for NotificationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "delivered" => Ok(Self::Delivered),
            "acknowledged" => Ok(Self::Acknowledged),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(Error::Database(format!(
                "Unknown notification status: {}",
                s
            ))),
        }
    }
}

/// One outbound alert to one recipient over one channel. Owned by the
/// notification dispatcher; references the alarm by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub alarm_id: Uuid,
    pub recipient_id: Uuid,
    pub channel: ChannelKind,
    /// Lifecycle transition that produced this notification; part of the
    /// dispatch dedup key
    pub transition: String,
    pub severity: i32,
    pub status: NotificationStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}
