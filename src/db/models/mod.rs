pub mod alarm_models;
pub mod contact_models;
pub mod notification_models;

pub use alarm_models::{AlarmEvent, AlarmHistoryEntry};
pub use contact_models::EmergencyContact;
pub use notification_models::{ChannelKind, Notification, NotificationStatus};
