pub mod alarms;
pub mod contacts;
pub mod notifications;

pub use alarms::AlarmsRepository;
pub use contacts::ContactsRepository;
pub use notifications::NotificationsRepository;
