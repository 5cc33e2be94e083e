pub mod config;
pub mod db;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod fusion;
pub mod lifecycle;
pub mod messaging;
pub mod scheduler;

// Re-export main components for easier use
pub use db::DatabaseService;
pub use detection::{AlarmType, DetectionCandidate};
pub use dispatch::NotificationDispatcher;
pub use error::Error;
pub use fusion::FusionEngine;
pub use lifecycle::{ConfirmationState, LifecycleEngine, LifecycleState};
pub use scheduler::DeadlineScheduler;
