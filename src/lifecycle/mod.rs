pub mod machine;
pub mod state;

pub use machine::LifecycleEngine;
pub use state::{actions, AlarmProjection, ConfirmationState, LifecycleState};
