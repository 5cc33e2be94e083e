pub mod bridge;
pub mod broker;
pub mod event;
#[cfg(test)]
mod tests;

pub use bridge::RealtimeBridge;
pub use broker::{MessageBroker, MessageBrokerTrait};
pub use event::EventType;
