use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Stale timer: {0}")]
    StaleTimer(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Service error: {0}")]
    Service(String),
}
