use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Lab not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Driver error: {0}")]
    Driver(String),
}

pub type Result<T> = std::result::Result<T, LabError>;
