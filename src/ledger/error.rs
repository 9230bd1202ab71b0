use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job already exists: {0}")]
    JobExists(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
