//! Error types for handreceipt

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandReceiptError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Property with serial number {0} already exists")]
    DuplicateSerial(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandReceiptError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HandReceiptError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            HandReceiptError::Conflict(_) | HandReceiptError::DuplicateSerial(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HandReceiptError>;
