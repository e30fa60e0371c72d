//! Error types for Sift

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Reviewed fields failed sanity checks; the document stays in review
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A likely duplicate exists and the caller did not override it
    #[error("Possible duplicate of expense #{expense_id} (score {score}); confirm to file anyway")]
    DuplicateBlock { expense_id: i64, score: u8 },

    #[error("Invalid trigger '{trigger}' for document in state '{state}'")]
    InvalidTransition {
        state: &'static str,
        trigger: &'static str,
    },

    /// The document is in the terminal failed state and must be re-uploaded
    #[error("Document failed: {0}")]
    DocumentFailed(String),

    #[error("{stage} task exceeded hard timeout of {secs}s")]
    TaskTimeout { stage: &'static str, secs: u64 },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("OCR error: {0}")]
    Ocr(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;
