//! Error taxonomy (§7). Pure functions in `domain` never raise; everything else returns
//! `Result<_, CoreError>` or, for user-facing operations, an [`OperationResult`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config table missing or failed to merge: {0}")]
    ConfigMissing(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("domain invariant violated: {0}")]
    Domain(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("item is locked: {0}")]
    ItemLocked(String),

    #[error("lock timeout acquiring lock:{owner_key}:{purpose}")]
    LockTimeout { owner_key: String, purpose: String },

    #[error("concurrency aborted: {0}")]
    ConcurrencyAborted(String),

    #[error("storage io error: {0}")]
    StorageIo(String),

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("task timed out after {0:?}")]
    TaskTimeout(std::time::Duration),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::StorageIo(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::StorageCorrupt(e.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(e: serde_yaml::Error) -> Self {
        CoreError::StorageCorrupt(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// User-facing, non-exceptional operation outcome (§7). Validation-type failures are
/// reported this way rather than by unwinding the lock with an error.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub code: Option<String>,
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, code: None, message: None, data: Some(data) }
    }

    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { success: false, code: Some(code.into()), message: Some(message.into()), data: None }
    }
}
