use thiserror::Error;

use crate::permissions::Action;
use crate::record::RecordKey;

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("{} record(s) reference the deletion set through a protected relation", blocking.len())]
    ProtectedReference { blocking: Vec<RecordKey> },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("permission denied: cannot {action} {model}")]
    PermissionDenied { action: Action, model: String },
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("transaction failed: {0}")]
    Transaction(#[from] sqlx::Error),
}

impl DeleteError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        DeleteError::InvalidOperation(message.into())
    }
}
