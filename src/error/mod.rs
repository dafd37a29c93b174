use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

use crate::collector::DeleteError;
use crate::schema::SchemaError;

/// Serializable error reported by the command line surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            let mut keys: Vec<_> = self.context.iter().collect();
            keys.sort();
            write!(f, "[{}] {} ({:?})", self.code, self.message, keys)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            if let Some(delete) = err.downcast_ref::<DeleteError>() {
                return AppError::from_delete(delete);
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app_error = app_error
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        AppError::from_sqlx(&error)
    }
}

impl From<SchemaError> for AppError {
    fn from(error: SchemaError) -> Self {
        let code = match &error {
            SchemaError::DuplicateModel(_) => "SCHEMA/DUPLICATE_MODEL",
            SchemaError::InvalidIdentifier { .. } => "SCHEMA/INVALID_IDENTIFIER",
            SchemaError::UnknownModel { .. } => "SCHEMA/UNKNOWN_MODEL",
            SchemaError::Io { .. } => "SCHEMA/IO",
            SchemaError::Parse(_) => "SCHEMA/PARSE",
        };
        let app_error = AppError::new(code, error.to_string());
        match error {
            SchemaError::Io { path, source } => app_error
                .with_context("path", path)
                .with_cause(source),
            SchemaError::Parse(source) => app_error.with_cause(source),
            _ => app_error,
        }
    }
}

impl From<DeleteError> for AppError {
    fn from(error: DeleteError) -> Self {
        AppError::from_delete(&error)
    }
}

impl AppError {
    fn from_sqlx(error: &SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                AppError::new(code, db.message().to_string())
            }
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }

    fn from_delete(error: &DeleteError) -> Self {
        match error {
            DeleteError::ProtectedReference { blocking } => {
                let keys: Vec<String> = blocking.iter().map(ToString::to_string).collect();
                AppError::new("DELETE/PROTECTED", error.to_string())
                    .with_context("blocking", keys.join(","))
            }
            DeleteError::InvalidOperation(_) => {
                AppError::new("DELETE/INVALID_OPERATION", error.to_string())
            }
            DeleteError::PermissionDenied { action, model } => {
                AppError::new("DELETE/PERMISSION_DENIED", error.to_string())
                    .with_context("action", action.to_string())
                    .with_context("model", model.clone())
            }
            DeleteError::UnknownModel(model) => {
                AppError::new("DELETE/UNKNOWN_MODEL", error.to_string())
                    .with_context("model", model.clone())
            }
            DeleteError::Transaction(source) => {
                AppError::new("DELETE/TRANSACTION", error.to_string())
                    .with_cause(AppError::from_sqlx(source))
            }
        }
    }
}
