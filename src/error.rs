//! Domain error taxonomy for the storage layer.
//!
//! Every error that leaves this crate is a [`StorageError`]. Provider and
//! transport failures are translated into one of these kinds at the backend
//! boundary, so API layers only ever need to map this small vocabulary onto
//! their own status codes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Who is expected to act on an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// The request itself was unacceptable.
    Client,
    /// The storage provider or transport failed.
    Server,
    /// The deployment is misconfigured; an operator has to fix it.
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Backend,
    QuotaExceeded,
    FileNotFound,
    InvalidFileType,
    BackendNotRegistered,
    ConfigurationInvalid,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Backend => "STORAGE_BACKEND_ERROR",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::FileNotFound => "FILE_NOT_FOUND",
            ErrorKind::InvalidFileType => "INVALID_FILE_TYPE",
            ErrorKind::BackendNotRegistered => "BACKEND_NOT_REGISTERED",
            ErrorKind::ConfigurationInvalid => "CONFIGURATION_INVALID",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Backend => 500,
            ErrorKind::QuotaExceeded => 403,
            ErrorKind::FileNotFound => 404,
            ErrorKind::InvalidFileType => 400,
            ErrorKind::BackendNotRegistered => 500,
            ErrorKind::ConfigurationInvalid => 500,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorKind::QuotaExceeded | ErrorKind::FileNotFound | ErrorKind::InvalidFileType => {
                ErrorSeverity::Client
            }
            ErrorKind::Backend => ErrorSeverity::Server,
            ErrorKind::BackendNotRegistered | ErrorKind::ConfigurationInvalid => {
                ErrorSeverity::Configuration
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A single failed configuration constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub env_var: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, env_var: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            env_var: env_var.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`: {}", self.field, self.message)
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{message}")]
    Backend {
        message: String,
        details: Map<String, Value>,
    },

    #[error("{message}")]
    QuotaExceeded {
        message: String,
        details: Map<String, Value>,
    },

    #[error("File not found: {key}")]
    FileNotFound { key: String },

    #[error("Invalid file type: {message}")]
    InvalidFileType {
        message: String,
        content_type: Option<String>,
    },

    #[error("Storage backend '{identifier}' is not registered (registered: {})", .registered.join(", "))]
    BackendNotRegistered {
        identifier: String,
        registered: Vec<String>,
    },

    #[error("Storage configuration is invalid: {}", join_violations(.violations))]
    ConfigurationInvalid { violations: Vec<FieldViolation> },
}

impl StorageError {
    pub fn backend(message: impl Into<String>) -> Self {
        StorageError::Backend {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        StorageError::QuotaExceeded {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        StorageError::FileNotFound { key: key.into() }
    }

    pub fn invalid_file_type(message: impl Into<String>, content_type: Option<&str>) -> Self {
        StorageError::InvalidFileType {
            message: message.into(),
            content_type: content_type.map(str::to_string),
        }
    }

    /// Attach a detail entry. Only meaningful for the variants that carry a
    /// free-form detail map; other variants are returned unchanged.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        match &mut self {
            StorageError::Backend { details, .. } | StorageError::QuotaExceeded { details, .. } => {
                details.insert(key.to_string(), value.into());
            }
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Backend { .. } => ErrorKind::Backend,
            StorageError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            StorageError::FileNotFound { .. } => ErrorKind::FileNotFound,
            StorageError::InvalidFileType { .. } => ErrorKind::InvalidFileType,
            StorageError::BackendNotRegistered { .. } => ErrorKind::BackendNotRegistered,
            StorageError::ConfigurationInvalid { .. } => ErrorKind::ConfigurationInvalid,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    /// Structured payload describing the failure.
    pub fn details(&self) -> Value {
        match self {
            StorageError::Backend { details, .. } | StorageError::QuotaExceeded { details, .. } => {
                Value::Object(details.clone())
            }
            StorageError::FileNotFound { key } => json!({ "key": key }),
            StorageError::InvalidFileType { content_type, .. } => {
                json!({ "content_type": content_type })
            }
            StorageError::BackendNotRegistered {
                identifier,
                registered,
            } => json!({
                "identifier": identifier,
                "registered": registered,
            }),
            StorageError::ConfigurationInvalid { violations } => json!({
                "violations": violations
                    .iter()
                    .map(|v| json!({
                        "field": v.field,
                        "env_var": v.env_var,
                        "message": v.message,
                    }))
                    .collect::<Vec<_>>(),
            }),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            code: self.kind().code().to_string(),
            message: self.to_string(),
            http_status: self.http_status(),
            details: self.details(),
        }
    }
}

/// Serializable form of a [`StorageError`] for API layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub http_status: u16,
    pub details: Value,
}
