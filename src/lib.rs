//! Pluggable object storage for uploaded files.
//!
//! Callers ask a [`StorageContext`] (or the process-wide [`global`] one) for a
//! backend by identifier and talk to it only through [`StorageBackend`].
//! Providers register a constructor under a string identifier and, optionally,
//! a settings schema that is validated when that provider is selected.

pub mod config;
pub mod error;
pub mod services;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub use config::{CommonSettings, ConfigLoader, Environment, SchemaRegistry, StorageConfig};
pub use error::{ErrorBody, ErrorKind, ErrorSeverity, FieldViolation, StorageError, StorageResult};
pub use services::s3_service::{S3Service, S3Settings};
pub use storage::context::{global, register_builtin_backends, StorageContext};
pub use storage::factory::BackendFactory;
pub use storage::local::{LocalSettings, LocalStorageBackend};
pub use storage::registry::{BackendConstructor, BackendRegistry};
pub use storage::{
    BackendOptions, ObjectStream, SignedUrl, SignedUrlRequest, StorageBackend, UploadBody,
    UploadRequest, UploadResult, UrlMethod,
};
