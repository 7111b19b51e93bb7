//! Storage backend abstraction for uploaded files
//!
//! This module provides a clean abstraction over different storage backends
//! (local filesystem, S3-compatible object storage, etc.) with a unified
//! interface. Backends are looked up by string identifier through the
//! [`registry::BackendRegistry`] and instantiated lazily by the
//! [`factory::BackendFactory`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::config::{CommonSettings, DEFAULT_MAX_FILE_SIZE, DEFAULT_SIGNED_URL_TTL, MAX_SIGNED_URL_TTL};
use crate::error::{StorageError, StorageResult};

pub mod context;
pub mod factory;
pub mod local;
pub mod registry;
pub mod stream;

/// Lazily readable object contents.
pub type ObjectStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Core storage backend trait that all storage implementations must implement
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Support for downcasting to concrete types
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        None
    }

    /// Identifier this implementation is normally registered under
    fn name(&self) -> &'static str;

    /// Write `request.body` under `request.key`, replacing any existing object
    async fn upload(&self, request: UploadRequest) -> StorageResult<UploadResult>;

    /// Open the object at `key` for streaming reads
    async fn download(&self, key: &str) -> StorageResult<ObjectStream>;

    /// Remove the object at `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Check if an object exists at the given key
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Produce a time-limited URL granting read or write access to `key`.
    /// Does not check whether the object exists.
    async fn get_signed_url(&self, request: SignedUrlRequest) -> StorageResult<SignedUrl>;
}

/// Payload of an upload, either fully buffered or streamed.
pub enum UploadBody {
    Bytes(Bytes),
    Stream(ObjectStream),
}

impl UploadBody {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        UploadBody::Stream(stream.boxed())
    }

    /// Length of the payload when it is known without consuming it
    pub fn known_len(&self) -> Option<u64> {
        match self {
            UploadBody::Bytes(bytes) => Some(bytes.len() as u64),
            UploadBody::Stream(_) => None,
        }
    }
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadBody::Bytes(bytes) => write!(f, "UploadBody::Bytes({} bytes)", bytes.len()),
            UploadBody::Stream(_) => f.write_str("UploadBody::Stream(..)"),
        }
    }
}

impl From<Bytes> for UploadBody {
    fn from(bytes: Bytes) -> Self {
        UploadBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for UploadBody {
    fn from(data: Vec<u8>) -> Self {
        UploadBody::Bytes(Bytes::from(data))
    }
}

impl From<&'static [u8]> for UploadBody {
    fn from(data: &'static [u8]) -> Self {
        UploadBody::Bytes(Bytes::from_static(data))
    }
}

impl From<String> for UploadBody {
    fn from(data: String) -> Self {
        UploadBody::Bytes(Bytes::from(data))
    }
}

#[derive(Debug)]
pub struct UploadRequest {
    pub key: String,
    pub body: UploadBody,
    pub content_type: String,
    /// Required by some protocols when `body` is a stream
    pub content_length: Option<u64>,
    pub metadata: HashMap<String, String>,
}

impl UploadRequest {
    pub fn new(key: impl Into<String>, body: impl Into<UploadBody>, content_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
            content_type: content_type.into(),
            content_length: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMethod {
    #[default]
    Read,
    Write,
}

impl UrlMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlMethod::Read => "read",
            UrlMethod::Write => "write",
        }
    }
}

impl fmt::Display for UrlMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrlRequest {
    pub key: String,
    pub expires_in_seconds: Option<u64>,
    pub method: UrlMethod,
    pub content_type: Option<String>,
}

impl SignedUrlRequest {
    pub fn read(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expires_in_seconds: None,
            method: UrlMethod::Read,
            content_type: None,
        }
    }

    pub fn write(key: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expires_in_seconds: None,
            method: UrlMethod::Write,
            content_type: Some(content_type.into()),
        }
    }

    pub fn expires_in(mut self, seconds: u64) -> Self {
        self.expires_in_seconds = Some(seconds);
        self
    }

    /// Check the request shape and resolve its lifetime, falling back to
    /// `default_ttl` when no explicit expiration was requested.
    pub fn resolve_ttl(&self, default_ttl: Duration) -> StorageResult<Duration> {
        if self.method == UrlMethod::Write
            && self.content_type.as_deref().map_or(true, |ct| ct.trim().is_empty())
        {
            return Err(StorageError::invalid_file_type(
                format!("a content type is required to sign a write URL for '{}'", self.key),
                None,
            ));
        }

        let ttl = match self.expires_in_seconds {
            Some(seconds) => Duration::from_secs(seconds),
            None => default_ttl,
        };

        if ttl.is_zero() || ttl.as_secs() > MAX_SIGNED_URL_TTL {
            return Err(StorageError::backend(format!(
                "signed URL expiration must be between 1 and {} seconds",
                MAX_SIGNED_URL_TTL
            ))
            .with_detail("key", self.key.as_str())
            .with_detail("expires_in_seconds", ttl.as_secs()));
        }

        Ok(ttl)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrl {
    pub url: String,
    pub method: UrlMethod,
    pub expires_at: DateTime<Utc>,
}

/// Settings every backend takes from the provider-agnostic configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOptions {
    pub signed_url_ttl: Duration,
    pub max_file_size_bytes: u64,
}

impl BackendOptions {
    pub fn from_common(common: &CommonSettings) -> Self {
        Self {
            signed_url_ttl: common.signed_url_ttl(),
            max_file_size_bytes: common.max_file_size_bytes,
        }
    }
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            signed_url_ttl: Duration::from_secs(DEFAULT_SIGNED_URL_TTL),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Expiry timestamp for a URL signed now with the given lifetime.
pub(crate) fn expires_at(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_url_requires_content_type() {
        let request = SignedUrlRequest {
            key: "avatar.png".to_string(),
            expires_in_seconds: None,
            method: UrlMethod::Write,
            content_type: None,
        };

        let err = request.resolve_ttl(Duration::from_secs(900)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidFileType);
    }

    #[test]
    fn test_ttl_falls_back_to_default() {
        let ttl = SignedUrlRequest::read("a.txt")
            .resolve_ttl(Duration::from_secs(900))
            .unwrap();
        assert_eq!(ttl, Duration::from_secs(900));

        let ttl = SignedUrlRequest::read("a.txt")
            .expires_in(60)
            .resolve_ttl(Duration::from_secs(900))
            .unwrap();
        assert_eq!(ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_ttl_bounds() {
        let default = Duration::from_secs(900);
        assert!(SignedUrlRequest::read("a").expires_in(0).resolve_ttl(default).is_err());
        assert!(SignedUrlRequest::read("a")
            .expires_in(MAX_SIGNED_URL_TTL + 1)
            .resolve_ttl(default)
            .is_err());
        assert!(SignedUrlRequest::read("a")
            .expires_in(MAX_SIGNED_URL_TTL)
            .resolve_ttl(default)
            .is_ok());
    }

    #[test]
    fn test_body_known_len() {
        assert_eq!(UploadBody::from(b"hello".as_slice()).known_len(), Some(5));
        let stream = futures::stream::iter(vec![Ok(Bytes::from_static(b"x"))]);
        assert_eq!(UploadBody::from_stream(stream).known_len(), None);
    }
}
