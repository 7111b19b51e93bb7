//! Object-store client seam used by the S3-compatible backend.
//!
//! [`S3Service`](super::s3_service::S3Service) talks to storage only through
//! [`ObjectStoreClient`], so tests can substitute an in-memory client. The
//! production implementation wraps `aws_sdk_s3::Client` and reports failures
//! in the small [`ClientError`] vocabulary produced by
//! [`S3ErrorClassifier`](super::s3_error_classifier::S3ErrorClassifier).

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::storage::{ObjectStream, UrlMethod};

#[cfg(feature = "s3")]
use aws_credential_types::Credentials;
#[cfg(feature = "s3")]
use aws_sdk_s3::config::retry::RetryConfig;
#[cfg(feature = "s3")]
use aws_sdk_s3::config::{RequestChecksumCalculation, ResponseChecksumValidation};
#[cfg(feature = "s3")]
use aws_sdk_s3::presigning::PresigningConfig;
#[cfg(feature = "s3")]
use aws_sdk_s3::primitives::ByteStream;
#[cfg(feature = "s3")]
use aws_sdk_s3::Client;
#[cfg(feature = "s3")]
use aws_types::region::Region as AwsRegion;
#[cfg(feature = "s3")]
use futures::StreamExt;
#[cfg(feature = "s3")]
use tokio_util::io::ReaderStream;
#[cfg(feature = "s3")]
use tracing::info;

#[cfg(feature = "s3")]
use super::s3_error_classifier::S3ErrorClassifier;
#[cfg(feature = "s3")]
use super::s3_service::S3Settings;

/// Coarse classification of a client failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// The object (not the bucket) does not exist
    NotFound,
    /// The service could not be reached at all
    Unreachable,
    /// Credentials or request signature were rejected
    AuthRejected,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    /// Provider error code such as `NoSuchKey`, when one was returned
    pub code: Option<String>,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Other, message)
    }

    pub fn with_code(mut self, code: Option<&str>) -> Self {
        self.code = code.map(str::to_string);
        self
    }
}

/// Body of a put request with a length known up front.
pub enum PutBody {
    Bytes(Bytes),
    /// Contents spooled to a file on disk
    File { path: PathBuf, len: u64 },
}

impl PutBody {
    pub fn len(&self) -> u64 {
        match self {
            PutBody::Bytes(bytes) => bytes.len() as u64,
            PutBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PutBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutBody::Bytes(bytes) => write!(f, "PutBody::Bytes({} bytes)", bytes.len()),
            PutBody::File { path, len } => write!(f, "PutBody::File({:?}, {} bytes)", path, len),
        }
    }
}

#[derive(Debug)]
pub struct PutObjectInput {
    pub bucket: String,
    pub key: String,
    pub body: PutBody,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutObjectOutput {
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignInput {
    pub bucket: String,
    pub key: String,
    pub method: UrlMethod,
    pub content_type: Option<String>,
    pub expires_in: Duration,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn put_object(&self, input: PutObjectInput) -> Result<PutObjectOutput, ClientError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectStream, ClientError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<(), ClientError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError>;

    /// Presigned URL for `input`. Pure computation over credentials.
    async fn presign(&self, input: PresignInput) -> Result<String, ClientError>;
}

/// Build an S3 client from validated settings.
///
/// The SDK's own retries are disabled; retry policy belongs to callers.
/// Checksums are only computed when an operation requires them, which keeps
/// presigned PUT URLs usable with arbitrary bodies.
#[cfg(feature = "s3")]
pub fn build_s3_client(settings: &S3Settings) -> Client {
    let credentials = Credentials::new(
        &settings.access_key_id,
        &settings.secret_access_key,
        None, // session token
        None, // expiry
        "stowage-env",
    );

    let mut builder = aws_sdk_s3::config::Builder::new()
        .region(AwsRegion::new(settings.region.clone()))
        .credentials_provider(credentials)
        .behavior_version_latest()
        .retry_config(RetryConfig::disabled())
        .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
        .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
        .force_path_style(settings.force_path_style);

    // Set custom endpoint if provided (for S3-compatible services)
    if let Some(endpoint_url) = &settings.endpoint {
        builder = builder.endpoint_url(endpoint_url);
        info!("Using custom S3 endpoint: {}", endpoint_url);
    }

    Client::from_conf(builder.build())
}

/// [`ObjectStoreClient`] backed by `aws-sdk-s3`.
#[cfg(feature = "s3")]
#[derive(Debug, Clone)]
pub struct AwsS3Client {
    client: Client,
}

#[cfg(feature = "s3")]
impl AwsS3Client {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_settings(settings: &S3Settings) -> Self {
        Self::new(build_s3_client(settings))
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[cfg(feature = "s3")]
#[async_trait]
impl ObjectStoreClient for AwsS3Client {
    async fn put_object(&self, input: PutObjectInput) -> Result<PutObjectOutput, ClientError> {
        let content_length = input.body.len() as i64;
        let body = match input.body {
            PutBody::Bytes(bytes) => ByteStream::from(bytes),
            PutBody::File { path, .. } => ByteStream::from_path(&path)
                .await
                .map_err(|e| ClientError::other(format!("failed to open spooled body: {}", e)))?,
        };

        let mut request = self
            .client
            .put_object()
            .bucket(&input.bucket)
            .key(&input.key)
            .content_type(&input.content_type)
            .content_length(content_length)
            .body(body);

        for (k, v) in input.metadata {
            request = request.metadata(k, v);
        }

        let output = request
            .send()
            .await
            .map_err(|e| S3ErrorClassifier::classify(&e))?;

        Ok(PutObjectOutput {
            etag: output.e_tag().map(|tag| tag.trim_matches('"').to_string()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectStream, ClientError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| S3ErrorClassifier::classify(&e))?;

        Ok(ReaderStream::new(output.body.into_async_read()).boxed())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        self.client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| S3ErrorClassifier::classify(&e))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| S3ErrorClassifier::classify(&e))?;
        Ok(())
    }

    async fn presign(&self, input: PresignInput) -> Result<String, ClientError> {
        let presigning_config = PresigningConfig::expires_in(input.expires_in)
            .map_err(|e| ClientError::other(format!("invalid presigning duration: {}", e)))?;

        let presigned = match input.method {
            UrlMethod::Read => self
                .client
                .get_object()
                .bucket(&input.bucket)
                .key(&input.key)
                .presigned(presigning_config)
                .await
                .map_err(|e| S3ErrorClassifier::classify(&e))?,
            UrlMethod::Write => {
                let mut request = self.client.put_object().bucket(&input.bucket).key(&input.key);
                if let Some(content_type) = &input.content_type {
                    request = request.content_type(content_type);
                }
                request
                    .presigned(presigning_config)
                    .await
                    .map_err(|e| S3ErrorClassifier::classify(&e))?
            }
        };

        Ok(presigned.uri().to_string())
    }
}
