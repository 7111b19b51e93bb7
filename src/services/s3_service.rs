use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::s3_client::{ClientError, ClientErrorKind, ObjectStoreClient, PresignInput, PutBody, PutObjectInput};
use crate::config::{Environment, FieldReader};
use crate::error::{FieldViolation, StorageError, StorageResult};
use crate::storage::stream::{ensure_declared_length, ensure_size_within, spool_to_tempfile};
use crate::storage::{
    expires_at, BackendOptions, ObjectStream, SignedUrl, SignedUrlRequest, StorageBackend,
    UploadBody, UploadRequest, UploadResult,
};

pub const ENV_S3_ENDPOINT: &str = "S3_ENDPOINT";
pub const ENV_S3_REGION: &str = "S3_REGION";
pub const ENV_S3_BUCKET: &str = "S3_BUCKET";
pub const ENV_S3_ACCESS_KEY_ID: &str = "S3_ACCESS_KEY_ID";
pub const ENV_S3_SECRET_ACCESS_KEY: &str = "S3_SECRET_ACCESS_KEY";
pub const ENV_S3_FORCE_PATH_STYLE: &str = "S3_FORCE_PATH_STYLE";

/// Provider-specific settings for the S3-compatible backend.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// Custom endpoint for self-hosted S3-compatible services
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Path-style addressing; on by default whenever a custom endpoint is set
    pub force_path_style: bool,
}

impl S3Settings {
    pub fn from_env(env: &Environment) -> Result<Self, Vec<FieldViolation>> {
        let mut fields = FieldReader::new(env);
        let endpoint = fields.http_url("endpoint", ENV_S3_ENDPOINT);
        let region = fields.required("region", ENV_S3_REGION);
        let bucket = fields.required("bucket", ENV_S3_BUCKET);
        let access_key_id = fields.required("access_key_id", ENV_S3_ACCESS_KEY_ID);
        let secret_access_key = fields.required("secret_access_key", ENV_S3_SECRET_ACCESS_KEY);
        let force_path_style =
            fields.boolean("force_path_style", ENV_S3_FORCE_PATH_STYLE, endpoint.is_some());
        fields.finish()?;

        Ok(Self {
            endpoint,
            region,
            bucket,
            access_key_id,
            secret_access_key,
            force_path_style,
        })
    }
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

/// S3-compatible storage backend.
///
/// The backend is handed a ready [`ObjectStoreClient`]; building the network
/// client is the constructor's job. Every client failure is translated into a
/// [`StorageError`] before it leaves this type.
pub struct S3Service {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    options: BackendOptions,
}

impl S3Service {
    pub fn new(client: Arc<dyn ObjectStoreClient>, bucket: impl Into<String>, options: BackendOptions) -> Self {
        let bucket = bucket.into();
        debug!("Initializing S3 storage backend for bucket '{}'", bucket);
        Self {
            client,
            bucket,
            options,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// S3 object keys must be non-empty and must not start with a slash
    fn validate_key(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::backend(format!("invalid key '{}'", key))
                .with_detail("key", key)
                .with_detail("bucket", self.bucket.as_str()));
        }
        Ok(())
    }

    fn map_client_error(&self, operation: &str, key: &str, err: ClientError) -> StorageError {
        let mapped = match err.kind {
            ClientErrorKind::NotFound if operation != "upload" => {
                return StorageError::not_found(key);
            }
            ClientErrorKind::Unreachable => {
                StorageError::backend(format!("storage service unavailable: {}", err.message))
            }
            ClientErrorKind::AuthRejected => StorageError::backend("storage authentication failed"),
            _ => StorageError::backend(format!("S3 {} failed for '{}': {}", operation, key, err.message)),
        };

        error!("S3 {} failed for {}/{}: {}", operation, self.bucket, key, mapped);

        let mapped = mapped
            .with_detail("key", key)
            .with_detail("bucket", self.bucket.as_str())
            .with_detail("operation", operation);
        match err.code {
            Some(code) => mapped.with_detail("provider_code", code),
            None => mapped,
        }
    }
}

#[async_trait]
impl StorageBackend for S3Service {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn name(&self) -> &'static str {
        "s3"
    }

    async fn upload(&self, request: UploadRequest) -> StorageResult<UploadResult> {
        let UploadRequest {
            key,
            body,
            content_type,
            content_length,
            metadata,
        } = request;
        self.validate_key(&key)?;

        info!("Storing file to S3: {}/{}", self.bucket, key);

        // The spooled file must outlive the request that reads it
        let (body, _spool) = match body {
            UploadBody::Bytes(bytes) => {
                ensure_declared_length(&key, content_length, bytes.len() as u64)?;
                ensure_size_within(&key, bytes.len() as u64, self.options.max_file_size_bytes)?;
                (PutBody::Bytes(bytes), None)
            }
            UploadBody::Stream(stream) => {
                if let Some(declared) = content_length {
                    ensure_size_within(&key, declared, self.options.max_file_size_bytes)?;
                }
                let spooled = spool_to_tempfile(&key, stream, self.options.max_file_size_bytes).await?;
                ensure_declared_length(&key, content_length, spooled.stats.bytes)?;
                let body = PutBody::File {
                    path: spooled.file.path().to_path_buf(),
                    len: spooled.stats.bytes,
                };
                (body, Some(spooled))
            }
        };
        let size = body.len();

        let output = self
            .client
            .put_object(PutObjectInput {
                bucket: self.bucket.clone(),
                key: key.clone(),
                body,
                content_type,
                metadata,
            })
            .await
            .map_err(|e| self.map_client_error("upload", &key, e))?;

        info!("Successfully stored file: {} ({} bytes)", key, size);
        Ok(UploadResult {
            key,
            size,
            etag: output.etag,
            url: None,
        })
    }

    async fn download(&self, key: &str) -> StorageResult<ObjectStream> {
        self.validate_key(key)?;
        debug!("Retrieving file from S3: {}/{}", self.bucket, key);

        self.client
            .get_object(&self.bucket, key)
            .await
            .map_err(|e| self.map_client_error("download", key, e))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.validate_key(key)?;
        info!("Deleting file from S3: {}/{}", self.bucket, key);

        match self.client.delete_object(&self.bucket, key).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind == ClientErrorKind::NotFound => {
                warn!("Attempted to delete non-existent S3 object: {}", key);
                Ok(())
            }
            Err(e) => Err(self.map_client_error("delete", key, e)),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.validate_key(key)?;

        match self.client.head_object(&self.bucket, key).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind == ClientErrorKind::NotFound => {
                debug!("Object does not exist in S3: {}", key);
                Ok(false)
            }
            Err(e) => Err(self.map_client_error("exists", key, e)),
        }
    }

    async fn get_signed_url(&self, request: SignedUrlRequest) -> StorageResult<SignedUrl> {
        self.validate_key(&request.key)?;
        let ttl = request.resolve_ttl(self.options.signed_url_ttl)?;
        let expires_at = expires_at(ttl);

        debug!(
            "Generating presigned {} URL for S3 object: bucket={}, key={}, expires_in={:?}",
            request.method, self.bucket, request.key, ttl
        );

        let url = self
            .client
            .presign(PresignInput {
                bucket: self.bucket.clone(),
                key: request.key.clone(),
                method: request.method,
                content_type: request.content_type.clone(),
                expires_in: ttl,
            })
            .await
            .map_err(|e| self.map_client_error("sign", &request.key, e))?;

        Ok(SignedUrl {
            url,
            method: request.method,
            expires_at,
        })
    }
}
