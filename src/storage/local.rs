//! Local filesystem storage backend implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::stream::{copy_limited, ensure_declared_length, ensure_size_within, sha256_hex};
use super::{
    expires_at, BackendOptions, ObjectStream, SignedUrl, SignedUrlRequest, StorageBackend,
    UploadBody, UploadRequest, UploadResult, UrlMethod,
};
use crate::config::{Environment, FieldReader};
use crate::error::{FieldViolation, StorageError, StorageResult};

pub const ENV_LOCAL_PATH: &str = "STORAGE_LOCAL_PATH";
pub const ENV_LOCAL_URL_PREFIX: &str = "STORAGE_LOCAL_URL_PREFIX";
pub const ENV_LOCAL_SIGNING_SECRET: &str = "STORAGE_LOCAL_SIGNING_SECRET";

pub const DEFAULT_LOCAL_PATH: &str = "./storage/uploads";
pub const DEFAULT_LOCAL_URL_PREFIX: &str = "/files";

#[derive(Clone, PartialEq, Eq)]
pub struct LocalSettings {
    pub root: PathBuf,
    pub url_prefix: String,
    /// Key for signed URLs; a random one is generated per backend when unset
    pub signing_secret: Option<String>,
}

impl LocalSettings {
    pub fn from_env(env: &Environment) -> Result<Self, Vec<FieldViolation>> {
        let fields = FieldReader::new(env);
        let root = PathBuf::from(fields.string_or(ENV_LOCAL_PATH, DEFAULT_LOCAL_PATH));
        let url_prefix = fields.string_or(ENV_LOCAL_URL_PREFIX, DEFAULT_LOCAL_URL_PREFIX);
        let signing_secret = fields.optional(ENV_LOCAL_SIGNING_SECRET);
        fields.finish()?;

        Ok(Self {
            root,
            url_prefix,
            signing_secret,
        })
    }
}

impl fmt::Debug for LocalSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSettings")
            .field("root", &self.root)
            .field("url_prefix", &self.url_prefix)
            .field("signing_secret", &self.signing_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Local filesystem storage backend
pub struct LocalStorageBackend {
    root: PathBuf,
    url_prefix: String,
    signing_key: Vec<u8>,
    options: BackendOptions,
}

impl LocalStorageBackend {
    /// Create a new local storage backend
    pub fn new(
        root: impl Into<PathBuf>,
        url_prefix: impl Into<String>,
        signing_key: Vec<u8>,
        options: BackendOptions,
    ) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
            signing_key,
            options,
        }
    }

    pub fn from_settings(settings: &LocalSettings, options: BackendOptions) -> Self {
        let signing_key = match &settings.signing_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => Uuid::new_v4().as_bytes().to_vec(),
        };
        Self::new(settings.root.clone(), settings.url_prefix.clone(), signing_key, options)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path under the root, refusing anything that could
    /// escape it.
    fn resolve_key(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !valid {
            return Err(StorageError::backend(format!("invalid key '{}'", key)).with_detail("key", key));
        }

        Ok(self.root.join(relative))
    }

    fn io_error(&self, operation: &str, key: &str, e: std::io::Error) -> StorageError {
        error!("Local storage {} failed for '{}': {}", operation, key, e);
        StorageError::backend(format!("local storage {} failed for '{}': {}", operation, key, e))
            .with_detail("key", key)
            .with_detail("operation", operation)
    }

    fn signature(&self, key: &str, method: UrlMethod, expires: i64, content_type: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.signing_key);
        for part in [
            method.as_str().as_bytes(),
            key.as_bytes(),
            expires.to_string().as_bytes(),
            content_type.unwrap_or_default().as_bytes(),
        ] {
            hasher.update([0u8]);
            hasher.update(part);
        }
        hasher.update([0u8]);
        hasher.update(&self.signing_key);
        format!("{:x}", hasher.finalize())
    }

    /// Check the query parameters of a URL produced by `get_signed_url`.
    pub fn verify_signed_url(
        &self,
        key: &str,
        method: UrlMethod,
        expires: i64,
        content_type: Option<&str>,
        signature: &str,
    ) -> bool {
        if expires <= Utc::now().timestamp() {
            return false;
        }
        let expected = self.signature(key, method, expires, content_type);
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }

    fn encode_key(key: &str) -> String {
        key.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    async fn write_body(
        &self,
        key: &str,
        body: UploadBody,
        declared: Option<u64>,
        target: &Path,
    ) -> StorageResult<(u64, String)> {
        match body {
            UploadBody::Bytes(bytes) => {
                let size = bytes.len() as u64;
                ensure_declared_length(key, declared, size)?;
                ensure_size_within(key, size, self.options.max_file_size_bytes)?;
                fs::write(target, &bytes)
                    .await
                    .map_err(|e| self.io_error("upload", key, e))?;
                Ok((size, sha256_hex(&bytes)))
            }
            UploadBody::Stream(stream) => {
                if let Some(declared) = declared {
                    ensure_size_within(key, declared, self.options.max_file_size_bytes)?;
                }
                let mut file = fs::File::create(target)
                    .await
                    .map_err(|e| self.io_error("upload", key, e))?;
                let stats = copy_limited(key, stream, &mut file, self.options.max_file_size_bytes).await?;
                file.sync_all()
                    .await
                    .map_err(|e| self.io_error("upload", key, e))?;
                ensure_declared_length(key, declared, stats.bytes)?;
                Ok((stats.bytes, stats.sha256))
            }
        }
    }
}

/// Byte comparison whose running time depends only on the lengths
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn name(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, request: UploadRequest) -> StorageResult<UploadResult> {
        let UploadRequest {
            key,
            body,
            content_length,
            ..
        } = request;
        let path = self.resolve_key(&key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("upload", &key, e))?;
        }

        // Write next to the target and rename so readers never see a partial file
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.{}.part", file_name, Uuid::new_v4()));

        let (size, digest) = match self.write_body(&key, body, content_length, &temp_path).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    debug!("Could not remove partial upload {:?}: {}", temp_path, cleanup);
                }
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&temp_path, &path).await {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                debug!("Could not remove partial upload {:?}: {}", temp_path, cleanup);
            }
            return Err(self.io_error("upload", &key, e));
        }

        info!("Stored file locally: {} ({} bytes)", path.display(), size);
        Ok(UploadResult {
            key,
            size,
            etag: Some(digest),
            url: None,
        })
    }

    async fn download(&self, key: &str) -> StorageResult<ObjectStream> {
        let path = self.resolve_key(key)?;

        match fs::File::open(&path).await {
            Ok(file) => {
                let metadata = file
                    .metadata()
                    .await
                    .map_err(|e| self.io_error("download", key, e))?;
                // Directories open fine on unix but are not objects
                if !metadata.is_file() {
                    return Err(StorageError::not_found(key));
                }
                debug!("Streaming local file: {}", path.display());
                Ok(ReaderStream::new(file).boxed())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::not_found(key)),
            Err(e) => Err(self.io_error("download", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve_key(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted file: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Attempted to delete non-existent file: {}", key);
                Ok(())
            }
            Err(e) => Err(self.io_error("delete", key, e)),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.resolve_key(key)?;

        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error("exists", key, e)),
        }
    }

    async fn get_signed_url(&self, request: SignedUrlRequest) -> StorageResult<SignedUrl> {
        self.resolve_key(&request.key)?;
        let ttl = request.resolve_ttl(self.options.signed_url_ttl)?;
        let expires_at: DateTime<Utc> = expires_at(ttl);
        let expires = expires_at.timestamp();
        let content_type = match request.method {
            UrlMethod::Write => request.content_type.as_deref(),
            UrlMethod::Read => None,
        };

        let signature = self.signature(&request.key, request.method, expires, content_type);
        let url = format!(
            "{}/{}?method={}&expires={}&signature={}",
            self.url_prefix,
            Self::encode_key(&request.key),
            request.method,
            expires,
            signature
        );

        Ok(SignedUrl {
            url,
            method: request.method,
            expires_at,
        })
    }
}
