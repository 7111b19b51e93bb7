/*!
 * Test Helpers and Utilities
 *
 * This module provides an in-memory object-store client, isolated contexts and
 * (with the `test-utils` feature) a disposable MinIO server. Tests can modify
 * the returned objects as needed.
 */

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Environment;
use crate::services::s3_client::{
    ClientError, ClientErrorKind, ObjectStoreClient, PresignInput, PutBody, PutObjectInput, PutObjectOutput,
};
use crate::services::s3_service::S3Service;
use crate::storage::context::StorageContext;
use crate::storage::local::ENV_LOCAL_PATH;
use crate::storage::stream::sha256_hex;
use crate::storage::{BackendOptions, ObjectStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// [`ObjectStoreClient`] that keeps objects in memory. Failures queued with
/// [`InMemoryObjectClient::fail_next`] are returned by the next calls in order.
#[derive(Default)]
pub struct InMemoryObjectClient {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    failures: Mutex<VecDeque<ClientError>>,
    calls: AtomicUsize,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<(String, String), StoredObject>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next(&self, error: ClientError) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(error);
    }

    fn take_failure(&self) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects().len()
    }

    /// Number of client calls made so far, failed ones included
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectClient {
    async fn put_object(&self, input: PutObjectInput) -> Result<PutObjectOutput, ClientError> {
        self.take_failure()?;

        let data = match input.body {
            PutBody::Bytes(bytes) => bytes,
            PutBody::File { path, .. } => Bytes::from(
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| ClientError::other(format!("failed to read spooled body: {}", e)))?,
            ),
        };
        let etag = sha256_hex(&data);

        self.objects().insert(
            (input.bucket, input.key),
            StoredObject {
                data,
                content_type: input.content_type,
                metadata: input.metadata,
            },
        );

        Ok(PutObjectOutput { etag: Some(etag) })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectStream, ClientError> {
        self.take_failure()?;

        let object = self.object(bucket, key).ok_or_else(|| {
            ClientError::new(ClientErrorKind::NotFound, "NoSuchKey")
                .with_code(Some("NoSuchKey"))
        })?;

        // Hand the body out in small chunks to exercise streaming consumers
        let chunks: Vec<std::io::Result<Bytes>> = object
            .data
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        self.take_failure()?;

        if self.object(bucket, key).is_some() {
            Ok(())
        } else {
            Err(ClientError::new(ClientErrorKind::NotFound, "NotFound"))
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        self.take_failure()?;

        self.objects().remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn presign(&self, input: PresignInput) -> Result<String, ClientError> {
        self.take_failure()?;

        let mut url = format!(
            "memory://{}/{}?method={}&expires_in={}",
            input.bucket,
            input.key,
            input.method,
            input.expires_in.as_secs()
        );
        if let Some(content_type) = input.content_type {
            url.push_str(&format!("&content_type={}", urlencoding::encode(&content_type)));
        }
        Ok(url)
    }
}

/// An S3 backend over a fresh in-memory client; the client is returned so
/// tests can inspect it and inject failures.
pub fn create_test_s3_service(options: BackendOptions) -> (S3Service, Arc<InMemoryObjectClient>) {
    let client = Arc::new(InMemoryObjectClient::new());
    let service = S3Service::new(client.clone(), "test-bucket", options);
    (service, client)
}

/// Fixed environment from string pairs
pub fn test_environment(pairs: &[(&str, &str)]) -> Environment {
    Environment::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

/// Context with built-in backends whose local backend writes under `root`
pub fn create_test_context(root: &Path, extra: &[(&str, &str)]) -> StorageContext {
    let root = root.to_string_lossy().into_owned();
    let mut pairs: Vec<(&str, &str)> = vec![(ENV_LOCAL_PATH, root.as_str())];
    pairs.extend_from_slice(extra);
    StorageContext::with_builtin_backends(test_environment(&pairs))
}

/// Disposable MinIO server for end-to-end tests. Requires Docker.
#[cfg(feature = "test-utils")]
pub mod minio {
    use testcontainers_modules::minio::MinIO;
    use testcontainers_modules::testcontainers::runners::AsyncRunner;
    use testcontainers_modules::testcontainers::ContainerAsync;

    use crate::services::s3_service::S3Settings;

    pub const MINIO_ACCESS_KEY: &str = "minioadmin";
    pub const MINIO_SECRET_KEY: &str = "minioadmin";

    pub struct MinioServer {
        _container: ContainerAsync<MinIO>,
        pub endpoint: String,
    }

    impl MinioServer {
        pub async fn start() -> anyhow::Result<Self> {
            let container = MinIO::default().start().await?;
            let port = container.get_host_port_ipv4(9000).await?;
            Ok(Self {
                _container: container,
                endpoint: format!("http://127.0.0.1:{}", port),
            })
        }

        pub fn settings(&self, bucket: &str) -> S3Settings {
            S3Settings {
                endpoint: Some(self.endpoint.clone()),
                region: "us-east-1".to_string(),
                bucket: bucket.to_string(),
                access_key_id: MINIO_ACCESS_KEY.to_string(),
                secret_access_key: MINIO_SECRET_KEY.to_string(),
                force_path_style: true,
            }
        }
    }
}
