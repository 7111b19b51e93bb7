//! Registry, factory and context behaviour as seen by callers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use stowage::config::ENV_BACKEND;
use stowage::services::s3_service::{ENV_S3_ACCESS_KEY_ID, ENV_S3_REGION, ENV_S3_SECRET_ACCESS_KEY};
use stowage::storage::stream::collect_stream;
use stowage::test_helpers::{create_test_context, test_environment, InMemoryObjectClient};
use stowage::{
    BackendOptions, ErrorKind, LocalStorageBackend, S3Service, StorageBackend, StorageContext,
    StorageError, UploadRequest,
};

#[tokio::test]
async fn test_default_context_serves_local_backend() {
    let temp_dir = TempDir::new().unwrap();
    let context = create_test_context(temp_dir.path(), &[]);

    let backend = context.backend().expect("local backend should be available by default");
    assert_eq!(backend.name(), "local");

    backend
        .upload(UploadRequest::new("hello.txt", Bytes::from_static(b"hi"), "text/plain"))
        .await
        .unwrap();
    assert!(temp_dir.path().join("hello.txt").exists());

    let body = collect_stream(backend.download("hello.txt").await.unwrap()).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"hi"));
}

#[test]
fn test_backend_instances_are_cached() {
    let temp_dir = TempDir::new().unwrap();
    let context = create_test_context(temp_dir.path(), &[]);

    let first = context.get_backend("local").unwrap();
    let second = context.backend().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(context.factory().is_cached("local"));

    context.reset_cache();
    assert!(!context.factory().is_cached("local"));
    let third = context.get_backend("local").unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
}

#[test]
fn test_unregistered_identifier_lists_registered_backends() {
    let temp_dir = TempDir::new().unwrap();
    let context = create_test_context(temp_dir.path(), &[]);

    let err = match context.get_backend("azure") {
        Err(err) => err,
        Ok(_) => panic!("azure is not registered"),
    };

    match &err {
        StorageError::BackendNotRegistered { identifier, registered } => {
            assert_eq!(identifier, "azure");
            assert!(registered.contains(&"local".to_string()));
        }
        other => panic!("expected BackendNotRegistered, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::BackendNotRegistered);
    assert!(!context.factory().is_cached("azure"));
}

#[test]
fn test_unknown_configured_backend_fails_at_lookup() {
    let temp_dir = TempDir::new().unwrap();
    let context = create_test_context(temp_dir.path(), &[(ENV_BACKEND, "azure")]);

    // Configuration itself is valid; only the lookup fails
    assert!(context.config().is_ok());
    let err = context.backend().err().expect("azure has no constructor");
    assert_eq!(err.kind(), ErrorKind::BackendNotRegistered);
}

#[test]
fn test_invalid_configuration_surfaces_before_construction() {
    let temp_dir = TempDir::new().unwrap();
    let context = create_test_context(
        temp_dir.path(),
        &[
            (ENV_BACKEND, "s3"),
            (ENV_S3_REGION, "us-east-1"),
            (ENV_S3_ACCESS_KEY_ID, "AKIAEXAMPLE"),
            (ENV_S3_SECRET_ACCESS_KEY, "secret"),
        ],
    );

    let err = context.backend().err().expect("bucket is missing");
    match err {
        StorageError::ConfigurationInvalid { violations } => {
            assert!(violations.iter().any(|v| v.field == "bucket"));
        }
        other => panic!("expected ConfigurationInvalid, got {:?}", other),
    }
    assert!(!context.factory().is_cached("s3"));
}

#[test]
fn test_registration_is_last_writer_wins() {
    let context = StorageContext::new(test_environment(&[]));
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().to_path_buf();

    context.register_backend("memory", || {
        let (service, _client) = stowage::test_helpers::create_test_s3_service(BackendOptions::default());
        Ok(Arc::new(service) as Arc<dyn StorageBackend>)
    });
    context.register_backend("memory", move || {
        Ok(Arc::new(LocalStorageBackend::new(
            root.clone(),
            "/files",
            b"k".to_vec(),
            BackendOptions::default(),
        )) as Arc<dyn StorageBackend>)
    });

    assert_eq!(context.registry().list_registered(), vec!["memory".to_string()]);
    assert_eq!(context.get_backend("memory").unwrap().name(), "local");
}

#[test]
fn test_custom_backend_can_be_downcast() {
    let context = StorageContext::new(test_environment(&[(ENV_BACKEND, "memory")]));
    let client = Arc::new(InMemoryObjectClient::new());
    let shared = client.clone();
    context.register_backend("memory", move || {
        Ok(Arc::new(S3Service::new(shared.clone(), "memory-bucket", BackendOptions::default()))
            as Arc<dyn StorageBackend>)
    });

    let backend = context.backend().unwrap();
    let service = backend
        .as_any()
        .and_then(|any| any.downcast_ref::<S3Service>())
        .expect("backend should be an S3Service");
    assert_eq!(service.bucket(), "memory-bucket");
}

#[test]
fn test_concurrent_first_access_constructs_once() {
    let context = Arc::new(StorageContext::new(test_environment(&[])));
    let constructed = Arc::new(AtomicUsize::new(0));
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().to_path_buf();

    let counter = constructed.clone();
    context.register_backend("local", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(20));
        Ok(Arc::new(LocalStorageBackend::new(
            root.clone(),
            "/files",
            b"k".to_vec(),
            BackendOptions::default(),
        )) as Arc<dyn StorageBackend>)
    });

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let context = context.clone();
            std::thread::spawn(move || context.get_backend("local").unwrap())
        })
        .collect();
    let backends: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(constructed.load(Ordering::SeqCst), 1);
    assert!(backends.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[test]
fn test_reset_all_clears_registrations_and_config() {
    let temp_dir = TempDir::new().unwrap();
    let context = create_test_context(temp_dir.path(), &[]);

    context.backend().unwrap();
    assert!(context.config_loader().is_loaded());

    context.reset_all();

    assert!(context.registry().list_registered().is_empty());
    assert!(!context.config_loader().is_loaded());
    assert!(context.factory().cached_identifiers().is_empty());
    // Schemas survive a full reset
    assert!(context.schemas().is_registered("local"));
    assert_eq!(
        context.get_backend("local").err().map(|e| e.kind()),
        Some(ErrorKind::BackendNotRegistered)
    );
}

#[test]
fn test_global_context_has_builtin_backends() {
    let registered = stowage::global().registry().list_registered();

    assert!(registered.contains(&"local".to_string()));
    #[cfg(feature = "s3")]
    assert!(registered.contains(&"s3".to_string()));
}
