use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{
    ensure_content_type_allowed, validate, CommonSettings, ConfigLoader, Environment, SchemaRegistry,
    DEFAULT_MAX_FILE_SIZE, DEFAULT_QUOTA_BYTES, DEFAULT_SIGNED_URL_TTL, ENV_BACKEND,
    ENV_MAX_FILE_SIZE, ENV_QUOTA_BYTES, ENV_SIGNED_URL_TTL,
};
use crate::error::{ErrorKind, FieldViolation, StorageError};
use crate::services::s3_service::{
    S3Settings, ENV_S3_ACCESS_KEY_ID, ENV_S3_BUCKET, ENV_S3_REGION, ENV_S3_SECRET_ACCESS_KEY,
};
use crate::storage::local::{LocalSettings, DEFAULT_LOCAL_PATH, DEFAULT_LOCAL_URL_PREFIX};

fn env(pairs: &[(&str, &str)]) -> Environment {
    Environment::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

// Schema registry with the two built-in providers
fn builtin_schemas() -> Arc<SchemaRegistry> {
    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register("local", LocalSettings::from_env);
    schemas.register("s3", S3Settings::from_env);
    schemas
}

fn violations(err: StorageError) -> Vec<FieldViolation> {
    match err {
        StorageError::ConfigurationInvalid { violations } => violations,
        other => panic!("expected ConfigurationInvalid, got {:?}", other),
    }
}

#[test]
fn test_defaults_when_environment_is_empty() {
    let config = validate(&Environment::empty(), &builtin_schemas()).expect("defaults should validate");

    assert_eq!(config.common.backend_identifier, "local");
    assert_eq!(config.common.max_file_size_bytes, DEFAULT_MAX_FILE_SIZE);
    assert_eq!(config.common.max_file_size_bytes, 10_485_760);
    assert_eq!(config.common.quota_bytes, DEFAULT_QUOTA_BYTES);
    assert_eq!(config.common.signed_url_ttl_seconds, DEFAULT_SIGNED_URL_TTL);
    assert_eq!(config.common, CommonSettings::default());

    let local = config
        .backend_settings::<LocalSettings>("local")
        .expect("local settings should be validated");
    assert_eq!(local.root.to_string_lossy(), DEFAULT_LOCAL_PATH);
    assert_eq!(local.url_prefix, DEFAULT_LOCAL_URL_PREFIX);
    assert!(local.signing_secret.is_none());
}

#[test]
fn test_s3_without_bucket_names_the_field() {
    let err = validate(
        &env(&[
            (ENV_BACKEND, "s3"),
            (ENV_S3_REGION, "us-east-1"),
            (ENV_S3_ACCESS_KEY_ID, "AKIAEXAMPLE"),
            (ENV_S3_SECRET_ACCESS_KEY, "super-secret-value"),
        ]),
        &builtin_schemas(),
    )
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
    assert!(err.to_string().contains("bucket"));

    let violations = violations(err);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].field, "bucket");
    assert_eq!(violations[0].env_var, ENV_S3_BUCKET);
}

#[test]
fn test_secret_never_appears_in_configuration_errors() {
    let err = validate(
        &env(&[
            (ENV_BACKEND, "s3"),
            (ENV_S3_SECRET_ACCESS_KEY, "super-secret-value"),
        ]),
        &builtin_schemas(),
    )
    .unwrap_err();

    let body = serde_json::to_string(&err.to_body()).unwrap();
    assert!(!body.contains("super-secret-value"));
    assert!(!err.to_string().contains("super-secret-value"));
}

#[test]
fn test_all_violations_are_reported_together() {
    let err = validate(
        &env(&[
            (ENV_BACKEND, "s3"),
            (ENV_MAX_FILE_SIZE, "lots"),
            (ENV_QUOTA_BYTES, "0"),
        ]),
        &builtin_schemas(),
    )
    .unwrap_err();

    let fields: Vec<String> = violations(err).into_iter().map(|v| v.field).collect();
    assert_eq!(
        fields,
        vec![
            "max_file_size_bytes",
            "quota_bytes",
            "region",
            "bucket",
            "access_key_id",
            "secret_access_key",
        ]
    );
}

#[test]
fn test_signed_url_ttl_upper_bound() {
    let err = validate(&env(&[(ENV_SIGNED_URL_TTL, "604801")]), &builtin_schemas()).unwrap_err();
    let violations = violations(err);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].field, "signed_url_ttl_seconds");

    let config = validate(&env(&[(ENV_SIGNED_URL_TTL, "604800")]), &builtin_schemas()).unwrap();
    assert_eq!(config.common.signed_url_ttl_seconds, 604_800);
}

#[test]
fn test_identifier_without_schema_passes_validation() {
    let config = validate(&env(&[(ENV_BACKEND, "azure")]), &builtin_schemas())
        .expect("unknown identifiers are resolved later by the registry");

    assert_eq!(config.common.backend_identifier, "azure");
    assert!(config.backend_summary("azure").is_none());
}

#[test]
fn test_custom_schema_settings_are_typed() {
    #[derive(Debug, Clone, PartialEq)]
    struct MemorySettings {
        capacity: u64,
    }

    let schemas = builtin_schemas();
    schemas.register("memory", |env: &Environment| {
        let mut fields = crate::config::FieldReader::new(env);
        let capacity = fields.positive_int("capacity", "MEMORY_CAPACITY", 16);
        fields.finish()?;
        Ok(MemorySettings { capacity })
    });

    let config = validate(&env(&[(ENV_BACKEND, "memory"), ("MEMORY_CAPACITY", "64")]), &schemas).unwrap();

    assert_eq!(
        config.backend_settings::<MemorySettings>("memory"),
        Some(&MemorySettings { capacity: 64 })
    );
    // Wrong type requested
    assert!(config.backend_settings::<LocalSettings>("memory").is_none());
}

#[test]
fn test_backend_summary_redacts_credentials() {
    let config = validate(
        &env(&[
            (ENV_BACKEND, "s3"),
            (ENV_S3_REGION, "us-east-1"),
            (ENV_S3_BUCKET, "uploads"),
            (ENV_S3_ACCESS_KEY_ID, "AKIAEXAMPLE"),
            (ENV_S3_SECRET_ACCESS_KEY, "super-secret-value"),
        ]),
        &builtin_schemas(),
    )
    .unwrap();

    let summary = config.backend_summary("s3").unwrap();
    assert!(summary.contains("uploads"));
    assert!(!summary.contains("super-secret-value"));
    assert!(!format!("{:?}", config).contains("super-secret-value"));
}

#[test]
fn test_loader_caches_until_reset() {
    let parses = Arc::new(AtomicUsize::new(0));
    let schemas = Arc::new(SchemaRegistry::new());
    let counter = parses.clone();
    schemas.register("local", move |env: &Environment| {
        counter.fetch_add(1, Ordering::SeqCst);
        LocalSettings::from_env(env)
    });

    let loader = ConfigLoader::new(Environment::empty(), schemas);
    assert!(!loader.is_loaded());

    let first = loader.get().unwrap();
    let second = loader.get().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(loader.is_loaded());
    assert_eq!(parses.load(Ordering::SeqCst), 1);

    loader.reset();
    assert!(!loader.is_loaded());
    let third = loader.get().unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(parses.load(Ordering::SeqCst), 2);
}

#[test]
fn test_loader_does_not_cache_failures() {
    let loader = ConfigLoader::new(env(&[(ENV_BACKEND, "s3")]), builtin_schemas());

    assert!(loader.get().is_err());
    assert!(!loader.is_loaded());
    assert!(loader.get().is_err());
}

#[test]
fn test_settings_for_non_default_backend() {
    let loader = ConfigLoader::new(
        env(&[
            (ENV_S3_REGION, "us-east-1"),
            (ENV_S3_BUCKET, "uploads"),
            (ENV_S3_ACCESS_KEY_ID, "AKIAEXAMPLE"),
            (ENV_S3_SECRET_ACCESS_KEY, "secret"),
        ]),
        builtin_schemas(),
    );

    let (common, s3) = loader.settings_for::<S3Settings>("s3").unwrap();
    assert_eq!(common.backend_identifier, "local");
    assert_eq!(s3.bucket, "uploads");

    let err = loader.settings_for::<S3Settings>("gcs").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
}

#[test]
fn test_file_size_and_quota_guards() {
    let common = CommonSettings {
        max_file_size_bytes: 100,
        quota_bytes: 1_000,
        ..CommonSettings::default()
    };

    assert!(common.ensure_file_size(100).is_ok());
    assert_eq!(common.ensure_file_size(101).unwrap_err().kind(), ErrorKind::QuotaExceeded);

    assert!(common.ensure_within_quota(900, 100).is_ok());
    let err = common.ensure_within_quota(950, 100).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert_eq!(err.http_status(), 403);
    assert_eq!(err.details()["quota_bytes"], 1_000);
}

#[test]
fn test_content_type_allow_list() {
    assert!(ensure_content_type_allowed("image/png", &[]).is_ok());
    assert!(ensure_content_type_allowed("image/png", &["image/*"]).is_ok());
    assert!(ensure_content_type_allowed("text/plain; charset=utf-8", &["text/plain"]).is_ok());
    assert!(ensure_content_type_allowed("Application/PDF", &["application/pdf"]).is_ok());

    let err = ensure_content_type_allowed("application/zip", &["image/*", "text/plain"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFileType);
    assert_eq!(err.http_status(), 400);

    assert!(ensure_content_type_allowed("not-a-type", &[]).is_err());
}
