//! Bundles the backend registry, settings schemas, configuration cache and
//! instance factory into one value.
//!
//! Tests build isolated contexts with [`StorageContext::new`]; applications
//! usually go through [`global`], which reads the process environment and has
//! the built-in backends registered.

use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;

use super::factory::BackendFactory;
use super::local::{LocalSettings, LocalStorageBackend};
use super::registry::BackendRegistry;
use super::{BackendOptions, StorageBackend};
use crate::config::{ConfigLoader, Environment, SchemaRegistry, StorageConfig};
use crate::error::{FieldViolation, StorageResult};

#[cfg(feature = "s3")]
use crate::services::s3_client::AwsS3Client;
#[cfg(feature = "s3")]
use crate::services::s3_service::{S3Service, S3Settings};

pub struct StorageContext {
    schemas: Arc<SchemaRegistry>,
    config: Arc<ConfigLoader>,
    factory: BackendFactory,
}

impl StorageContext {
    /// A context with nothing registered
    pub fn new(env: Environment) -> Self {
        let schemas = Arc::new(SchemaRegistry::new());
        let config = Arc::new(ConfigLoader::new(env, schemas.clone()));
        let factory = BackendFactory::new(Arc::new(BackendRegistry::new()));
        Self {
            schemas,
            config,
            factory,
        }
    }

    /// A context with the built-in `local` (and, with the `s3` feature, `s3`)
    /// backends registered
    pub fn with_builtin_backends(env: Environment) -> Self {
        let context = Self::new(env);
        register_builtin_backends(&context);
        context
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        self.factory.registry()
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn config_loader(&self) -> &Arc<ConfigLoader> {
        &self.config
    }

    pub fn factory(&self) -> &BackendFactory {
        &self.factory
    }

    /// Validated configuration, parsed on first access
    pub fn config(&self) -> StorageResult<Arc<StorageConfig>> {
        self.config.get()
    }

    pub fn register_backend<F>(&self, identifier: impl Into<String>, constructor: F)
    where
        F: Fn() -> StorageResult<Arc<dyn StorageBackend>> + Send + Sync + 'static,
    {
        self.registry().register(identifier, constructor);
    }

    pub fn register_schema<T, F>(&self, identifier: impl Into<String>, parse: F)
    where
        T: fmt::Debug + Send + Sync + 'static,
        F: Fn(&Environment) -> Result<T, Vec<FieldViolation>> + Send + Sync + 'static,
    {
        self.schemas.register(identifier, parse);
    }

    pub fn get_backend(&self, identifier: &str) -> StorageResult<Arc<dyn StorageBackend>> {
        self.factory.get_backend(identifier)
    }

    /// The backend selected by configuration. Configuration errors surface
    /// first; an identifier without a registered constructor fails afterwards.
    pub fn backend(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        let config = self.config()?;
        self.factory.get_backend(&config.common.backend_identifier)
    }

    pub fn reset_cache(&self) {
        self.factory.reset_cache();
    }

    pub fn reset_config(&self) {
        self.config.reset();
    }

    /// Clear instances, registrations and cached configuration. Settings
    /// schemas are kept; use [`SchemaRegistry::reset`] for those.
    pub fn reset_all(&self) {
        self.factory.reset_all();
        self.config.reset();
    }
}

/// Register the backends that ship with this crate on `context`.
pub fn register_builtin_backends(context: &StorageContext) {
    context.register_schema("local", LocalSettings::from_env);
    let config = context.config_loader().clone();
    context.register_backend("local", move || {
        let (common, settings) = config.settings_for::<LocalSettings>("local")?;
        let backend = LocalStorageBackend::from_settings(&settings, BackendOptions::from_common(&common));
        Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
    });

    #[cfg(feature = "s3")]
    {
        context.register_schema("s3", S3Settings::from_env);
        let config = context.config_loader().clone();
        context.register_backend("s3", move || {
            let (common, settings) = config.settings_for::<S3Settings>("s3")?;
            let client = AwsS3Client::from_settings(&settings);
            let backend = S3Service::new(Arc::new(client), settings.bucket.clone(), BackendOptions::from_common(&common));
            Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
        });
    }
}

static GLOBAL: Lazy<StorageContext> =
    Lazy::new(|| StorageContext::with_builtin_backends(Environment::process()));

/// Process-wide context over the live environment
pub fn global() -> &'static StorageContext {
    &GLOBAL
}
