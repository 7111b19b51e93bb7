//! Layered storage configuration.
//!
//! Provider-agnostic settings are always parsed. Provider-specific settings are
//! parsed by a schema looked up from [`SchemaRegistry`] using the resolved
//! backend identifier; an identifier without a schema is assumed to manage its
//! own configuration and validates successfully. The combined result is cached
//! by [`ConfigLoader`] until reset.

use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FieldViolation, StorageError, StorageResult};
use crate::storage::registry::KeyedRegistry;

pub const DEFAULT_BACKEND: &str = "local";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_QUOTA_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_SIGNED_URL_TTL: u64 = 15 * 60;
/// Longest lifetime S3 SigV4 presigning accepts (7 days)
pub const MAX_SIGNED_URL_TTL: u64 = 7 * 24 * 60 * 60;

pub const ENV_BACKEND: &str = "STORAGE_BACKEND";
pub const ENV_MAX_FILE_SIZE: &str = "STORAGE_MAX_FILE_SIZE";
pub const ENV_QUOTA_BYTES: &str = "STORAGE_QUOTA_BYTES";
pub const ENV_SIGNED_URL_TTL: &str = "STORAGE_SIGNED_URL_TTL";

#[derive(Clone)]
enum EnvSource {
    Process,
    Fixed(Arc<HashMap<String, String>>),
}

/// Where configuration values are read from.
#[derive(Clone)]
pub struct Environment {
    source: EnvSource,
}

impl Environment {
    /// The live process environment
    pub fn process() -> Self {
        Self {
            source: EnvSource::Process,
        }
    }

    /// The process environment, after loading a `.env` file if one is found
    pub fn process_with_dotenv() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => warn!("Failed to load .env file: {}", e),
        }
        Self::process()
    }

    /// A fixed set of variables, isolated from the process environment
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            source: EnvSource::Fixed(Arc::new(vars)),
        }
    }

    pub fn empty() -> Self {
        Self::from_pairs(std::iter::empty::<(String, String)>())
    }

    /// Trimmed value of `name`; empty values count as unset.
    pub fn get(&self, name: &str) -> Option<String> {
        let raw = match &self.source {
            EnvSource::Process => std::env::var(name).ok(),
            EnvSource::Fixed(vars) => vars.get(name).cloned(),
        };
        raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            EnvSource::Process => f.write_str("Environment::Process"),
            EnvSource::Fixed(vars) => write!(f, "Environment::Fixed({} vars)", vars.len()),
        }
    }
}

/// Reads fields from an [`Environment`], collecting every violation instead of
/// stopping at the first one.
pub struct FieldReader<'a> {
    env: &'a Environment,
    violations: Vec<FieldViolation>,
}

impl<'a> FieldReader<'a> {
    pub fn new(env: &'a Environment) -> Self {
        Self {
            env,
            violations: Vec::new(),
        }
    }

    pub fn violation(&mut self, field: &str, env_var: &str, message: impl Into<String>) {
        self.violations.push(FieldViolation::new(field, env_var, message));
    }

    pub fn optional(&self, env_var: &str) -> Option<String> {
        self.env.get(env_var)
    }

    pub fn required(&mut self, field: &str, env_var: &str) -> String {
        match self.env.get(env_var) {
            Some(value) => value,
            None => {
                self.violation(field, env_var, "required");
                String::new()
            }
        }
    }

    pub fn string_or(&self, env_var: &str, default: &str) -> String {
        self.env.get(env_var).unwrap_or_else(|| default.to_string())
    }

    pub fn positive_int(&mut self, field: &str, env_var: &str, default: u64) -> u64 {
        match self.env.get(env_var) {
            None => default,
            Some(raw) => match raw.parse::<u64>() {
                Ok(value) if value > 0 => value,
                _ => {
                    self.violation(field, env_var, "must be a positive integer");
                    default
                }
            },
        }
    }

    pub fn boolean(&mut self, field: &str, env_var: &str, default: bool) -> bool {
        match self.env.get(env_var) {
            None => default,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    self.violation(field, env_var, "must be a boolean");
                    default
                }
            },
        }
    }

    /// Optional absolute http(s) URL
    pub fn http_url(&mut self, field: &str, env_var: &str) -> Option<String> {
        let raw = self.env.get(env_var)?;
        match url::Url::parse(&raw) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => {
                Some(raw)
            }
            _ => {
                self.violation(field, env_var, "must be an http or https URL");
                None
            }
        }
    }

    pub fn finish(self) -> Result<(), Vec<FieldViolation>> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(self.violations)
        }
    }

    fn into_violations(self) -> Vec<FieldViolation> {
        self.violations
    }
}

/// Provider-agnostic settings shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommonSettings {
    pub backend_identifier: String,
    pub max_file_size_bytes: u64,
    pub quota_bytes: u64,
    pub signed_url_ttl_seconds: u64,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            backend_identifier: DEFAULT_BACKEND.to_string(),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            signed_url_ttl_seconds: DEFAULT_SIGNED_URL_TTL,
        }
    }
}

impl CommonSettings {
    fn read(fields: &mut FieldReader<'_>) -> Self {
        let backend_identifier = fields.string_or(ENV_BACKEND, DEFAULT_BACKEND);
        let max_file_size_bytes =
            fields.positive_int("max_file_size_bytes", ENV_MAX_FILE_SIZE, DEFAULT_MAX_FILE_SIZE);
        let quota_bytes = fields.positive_int("quota_bytes", ENV_QUOTA_BYTES, DEFAULT_QUOTA_BYTES);
        let signed_url_ttl_seconds = fields.positive_int(
            "signed_url_ttl_seconds",
            ENV_SIGNED_URL_TTL,
            DEFAULT_SIGNED_URL_TTL,
        );
        if signed_url_ttl_seconds > MAX_SIGNED_URL_TTL {
            fields.violation(
                "signed_url_ttl_seconds",
                ENV_SIGNED_URL_TTL,
                format!("must be at most {} seconds", MAX_SIGNED_URL_TTL),
            );
        }

        Self {
            backend_identifier,
            max_file_size_bytes,
            quota_bytes,
            signed_url_ttl_seconds,
        }
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_seconds)
    }

    /// Fail with quota-exceeded if a single file of `size` bytes is too large.
    pub fn ensure_file_size(&self, size: u64) -> StorageResult<()> {
        if size > self.max_file_size_bytes {
            return Err(StorageError::quota_exceeded(format!(
                "file of {} bytes exceeds the maximum file size of {} bytes",
                size, self.max_file_size_bytes
            ))
            .with_detail("size", size)
            .with_detail("max_file_size_bytes", self.max_file_size_bytes));
        }
        Ok(())
    }

    /// Fail with quota-exceeded if storing `incoming` more bytes on top of
    /// `used` would exceed the configured quota. Usage is tracked by the caller.
    pub fn ensure_within_quota(&self, used: u64, incoming: u64) -> StorageResult<()> {
        let total = used.saturating_add(incoming);
        if total > self.quota_bytes {
            return Err(StorageError::quota_exceeded(format!(
                "storing {} more bytes would exceed the quota of {} bytes",
                incoming, self.quota_bytes
            ))
            .with_detail("used_bytes", used)
            .with_detail("incoming_bytes", incoming)
            .with_detail("quota_bytes", self.quota_bytes));
        }
        Ok(())
    }
}

/// Check `content_type` against an allow-list of exact types or `type/*`
/// wildcards. An empty allow-list accepts everything.
pub fn ensure_content_type_allowed(content_type: &str, allowed: &[&str]) -> StorageResult<()> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let (top, sub) = match essence.split_once('/') {
        Some((top, sub)) if !top.is_empty() && !sub.is_empty() => (top, sub),
        _ => {
            return Err(StorageError::invalid_file_type(
                format!("'{}' is not a valid content type", content_type),
                Some(content_type),
            ))
        }
    };

    if allowed.is_empty() {
        return Ok(());
    }

    let permitted = allowed.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        match pattern.split_once('/') {
            Some((p_top, "*")) => p_top == top,
            Some((p_top, p_sub)) => p_top == top && p_sub == sub,
            None => false,
        }
    });

    if permitted {
        Ok(())
    } else {
        Err(StorageError::invalid_file_type(
            format!("content type '{}' is not allowed", essence),
            Some(content_type),
        ))
    }
}

type SettingsValue = Arc<dyn Any + Send + Sync>;

/// Parsed provider-specific settings plus a redacted rendering for diagnostics.
#[derive(Clone)]
pub struct ParsedSettings {
    value: SettingsValue,
    summary: String,
}

type SchemaFn = Arc<dyn Fn(&Environment) -> Result<ParsedSettings, Vec<FieldViolation>> + Send + Sync>;

/// Backend-specific settings schemas, keyed by backend identifier.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: KeyedRegistry<SchemaFn>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the schema for `identifier`. `parse` should report
    /// every violated field, not just the first.
    pub fn register<T, F>(&self, identifier: impl Into<String>, parse: F)
    where
        T: fmt::Debug + Send + Sync + 'static,
        F: Fn(&Environment) -> Result<T, Vec<FieldViolation>> + Send + Sync + 'static,
    {
        let identifier = identifier.into();
        let schema: SchemaFn = Arc::new(move |env: &Environment| {
            let settings = parse(env)?;
            Ok(ParsedSettings {
                summary: format!("{:?}", settings),
                value: Arc::new(settings),
            })
        });
        if self.schemas.insert(identifier.clone(), schema) {
            debug!("Replaced settings schema for '{}'", identifier);
        }
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.schemas.contains(identifier)
    }

    pub fn list_registered(&self) -> Vec<String> {
        self.schemas.keys()
    }

    pub fn reset(&self) {
        self.schemas.clear();
    }

    fn parse(&self, identifier: &str, env: &Environment) -> Option<Result<ParsedSettings, Vec<FieldViolation>>> {
        self.schemas.get(identifier).map(|schema| schema(env))
    }
}

/// Validated, immutable storage configuration.
#[derive(Clone)]
pub struct StorageConfig {
    pub common: CommonSettings,
    backend_specific: HashMap<String, ParsedSettings>,
}

impl StorageConfig {
    /// Provider-specific settings for `identifier`, if they were validated and
    /// are of type `T`.
    pub fn backend_settings<T: Any>(&self, identifier: &str) -> Option<&T> {
        self.backend_specific
            .get(identifier)
            .and_then(|parsed| parsed.value.downcast_ref::<T>())
    }

    /// Redacted debug rendering of the provider-specific settings
    pub fn backend_summary(&self, identifier: &str) -> Option<&str> {
        self.backend_specific
            .get(identifier)
            .map(|parsed| parsed.summary.as_str())
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut backend: Vec<(&String, &String)> = self
            .backend_specific
            .iter()
            .map(|(id, parsed)| (id, &parsed.summary))
            .collect();
        backend.sort();
        f.debug_struct("StorageConfig")
            .field("common", &self.common)
            .field("backend_specific", &backend)
            .finish()
    }
}

/// Run both validation tiers against `env`.
pub fn validate(env: &Environment, schemas: &SchemaRegistry) -> StorageResult<StorageConfig> {
    let mut fields = FieldReader::new(env);
    let common = CommonSettings::read(&mut fields);
    let mut violations = fields.into_violations();
    let mut backend_specific = HashMap::new();

    match schemas.parse(&common.backend_identifier, env) {
        Some(Ok(parsed)) => {
            backend_specific.insert(common.backend_identifier.clone(), parsed);
        }
        Some(Err(mut backend_violations)) => violations.append(&mut backend_violations),
        None => debug!(
            "No settings schema registered for backend '{}'; assuming it configures itself",
            common.backend_identifier
        ),
    }

    if !violations.is_empty() {
        warn!(
            "Storage configuration rejected with {} violation(s) for backend '{}'",
            violations.len(),
            common.backend_identifier
        );
        return Err(StorageError::ConfigurationInvalid { violations });
    }

    Ok(StorageConfig {
        common,
        backend_specific,
    })
}

/// Read-through cache around [`validate`]. Validation runs at most once until
/// [`ConfigLoader::reset`]; failures are not cached.
pub struct ConfigLoader {
    env: Environment,
    schemas: Arc<SchemaRegistry>,
    cached: Mutex<Option<Arc<StorageConfig>>>,
}

impl ConfigLoader {
    pub fn new(env: Environment, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            env,
            schemas,
            cached: Mutex::new(None),
        }
    }

    fn cached(&self) -> MutexGuard<'_, Option<Arc<StorageConfig>>> {
        self.cached.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn get(&self) -> StorageResult<Arc<StorageConfig>> {
        let mut cached = self.cached();
        if let Some(config) = cached.as_ref() {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(validate(&self.env, &self.schemas)?);
        info!(
            "Resolved storage configuration: backend={}, max_file_size={}, quota={}, signed_url_ttl={}s",
            config.common.backend_identifier,
            config.common.max_file_size_bytes,
            config.common.quota_bytes,
            config.common.signed_url_ttl_seconds
        );
        *cached = Some(Arc::clone(&config));
        Ok(config)
    }

    pub fn is_loaded(&self) -> bool {
        self.cached().is_some()
    }

    /// Common settings together with the typed settings for `identifier`.
    ///
    /// Uses the cached settings when `identifier` is the configured backend;
    /// otherwise runs that backend's schema directly, so a non-default backend
    /// can still be constructed by name.
    pub fn settings_for<T>(&self, identifier: &str) -> StorageResult<(CommonSettings, T)>
    where
        T: Any + Clone,
    {
        let config = self.get()?;
        if let Some(settings) = config.backend_settings::<T>(identifier) {
            return Ok((config.common.clone(), settings.clone()));
        }

        let parsed = match self.schemas.parse(identifier, &self.env) {
            Some(result) => result.map_err(|violations| StorageError::ConfigurationInvalid { violations })?,
            None => {
                return Err(StorageError::ConfigurationInvalid {
                    violations: vec![FieldViolation::new(
                        "backend_identifier",
                        ENV_BACKEND,
                        format!("no settings schema registered for '{}'", identifier),
                    )],
                })
            }
        };

        match parsed.value.downcast_ref::<T>() {
            Some(settings) => Ok((config.common.clone(), settings.clone())),
            None => Err(StorageError::backend(format!(
                "settings registered for '{}' have an unexpected type",
                identifier
            ))),
        }
    }

    pub fn reset(&self) {
        *self.cached() = None;
    }
}
