//! Configuration management for Warden.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use tracing::info;

use crate::context::ContextConfig;
use crate::error::{Result, WardenError};
use crate::limits::{Limit, LimitKind, LimitRegistry};

/// Prefix of the environment variables overriding the configuration, e.g.
/// `WARDEN__BUCKETS__TICK_INTERVAL_MS=5`.
const ENV_PREFIX: &str = "WARDEN";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Warden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Token bucket configuration
    #[serde(default)]
    pub buckets: BucketsConfig,

    /// Limits registered at startup in addition to the built-in ones
    #[serde(default)]
    pub limits: Vec<LimitDeclaration>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Token bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketsConfig {
    /// Period at which the shared ticker ticks each bucket, in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for BucketsConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    1
}

/// A limit name and its semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDeclaration {
    pub name: String,
    pub kind: LimitKind,
    #[serde(default)]
    pub minimum: i64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Emit JSON lines instead of human readable logs
    #[serde(default)]
    pub json: bool,

    /// Default level, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WardenConfig {
    /// Load the configuration from an optional YAML file, then from the
    /// `WARDEN__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(
            path,
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        )
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config: WardenConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.buckets.tick_interval_ms == 0 {
            return Err(WardenError::Config(
                "buckets.tick_interval_ms should be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.buckets.tick_interval_ms)
    }

    /// Build a registry holding the built-in limits and the declared ones.
    ///
    /// Panics if a declaration conflicts with a built-in limit or with
    /// another declaration.
    pub fn registry(&self) -> LimitRegistry {
        let registry = LimitRegistry::new();
        for decl in &self.limits {
            registry.register_limit(&decl.name, decl.kind, decl.minimum);
        }
        registry
    }

    /// Configuration of a root context using the configured tick interval.
    pub fn context_config(&self, limits: Vec<Limit>) -> ContextConfig<'static> {
        ContextConfig {
            limits,
            tick_interval: self.tick_interval(),
            ..Default::default()
        }
    }
}
