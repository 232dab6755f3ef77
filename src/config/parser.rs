//! Configuration parser for loading configuration and resource manifests.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, OperatorError, Result};
use crate::resource::{StackResource, DEFAULT_NAMESPACE};
use std::path::Path;
use tracing::{debug, info, warn};

use super::spec::OperatorConfig;

/// Prefix of environment variables overriding configuration values.
pub const ENV_PREFIX: &str = "STACK_OPERATOR_";

/// Configuration parser for loading operator configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<OperatorConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = read_file(path)?;
        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<OperatorConfig> {
        debug!("Parsing YAML configuration");

        // An empty file is a valid, all-defaults configuration
        if content.trim().is_empty() {
            return Ok(OperatorConfig::default());
        }

        let config: OperatorConfig = serde_yaml::from_str(content).map_err(|e| {
            OperatorError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        Ok(config)
    }

    /// Loads a stack resource manifest.
    ///
    /// A manifest without a namespace lands in the default namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_resource_file(&self, path: impl AsRef<Path>) -> Result<StackResource> {
        let path = path.as_ref();
        info!("Loading stack resource from: {}", path.display());

        let content = read_file(path)?;
        let mut resource: StackResource = serde_yaml::from_str(&content).map_err(|e| {
            OperatorError::Config(ConfigError::ParseError {
                message: format!("Invalid stack resource: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        if resource.metadata.name.is_empty() {
            return Err(ConfigError::validation("Resource name cannot be empty", "metadata.name").into());
        }
        if resource.metadata.namespace.is_empty() {
            resource.metadata.namespace = DEFAULT_NAMESPACE.to_string();
        }

        Ok(resource)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables use the `STACK_OPERATOR_<KEY>` format
    /// (e.g., `STACK_OPERATOR_REGION`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<OperatorConfig> {
        let mut config = self.load_file(path)?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                OperatorError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies environment overrides read through `lookup`.
///
/// Unparseable numeric or boolean values are ignored with a warning.
pub fn apply_env_overrides(config: &mut OperatorConfig, lookup: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

    if let Some(region) = var("REGION") {
        debug!("Overriding region from environment");
        config.region = Some(region);
    }

    if let Some(dir) = var("STATE_DIR") {
        debug!("Overriding state_dir from environment");
        config.state_dir = Some(dir.into());
    }

    if let Some(value) = var("DRY_RUN") {
        match value.parse() {
            Ok(dry_run) => config.dry_run = dry_run,
            Err(_) => warn!("Ignoring invalid {ENV_PREFIX}DRY_RUN value: {value}"),
        }
    }

    override_number(&var, "POLL_INTERVAL_SECS", &mut config.poll_interval_secs);
    override_number(&var, "REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs);
    override_number(&var, "RESYNC_INTERVAL_SECS", &mut config.resync_interval_secs);
    override_number(&var, "HUB_CAPACITY", &mut config.hub_capacity);

    if let Some(value) = var("METRICS_ADDR") {
        if value.is_empty() || value == "off" {
            debug!("Metrics endpoint disabled from environment");
            config.metrics_addr = None;
        } else {
            match value.parse() {
                Ok(addr) => config.metrics_addr = Some(addr),
                Err(_) => warn!("Ignoring invalid {ENV_PREFIX}METRICS_ADDR value: {value}"),
            }
        }
    }

    if let Some(capabilities) = var("DEFAULT_CAPABILITIES") {
        config.default_capabilities = capabilities
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
    }
}

fn override_number<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(value) = var(key) {
        match value.parse() {
            Ok(parsed) => {
                debug!("Overriding {} from environment", key.to_lowercase());
                *target = parsed;
            }
            Err(_) => warn!("Ignoring invalid {ENV_PREFIX}{key} value: {value}"),
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(OperatorError::Config(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }));
    }

    std::fs::read_to_string(path).map_err(|e| {
        OperatorError::Config(ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })
    })
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stack-operator.yaml", "stack-operator.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(OperatorError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
