//! Configuration module for the stack operator.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stack-operator.yaml` and stack manifests
//! - Environment variable overrides
//! - Validation of configuration values and stack resources

mod spec;
mod parser;
mod validator;

pub use spec::OperatorConfig;
pub use parser::{apply_env_overrides, find_config_file, ConfigParser, ENV_PREFIX};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
