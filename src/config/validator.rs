//! Validation of operator configuration and stack resources.
//!
//! Problems are collected rather than reported one at a time, so a single
//! `validate` run shows everything that needs fixing.

use crate::cloudformation::{CONTROLLER_KEY, OWNER_KEY};
use crate::error::{ConfigError, OperatorError, Result};
use crate::resource::StackResource;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::spec::OperatorConfig;

/// Capabilities the provisioning API accepts.
const KNOWN_CAPABILITIES: &[&str] = &[
    "CAPABILITY_IAM",
    "CAPABILITY_NAMED_IAM",
    "CAPABILITY_AUTO_EXPAND",
];

/// On-failure policies the provisioning API accepts.
const KNOWN_ON_FAILURE: &[&str] = &["DO_NOTHING", "ROLLBACK", "DELETE"];

/// Validator for operator configurations and stack resources.
#[derive(Debug)]
pub struct ConfigValidator {
    /// Known capabilities.
    known_capabilities: HashSet<String>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// Creates a new validator with the default known capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self {
            known_capabilities: KNOWN_CAPABILITIES.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Validates an operator configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, config: &OperatorConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        for (field, value) in [
            ("poll_interval_secs", config.poll_interval_secs),
            ("request_timeout_secs", config.request_timeout_secs),
            ("resync_interval_secs", config.resync_interval_secs),
        ] {
            if value == 0 {
                result.error(field, "Interval must be greater than zero");
            }
        }

        if config.hub_capacity == 0 {
            result.error("hub_capacity", "Follow queue capacity must be greater than zero");
        }

        if config.request_timeout_secs > 0
            && config.poll_interval_secs > 0
            && config.request_timeout_secs < config.poll_interval_secs
        {
            result.warnings.push(String::from(
                "request_timeout_secs is shorter than poll_interval_secs",
            ));
        }

        self.validate_capabilities("default_capabilities", &config.default_capabilities, &mut result);
        Self::validate_tags("default_tags", &config.default_tags, &mut result);

        if config.dry_run {
            result
                .warnings
                .push(String::from("dry_run is enabled, no stack will be changed"));
        }

        result.into_result()
    }

    /// Validates a stack resource before it is stored.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate_resource(&self, resource: &StackResource) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();
        let spec = &resource.spec;

        if let Err(e) = spec.template_source(&resource.locator()) {
            result.error("spec.template", &e.to_string());
        }

        self.validate_capabilities("spec.capabilities", &spec.capabilities, &mut result);
        Self::validate_tags("spec.tags", &spec.tags, &mut result);

        if spec.parameters.keys().any(String::is_empty) {
            result.error("spec.parameters", "Parameter names cannot be empty");
        }

        if let Some(policy) = spec.on_failure.as_deref()
            && !KNOWN_ON_FAILURE.contains(&policy)
        {
            result.error(
                "spec.onFailure",
                &format!("Unknown on-failure policy '{policy}', expected one of {KNOWN_ON_FAILURE:?}"),
            );
        }

        result.into_result()
    }

    fn validate_capabilities(
        &self,
        field: &str,
        capabilities: &[String],
        result: &mut ValidationResult,
    ) {
        for capability in capabilities {
            if !self.known_capabilities.contains(capability) {
                result.error(field, &format!("Unknown capability '{capability}'"));
            }
        }
    }

    fn validate_tags(field: &str, tags: &BTreeMap<String, String>, result: &mut ValidationResult) {
        if tags.keys().any(|k| k.trim().is_empty()) {
            result.error(field, "Tag keys cannot be empty");
        }

        for reserved in [CONTROLLER_KEY, OWNER_KEY] {
            if tags.contains_key(reserved) {
                result.warnings.push(format!(
                    "{field} sets reserved tag '{reserved}', which controls stack ownership"
                ));
            }
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: &str) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    fn into_result(self) -> Result<Self> {
        match self.errors.first() {
            None => {
                debug!("Validation passed with {} warnings", self.warnings.len());
                Ok(self)
            }
            Some(first) => Err(OperatorError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            })),
        }
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
