//! Stack resource types.
//!
//! A [`StackResource`] carries the user-declared desired state of a stack and
//! the status observed by the operator. Only the operator writes the status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ConfigError, ReconcileError};

/// Current finalizer name.
pub const STACKS_FINALIZER: &str = "stacks.halldyll.io/finalizer";

/// Finalizer name written by earlier releases.
pub const LEGACY_FINALIZER: &str = "finalizer.stacks.halldyll.io";

/// Namespace used when a manifest does not specify one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace-qualified name of a stack resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceLocator {
    /// Namespace.
    pub namespace: String,
    /// Name within the namespace.
    pub name: String,
}

impl ResourceLocator {
    /// Creates a new locator.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses `<namespace>/<name>`, or a bare `<name>` in the default namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is empty or there are extra separators.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidLocator {
            value: value.to_string(),
        };

        let (namespace, name) = match value.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (DEFAULT_NAMESPACE, value),
        };

        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }

        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity and lifecycle metadata of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name.
    pub name: String,
    /// Resource namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Immutable unique identifier, assigned by the store on creation.
    #[serde(default)]
    pub uid: String,
    /// Incremented by the store whenever the spec changes.
    #[serde(default)]
    pub generation: u64,
    /// When the resource was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Finalizers blocking removal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Desired state of a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// Remote stack name override. Defaults to `<namespace>-<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    /// Inline template body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Template location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_url: Option<String>,
    /// Template parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Tags applied to the stack.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Capabilities acknowledged for this stack.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Service role assumed by the provisioning API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    /// Notification targets for stack events.
    #[serde(default)]
    pub notification_arns: Vec<String>,
    /// Action taken when creation fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
}

/// Template source of a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Inline template body.
    Body(String),
    /// Template URL.
    Url(String),
}

/// Summary of one resource inside a remote stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackResourceSummary {
    /// Logical identifier in the template.
    pub logical_id: String,
    /// Physical identifier, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Resource type.
    pub resource_type: String,
    /// Resource status.
    pub status: String,
    /// Reason attached to the last status change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

/// Observed state of a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackStatus {
    /// Remote stack identifier. Empty until the first create.
    pub stack_id: String,
    /// Remote lifecycle status.
    pub stack_status: String,
    /// When the remote stack was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
    /// When the remote stack was last updated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_time: Option<DateTime<Utc>>,
    /// Stack outputs.
    pub outputs: BTreeMap<String, String>,
    /// Role ARN applied to the remote stack.
    pub role_arn: String,
    /// Resources inside the remote stack.
    pub resources: Vec<StackResourceSummary>,
    /// Hash of the inputs last submitted to the provisioning API.
    pub applied_spec_hash: String,
}

/// A declared stack with its observed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackResource {
    /// Identity and lifecycle metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: StackSpec,
    /// Observed state.
    #[serde(default)]
    pub status: StackStatus,
}

impl StackSpec {
    /// Returns the template source, requiring exactly one of template and URL.
    ///
    /// Empty strings count as unset.
    ///
    /// # Errors
    ///
    /// Returns `MissingTemplateSpec` when neither or both are set.
    pub fn template_source(&self, resource: &ResourceLocator) -> Result<TemplateSource, ReconcileError> {
        let body = self.template.as_deref().filter(|t| !t.is_empty());
        let url = self.template_url.as_deref().filter(|u| !u.is_empty());

        match (body, url) {
            (Some(body), None) => Ok(TemplateSource::Body(body.to_string())),
            (None, Some(url)) => Ok(TemplateSource::Url(url.to_string())),
            _ => Err(ReconcileError::MissingTemplateSpec {
                resource: resource.to_string(),
            }),
        }
    }
}

impl StackResource {
    /// Creates a resource with the given identity and spec.
    #[must_use]
    pub fn new(namespace: &str, name: &str, spec: StackSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid: String::new(),
                generation: 0,
                creation_timestamp: None,
                deletion_timestamp: None,
                finalizers: Vec::new(),
            },
            spec,
            status: StackStatus::default(),
        }
    }

    /// Returns the locator of this resource.
    #[must_use]
    pub fn locator(&self) -> ResourceLocator {
        ResourceLocator::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Returns true if deletion was requested.
    #[must_use]
    pub const fn is_marked_for_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the given finalizer is present.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if either the current or the legacy finalizer is present.
    #[must_use]
    pub fn has_stack_finalizer(&self) -> bool {
        self.has_finalizer(STACKS_FINALIZER) || self.has_finalizer(LEGACY_FINALIZER)
    }

    /// Adds a finalizer. Returns false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes both the current and the legacy finalizer.
    pub fn remove_stack_finalizers(&mut self) {
        self.metadata
            .finalizers
            .retain(|f| f != STACKS_FINALIZER && f != LEGACY_FINALIZER);
    }

    /// Returns the remote stack name used for creation.
    #[must_use]
    pub fn stack_name(&self) -> String {
        match self.spec.stack_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}-{}", self.metadata.namespace, self.metadata.name),
        }
    }

    /// Returns the identifier to address the remote stack with.
    ///
    /// The stack ID is preferred so that deleted stacks stay resolvable.
    #[must_use]
    pub fn stack_ref(&self) -> String {
        if self.status.stack_id.is_empty() {
            self.stack_name()
        } else {
            self.status.stack_id.clone()
        }
    }
}
