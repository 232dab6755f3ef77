//! Types exchanged with the provisioning API.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::resource::TemplateSource;

/// Tag key marking stacks managed by this operator.
pub const CONTROLLER_KEY: &str = "halldyll.io/controlled-by";

/// Tag value marking stacks managed by this operator.
pub const CONTROLLER_VALUE: &str = "halldyll-stack-operator";

/// Tag key carrying the UID of the owning resource.
pub const OWNER_KEY: &str = "halldyll.io/owned-by";

/// Status of a fully deleted stack.
pub const DELETE_COMPLETE: &str = "DELETE_COMPLETE";

/// Statuses from which a stack makes no further transition on its own.
pub const TERMINAL_STATUSES: &[&str] = &[
    "CREATE_COMPLETE",
    "CREATE_FAILED",
    DELETE_COMPLETE,
    "DELETE_FAILED",
    "ROLLBACK_COMPLETE",
    "ROLLBACK_FAILED",
    "UPDATE_COMPLETE",
    "UPDATE_FAILED",
    "UPDATE_ROLLBACK_COMPLETE",
    "UPDATE_ROLLBACK_FAILED",
    "IMPORT_COMPLETE",
    "IMPORT_ROLLBACK_COMPLETE",
    "IMPORT_ROLLBACK_FAILED",
];

/// Returns true if the status is terminal.
#[must_use]
pub fn is_terminal_status(status: &str) -> bool {
    TERMINAL_STATUSES.contains(&status)
}

/// Statuses of a stack whose last submitted inputs were applied.
pub const SUCCESSFUL_STATUSES: &[&str] = &["CREATE_COMPLETE", "UPDATE_COMPLETE", "IMPORT_COMPLETE"];

/// Returns true if the stack settled with its last submitted inputs applied.
///
/// Rolled back and failed operations leave the previous inputs in place.
#[must_use]
pub fn is_successful_status(status: &str) -> bool {
    SUCCESSFUL_STATUSES.contains(&status)
}

/// A stack as reported by the provisioning API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStack {
    /// Stack identifier.
    pub stack_id: String,
    /// Stack name.
    pub stack_name: String,
    /// Lifecycle status.
    pub stack_status: String,
    /// Creation time.
    pub creation_time: Option<DateTime<Utc>>,
    /// Last update time.
    pub last_updated_time: Option<DateTime<Utc>>,
    /// Outputs.
    pub outputs: BTreeMap<String, String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
    /// Service role.
    pub role_arn: Option<String>,
}

impl RemoteStack {
    /// Returns true if the stack is fully deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.stack_status == DELETE_COMPLETE
    }

    /// Returns true if the stack carries the ownership tag.
    #[must_use]
    pub fn is_controlled(&self) -> bool {
        self.tags.get(CONTROLLER_KEY).map(String::as_str) == Some(CONTROLLER_VALUE)
    }
}

/// Input of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStackInput {
    /// Stack name.
    pub stack_name: String,
    /// Template source.
    pub template: TemplateSource,
    /// Parameters.
    pub parameters: BTreeMap<String, String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
    /// Acknowledged capabilities.
    pub capabilities: Vec<String>,
    /// Service role.
    pub role_arn: Option<String>,
    /// Notification targets.
    pub notification_arns: Vec<String>,
    /// On-failure policy.
    pub on_failure: Option<String>,
}

/// Input of an update call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStackInput {
    /// Stack name or identifier.
    pub stack_name: String,
    /// Template source.
    pub template: TemplateSource,
    /// Parameters.
    pub parameters: BTreeMap<String, String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
    /// Acknowledged capabilities.
    pub capabilities: Vec<String>,
    /// Service role.
    pub role_arn: Option<String>,
    /// Notification targets.
    pub notification_arns: Vec<String>,
}
