//! Status merging.
//!
//! Folds freshly observed remote state into a resource's stored status and
//! persists it only when something actually changed. Skipping no-op writes
//! keeps status updates from re-triggering reconciliation.

use std::sync::Arc;
use tracing::{debug, error, info};

use crate::cloudformation::{RemoteStack, StackProvisioner};
use crate::error::Result;
use crate::resource::{ResourceStore, StackResource, StackResourceSummary, StackStatus};

/// Merges remote stack state into stored resource status.
#[derive(Clone)]
pub struct StatusMerger {
    /// Resource store.
    store: Arc<dyn ResourceStore>,
    /// Provisioning API.
    provisioner: Arc<dyn StackProvisioner>,
}

impl StatusMerger {
    /// Creates a new status merger.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, provisioner: Arc<dyn StackProvisioner>) -> Self {
        Self { store, provisioner }
    }

    /// Refreshes the status of a resource from the remote stack.
    ///
    /// The stack is fetched when `stack` is `None`. Returns true if the status
    /// was persisted. A resource deleted concurrently is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote lookup or the status write fails.
    pub async fn update_stack_status(
        &self,
        resource: &mut StackResource,
        stack: Option<RemoteStack>,
    ) -> Result<bool> {
        let locator = resource.locator();

        let stack = match stack {
            Some(stack) => stack,
            None => self.provisioner.get_stack(&resource.stack_ref()).await.map_err(|e| {
                error!(resource = %locator, "Failed to get stack: {e}");
                e
            })?,
        };

        let resources = self
            .provisioner
            .get_stack_resources(&stack.stack_id)
            .await
            .map_err(|e| {
                error!(resource = %locator, stack_id = %stack.stack_id, "Failed to get stack resources: {e}");
                e
            })?;

        if !merge_status(&mut resource.status, &stack, resources) {
            debug!(resource = %locator, "Stack status unchanged");
            return Ok(false);
        }

        match self.store.update_status(resource).await {
            Ok(()) => {
                info!(
                    resource = %locator,
                    stack_id = %resource.status.stack_id,
                    status = %resource.status.stack_status,
                    "Updated stack status"
                );
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(resource = %locator, "Resource deleted before its status could be updated");
                Ok(false)
            }
            Err(e) => {
                error!(resource = %locator, "Failed to update stack status: {e}");
                Err(e)
            }
        }
    }
}

/// Merges a remote stack into a status. Returns true if any field changed.
///
/// Timestamps follow the lifecycle status and are only refreshed when it
/// changes. Outputs are only replaced by a non-empty map.
pub fn merge_status(
    status: &mut StackStatus,
    stack: &RemoteStack,
    resources: Vec<StackResourceSummary>,
) -> bool {
    let mut changed = false;

    if stack.stack_status != status.stack_status {
        changed = true;
        status.stack_status.clone_from(&stack.stack_status);
        status.created_time = stack.creation_time;
        if stack.last_updated_time.is_some() {
            status.updated_time = stack.last_updated_time;
        }
    }

    if !stack.stack_id.is_empty() && stack.stack_id != status.stack_id {
        changed = true;
        status.stack_id.clone_from(&stack.stack_id);
    }

    if !stack.outputs.is_empty() && stack.outputs != status.outputs {
        changed = true;
        status.outputs.clone_from(&stack.outputs);
    }

    let role_arn = stack.role_arn.as_deref().unwrap_or_default();
    if role_arn != status.role_arn {
        changed = true;
        status.role_arn = role_arn.to_string();
    }

    if resources != status.resources {
        changed = true;
        status.resources = resources;
    }

    changed
}
