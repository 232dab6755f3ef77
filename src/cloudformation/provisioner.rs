//! Provisioning API abstraction.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{OperatorError, ProvisionError, Result};
use crate::resource::StackResourceSummary;

use super::types::{is_terminal_status, CreateStackInput, RemoteStack, UpdateStackInput};

/// Operations the operator needs from the remote provisioning API.
///
/// Implementations report a missing stack as `ProvisionError::StackNotFound`
/// and an update with nothing to change as `ProvisionError::NoUpdates`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StackProvisioner: Send + Sync {
    /// Describes a stack by name or identifier.
    async fn get_stack(&self, stack: &str) -> Result<RemoteStack>;

    /// Lists the resources of a stack.
    async fn get_stack_resources(&self, stack_id: &str) -> Result<Vec<StackResourceSummary>>;

    /// Creates a stack and returns its identifier.
    async fn create_stack(&self, input: CreateStackInput) -> Result<String>;

    /// Submits an update to a stack.
    async fn update_stack(&self, input: UpdateStackInput) -> Result<()>;

    /// Deletes a stack by name or identifier.
    async fn delete_stack(&self, stack: &str) -> Result<()>;

    /// Returns true if the status is terminal.
    fn stack_in_terminal_state(&self, status: &str) -> bool {
        is_terminal_status(status)
    }
}

/// Default deadline for one provisioning or store call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds a call by a deadline.
///
/// # Errors
///
/// Returns `ProvisionError::Timeout` if the deadline passes first, otherwise
/// whatever the call returns.
pub async fn with_deadline<T>(
    operation: &'static str,
    deadline: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, call).await.map_err(|_| {
        OperatorError::from(ProvisionError::Timeout {
            operation,
            secs: deadline.as_secs(),
        })
    })?
}
