//! Remote provisioning API.
//!
//! This module provides the [`StackProvisioner`] abstraction the operator
//! drives and its AWS `CloudFormation` implementation.

mod client;
mod provisioner;
mod types;

pub use client::CloudFormationProvisioner;
#[cfg(test)]
pub use provisioner::MockStackProvisioner;
pub use provisioner::{with_deadline, StackProvisioner, DEFAULT_REQUEST_TIMEOUT};
pub use types::{
    is_successful_status, is_terminal_status, CreateStackInput, RemoteStack, UpdateStackInput,
    CONTROLLER_KEY, CONTROLLER_VALUE, DELETE_COMPLETE, OWNER_KEY, SUCCESSFUL_STATUSES,
    TERMINAL_STATUSES,
};
