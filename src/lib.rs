// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![warn(warnings)]                    // All warnings are reported
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items should be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests lean on unwrap and panics for brevity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Stack Operator
//!
//! Declarative, idempotent reconciliation of `CloudFormation` stacks.
//!
//! ## Overview
//!
//! Each stack resource declares the stack it wants: a template (inline or by
//! URL), parameters, tags and capabilities. The operator:
//!
//! - Creates, updates and deletes the remote stack to match the declaration
//! - Never blocks on long-running stack operations
//! - Follows in-progress stacks in the background until they settle
//! - Mirrors the remote status, outputs and resources back onto the resource
//!
//! ## Architecture
//!
//! 1. **Controller**: queues reconcile requests from store changes, resyncs and retries
//! 2. **Reconciler**: one non-blocking pass per resource, handing in-progress stacks off
//! 3. **Hub**: unbounded-in-effect handoff channel from the reconciler to the follower
//! 4. **Follower**: polls followed stacks and drops them once terminal
//! 5. **Status merger**: the single writer of observed stack status
//!
//! ## Modules
//!
//! - [`resource`]: Stack resource model and storage
//! - [`cloudformation`]: Provisioning client
//! - [`reconciler`]: Reconcile pass
//! - [`controller`]: Work queue and run loop
//! - [`hub`]: Follow handoff channel
//! - [`follower`]: Background progress tracking
//! - [`status`]: Status merging
//! - [`config`]: Operator configuration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! metadata:
//!   name: web
//!   namespace: prod
//! spec:
//!   templateUrl: https://example-bucket.s3.amazonaws.com/web.yaml
//!   parameters:
//!     InstanceType: t3.small
//!   capabilities:
//!     - CAPABILITY_IAM
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod cloudformation;
pub mod config;
pub mod controller;
pub mod error;
pub mod follower;
pub mod hub;
pub mod metrics;
pub mod reconciler;
pub mod resource;
pub mod status;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use cloudformation::{CloudFormationProvisioner, RemoteStack, StackProvisioner};
pub use config::{ConfigParser, ConfigValidator, OperatorConfig};
pub use controller::{Controller, WorkQueue};
pub use error::{OperatorError, Result};
pub use follower::{Follower, FollowRegistry};
pub use hub::{FollowRequest, Hub, HubReceiver};
pub use metrics::{MetricsSink, PrometheusMetrics};
pub use reconciler::{ReconcileOutcome, StackReconciler};
pub use resource::{LocalResourceStore, ResourceLocator, ResourceStore, StackResource, StackSpec};
pub use status::StatusMerger;
