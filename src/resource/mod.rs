//! Stack resource module.
//!
//! This module provides the declared stack resource model, spec hashing for
//! change detection, and the persistence layer resources are stored in.

mod hash;
mod local;
mod store;
mod types;

pub use hash::SpecHasher;
pub use local::{LocalResourceStore, StoreWatcher};
pub use store::ResourceStore;
pub use types::{
    ObjectMeta, ResourceLocator, StackResource, StackResourceSummary, StackSpec, StackStatus,
    TemplateSource, DEFAULT_NAMESPACE, LEGACY_FINALIZER, STACKS_FINALIZER,
};
