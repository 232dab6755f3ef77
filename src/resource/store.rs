//! Resource store trait definition.
//!
//! This module defines the persistence interface the reconciler and the
//! follower read and write stack resources through.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;
use super::types::{ResourceLocator, StackResource};

/// Trait for stack resource storage backends.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Gets a resource.
    ///
    /// Returns a `NotFound` store error if it does not exist.
    async fn get(&self, locator: &ResourceLocator) -> Result<StackResource>;

    /// Lists the locators of all stored resources.
    async fn list(&self) -> Result<Vec<ResourceLocator>>;

    /// Creates a resource, assigning its UID and creation timestamp.
    async fn create(&self, resource: StackResource) -> Result<StackResource>;

    /// Updates metadata and spec, leaving the stored status untouched.
    ///
    /// A resource marked for deletion with no finalizers left is removed.
    async fn update(&self, resource: &StackResource) -> Result<()>;

    /// Updates only the status subrecord.
    async fn update_status(&self, resource: &StackResource) -> Result<()>;

    /// Subscribes to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ResourceLocator>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl<T: ResourceStore + ?Sized> ResourceStore for Arc<T> {
    async fn get(&self, locator: &ResourceLocator) -> Result<StackResource> {
        (**self).get(locator).await
    }

    async fn list(&self) -> Result<Vec<ResourceLocator>> {
        (**self).list().await
    }

    async fn create(&self, resource: StackResource) -> Result<StackResource> {
        (**self).create(resource).await
    }

    async fn update(&self, resource: &StackResource) -> Result<()> {
        (**self).update(resource).await
    }

    async fn update_status(&self, resource: &StackResource) -> Result<()> {
        (**self).update_status(resource).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceLocator> {
        (**self).subscribe()
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
