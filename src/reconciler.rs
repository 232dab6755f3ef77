//! Reconciler for stack resources.
//!
//! This module implements the decision loop that compares a resource's
//! desired spec against the existence, ownership and lifecycle state of its
//! remote stack, and takes at most one corrective action per invocation.
//! Long-running remote work is handed to the follower instead of waited on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cloudformation::{
    is_successful_status, with_deadline, CreateStackInput, RemoteStack, StackProvisioner,
    UpdateStackInput, CONTROLLER_KEY, CONTROLLER_VALUE, DEFAULT_REQUEST_TIMEOUT, DELETE_COMPLETE,
    OWNER_KEY,
};
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::hub::Hub;
use crate::resource::{ResourceLocator, ResourceStore, SpecHasher, StackResource, STACKS_FINALIZER};
use crate::status::StatusMerger;

/// Remote status of a stack whose deletion is under way.
const DELETE_IN_PROGRESS: &str = "DELETE_IN_PROGRESS";

/// Action taken by one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The resource no longer exists.
    ResourceGone,
    /// The remote stack is gone and the finalizers were removed.
    Finalized,
    /// The finalizer was added. Work continues on the next pass.
    FinalizerAdded,
    /// The stack has work in progress and was handed to the follower.
    HandedOff,
    /// A create call was issued.
    Created,
    /// An update call was issued.
    Updated,
    /// Nothing to submit. The status was refreshed.
    UpToDate,
    /// A delete call was issued.
    Deleting,
    /// The stack is not owned by this operator and was left in place.
    DeleteSkipped,
    /// A mutation was skipped because dry-run is enabled.
    DryRun,
    /// Nothing to do.
    Idle,
}

impl ReconcileOutcome {
    /// Returns true if a mutating remote call was issued.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleting)
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::ResourceGone => "resource gone",
            Self::Finalized => "finalized",
            Self::FinalizerAdded => "finalizer added",
            Self::HandedOff => "handed off to follower",
            Self::Created => "stack create submitted",
            Self::Updated => "stack update submitted",
            Self::UpToDate => "up to date",
            Self::Deleting => "stack delete submitted",
            Self::DeleteSkipped => "delete skipped, stack not owned",
            Self::DryRun => "dry run",
            Self::Idle => "idle",
        };
        f.write_str(text)
    }
}

/// State shared across the steps of one reconcile pass.
#[derive(Debug, Default)]
struct StackLoop {
    /// Memoized remote lookup. `Some(None)` means the stack does not exist.
    stack: Option<Option<RemoteStack>>,
}

/// Reconciler for stack resources.
pub struct StackReconciler {
    /// Resource store.
    store: Arc<dyn ResourceStore>,
    /// Provisioning API.
    provisioner: Arc<dyn StackProvisioner>,
    /// Handoff queue to the follower.
    hub: Hub,
    /// Status merger.
    merger: StatusMerger,
    /// Spec hasher.
    hasher: SpecHasher,
    /// Tags applied to every stack, below user tags.
    default_tags: BTreeMap<String, String>,
    /// Capabilities acknowledged for every stack.
    default_capabilities: Vec<String>,
    /// Skip every remote mutation.
    dry_run: bool,
    /// Deadline for each remote call.
    request_timeout: Duration,
}

impl StackReconciler {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        provisioner: Arc<dyn StackProvisioner>,
        hub: Hub,
    ) -> Self {
        let merger = StatusMerger::new(Arc::clone(&store), Arc::clone(&provisioner));
        Self {
            store,
            provisioner,
            hub,
            merger,
            hasher: SpecHasher::new(),
            default_tags: BTreeMap::new(),
            default_capabilities: Vec::new(),
            dry_run: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Applies the defaults and dry-run flag from the operator configuration.
    #[must_use]
    pub fn with_config(self, config: &OperatorConfig) -> Self {
        self.with_default_tags(config.default_tags.clone())
            .with_default_capabilities(config.default_capabilities.clone())
            .with_dry_run(config.dry_run)
            .with_request_timeout(config.request_timeout())
    }

    /// Sets the tags applied to every stack.
    #[must_use]
    pub fn with_default_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.default_tags = tags;
        self
    }

    /// Sets the capabilities acknowledged for every stack.
    #[must_use]
    pub fn with_default_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.default_capabilities = capabilities;
        self
    }

    /// Enables or disables dry-run.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the deadline for each remote call.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Reconciles one resource.
    ///
    /// Safe to call repeatedly. A pass with no remote change since the
    /// previous one issues no mutating remote call and no status write.
    ///
    /// # Errors
    ///
    /// Returns an error if a remote call or a store write fails, or if the
    /// resource declares neither or both of template and template URL.
    pub async fn reconcile(&self, locator: &ResourceLocator) -> Result<ReconcileOutcome> {
        let span = info_span!("reconcile", namespace = %locator.namespace, name = %locator.name);
        self.reconcile_resource(locator).instrument(span).await
    }

    async fn reconcile_resource(&self, locator: &ResourceLocator) -> Result<ReconcileOutcome> {
        let mut resource = match self.store.get(locator).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                info!("Stack resource not found, it must have been deleted");
                return Ok(ReconcileOutcome::ResourceGone);
            }
            Err(e) => return Err(e),
        };

        let mut lp = StackLoop::default();

        if resource.is_marked_for_deletion() {
            if !resource.has_stack_finalizer() {
                debug!("Resource is being deleted and has no finalizer");
                return Ok(ReconcileOutcome::Idle);
            }
            return self.finalize(&mut lp, &mut resource).await;
        }

        if resource.add_finalizer(STACKS_FINALIZER) {
            self.store.update(&resource).await?;
            info!("Added finalizer");
            return Ok(ReconcileOutcome::FinalizerAdded);
        }

        let exists = self.stack_exists(&mut lp, &resource).await?;
        let owned = self.has_ownership(&mut lp, &resource).await?;

        if exists
            && owned
            && let Some(stack) = self.get_stack(&mut lp, &resource, false).await?
        {
            if !self.provisioner.stack_in_terminal_state(&stack.stack_status) {
                info!(
                    stack_id = %stack.stack_id,
                    status = %stack.stack_status,
                    "Stack has work in progress, handing off to follower"
                );
                self.hub.submit(&stack.stack_id, &resource);
                return Ok(ReconcileOutcome::HandedOff);
            }
            return self.update_stack(&mut lp, &mut resource).await;
        }

        if exists {
            warn!(stack = %resource.stack_name(), "Stack exists but is not owned by this operator");
        }
        self.create_stack(&mut resource).await
    }

    /// Cleans up a resource marked for deletion.
    async fn finalize(&self, lp: &mut StackLoop, resource: &mut StackResource) -> Result<ReconcileOutcome> {
        // Status may lag behind a create that was just submitted, so only a
        // recorded deletion skips the remote check
        let settled = resource.status.stack_status == DELETE_COMPLETE;

        if settled || !self.stack_exists(lp, resource).await? {
            info!("Stack is gone, removing finalizers");
            return self.remove_finalizers(resource, ReconcileOutcome::Finalized).await;
        }

        self.delete_stack(lp, resource).await
    }

    async fn remove_finalizers(
        &self,
        resource: &mut StackResource,
        outcome: ReconcileOutcome,
    ) -> Result<ReconcileOutcome> {
        resource.remove_stack_finalizers();
        match self.store.update(resource).await {
            Err(e) if e.is_not_found() => Ok(outcome),
            Err(e) => Err(e),
            Ok(()) => Ok(outcome),
        }
    }

    /// Issues a create call and hands the new stack to the follower.
    async fn create_stack(&self, resource: &mut StackResource) -> Result<ReconcileOutcome> {
        let template = resource.spec.template_source(&resource.locator())?;
        let stack_name = resource.stack_name();
        let tags = self.stack_tags(resource);
        let capabilities = self.capabilities(resource);

        if self.dry_run {
            info!(stack = %stack_name, "Dry run, skipping stack create");
            return Ok(ReconcileOutcome::DryRun);
        }

        let hash = self.hasher.hash_spec(&resource.spec, &tags, &capabilities);
        let input = CreateStackInput {
            stack_name: stack_name.clone(),
            template,
            parameters: resource.spec.parameters.clone(),
            tags,
            capabilities,
            role_arn: resource.spec.role_arn.clone(),
            notification_arns: resource.spec.notification_arns.clone(),
            on_failure: resource.spec.on_failure.clone(),
        };

        info!(stack = %stack_name, "Creating stack");
        let stack_id = self
            .bounded("create stack", self.provisioner.create_stack(input))
            .await?;

        resource.status.stack_id.clone_from(&stack_id);
        resource.status.applied_spec_hash = hash;
        self.persist_status(resource).await?;

        info!(stack_id = %stack_id, "Stack create submitted");
        self.hub.submit(&stack_id, resource);
        Ok(ReconcileOutcome::Created)
    }

    /// Issues an update call when the stack inputs changed since the last one.
    async fn update_stack(&self, lp: &mut StackLoop, resource: &mut StackResource) -> Result<ReconcileOutcome> {
        let template = resource.spec.template_source(&resource.locator())?;
        let tags = self.stack_tags(resource);
        let capabilities = self.capabilities(resource);
        let hash = self.hasher.hash_spec(&resource.spec, &tags, &capabilities);

        let Some(stack) = self.get_stack(lp, resource, false).await? else {
            return self.create_stack(resource).await;
        };

        // A rolled back or failed update leaves the previous inputs in place,
        // and tags may have been changed outside the operator
        let recorded = resource.status.applied_spec_hash == hash;
        if recorded && is_successful_status(&stack.stack_status) && stack.tags == tags {
            debug!(hash = %self.hasher.short_hash(&hash), "Stack inputs unchanged, refreshing status");
            self.bounded(
                "update stack status",
                self.merger.update_stack_status(resource, Some(stack)),
            )
            .await?;
            return Ok(ReconcileOutcome::UpToDate);
        }
        if recorded {
            info!(
                stack_id = %stack.stack_id,
                status = %stack.stack_status,
                "Stack does not reflect the applied inputs, re-applying"
            );
        }

        if self.dry_run {
            info!(stack_id = %stack.stack_id, "Dry run, skipping stack update");
            return Ok(ReconcileOutcome::DryRun);
        }

        let input = UpdateStackInput {
            stack_name: stack.stack_id.clone(),
            template,
            parameters: resource.spec.parameters.clone(),
            tags,
            capabilities,
            role_arn: resource.spec.role_arn.clone(),
            notification_arns: resource.spec.notification_arns.clone(),
        };

        info!(stack_id = %stack.stack_id, "Updating stack");
        match self
            .bounded("update stack", self.provisioner.update_stack(input))
            .await
        {
            Ok(()) => {
                resource.status.applied_spec_hash = hash;
                self.persist_status(resource).await?;
                self.hub.submit(&stack.stack_id, resource);
                Ok(ReconcileOutcome::Updated)
            }
            Err(e) if e.is_no_updates() => {
                info!(stack_id = %stack.stack_id, "No updates to perform, refreshing status");
                resource.status.applied_spec_hash = hash;
                let persisted = self
                    .bounded(
                        "update stack status",
                        self.merger.update_stack_status(resource, Some(stack)),
                    )
                    .await?;
                if !persisted {
                    self.persist_status(resource).await?;
                }
                Ok(ReconcileOutcome::UpToDate)
            }
            Err(e) if e.is_stack_not_found() => {
                warn!(stack_id = %stack.stack_id, "Stack disappeared before update, creating it");
                self.create_stack(resource).await
            }
            Err(e) => Err(e),
        }
    }

    /// Issues a delete call for an owned stack.
    async fn delete_stack(&self, lp: &mut StackLoop, resource: &mut StackResource) -> Result<ReconcileOutcome> {
        if self.dry_run {
            info!(stack = %resource.stack_ref(), "Dry run, skipping stack delete");
            return Ok(ReconcileOutcome::DryRun);
        }

        // Ownership is re-read from the remote right before deleting
        let Some(stack) = self.get_stack(lp, resource, true).await? else {
            return self.remove_finalizers(resource, ReconcileOutcome::Finalized).await;
        };

        if !self.has_ownership(lp, resource).await? {
            warn!(stack_id = %stack.stack_id, "Stack is not owned by this operator, leaving it in place");
            return self.remove_finalizers(resource, ReconcileOutcome::DeleteSkipped).await;
        }

        if stack.stack_status == DELETE_IN_PROGRESS {
            debug!(stack_id = %stack.stack_id, "Stack delete already under way");
            self.hub.submit(&stack.stack_id, resource);
            return Ok(ReconcileOutcome::HandedOff);
        }

        info!(stack_id = %stack.stack_id, "Deleting stack");
        self.bounded("delete stack", self.provisioner.delete_stack(&stack.stack_id))
            .await?;
        self.hub.submit(&stack.stack_id, resource);
        Ok(ReconcileOutcome::Deleting)
    }

    /// Gets the remote stack, at most once per pass unless `no_cache` is set.
    async fn get_stack(
        &self,
        lp: &mut StackLoop,
        resource: &StackResource,
        no_cache: bool,
    ) -> Result<Option<RemoteStack>> {
        if !no_cache && let Some(cached) = &lp.stack {
            return Ok(cached.clone());
        }

        let stack = match self
            .bounded("get stack", self.provisioner.get_stack(&resource.stack_ref()))
            .await
        {
            Ok(stack) => Some(stack),
            Err(e) if e.is_stack_not_found() => None,
            Err(e) => return Err(e),
        };

        lp.stack = Some(stack.clone());
        Ok(stack)
    }

    /// A fully deleted stack does not exist.
    async fn stack_exists(&self, lp: &mut StackLoop, resource: &StackResource) -> Result<bool> {
        Ok(self
            .get_stack(lp, resource, false)
            .await?
            .is_some_and(|stack| !stack.is_deleted()))
    }

    /// A stack that does not exist is vacuously owned.
    async fn has_ownership(&self, lp: &mut StackLoop, resource: &StackResource) -> Result<bool> {
        Ok(self
            .get_stack(lp, resource, false)
            .await?
            .is_none_or(|stack| stack.is_controlled()))
    }

    /// Ownership tags, then defaults, then user tags. Later entries win.
    fn stack_tags(&self, resource: &StackResource) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::from([
            (CONTROLLER_KEY.to_string(), CONTROLLER_VALUE.to_string()),
            (OWNER_KEY.to_string(), resource.metadata.uid.clone()),
        ]);
        tags.extend(self.default_tags.clone());
        tags.extend(resource.spec.tags.clone());
        tags
    }

    fn capabilities(&self, resource: &StackResource) -> Vec<String> {
        let mut capabilities: Vec<String> = Vec::new();
        for capability in self.default_capabilities.iter().chain(&resource.spec.capabilities) {
            if !capabilities.contains(capability) {
                capabilities.push(capability.clone());
            }
        }
        capabilities
    }

    /// Bounds a remote call by the request timeout.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        with_deadline(operation, self.request_timeout, call).await
    }

    async fn persist_status(&self, resource: &StackResource) -> Result<()> {
        match self.store.update_status(resource).await {
            Err(e) if e.is_not_found() => {
                debug!("Resource deleted before its status could be written");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudformation::MockStackProvisioner;
    use crate::error::{OperatorError, ProvisionError, ReconcileError};
    use crate::hub::HubReceiver;
    use crate::resource::{LocalResourceStore, StackSpec, TemplateSource, LEGACY_FINALIZER};
    use crate::testing::{
        owned_stack, test_resource, unowned_stack, CallCounts, CountingStore, FakeProvisioner,
        StalledProvisioner, UpdateFailure,
    };
    use chrono::Utc;

    struct Harness {
        store: Arc<CountingStore>,
        provisioner: Arc<FakeProvisioner>,
        receiver: HubReceiver,
        reconciler: StackReconciler,
        _temp: tempfile::TempDir,
    }

    fn harness() -> Harness {
        harness_with(|r| r)
    }

    fn harness_with(configure: impl FnOnce(StackReconciler) -> StackReconciler) -> Harness {
        let (store, temp) = CountingStore::new();
        let provisioner = Arc::new(FakeProvisioner::default());
        let (hub, receiver) = Hub::channel(16);
        let reconciler = configure(StackReconciler::new(store.clone(), provisioner.clone(), hub));
        Harness {
            store,
            provisioner,
            receiver,
            reconciler,
            _temp: temp,
        }
    }

    impl Harness {
        async fn stored(&self, resource: StackResource) -> ResourceLocator {
            let created = self.store.create(resource).await.unwrap();
            let locator = created.locator();
            assert_eq!(
                self.reconciler.reconcile(&locator).await.unwrap(),
                ReconcileOutcome::FinalizerAdded
            );
            locator
        }

        /// Stores a resource and drives it to a completed stack.
        async fn created(&mut self, name: &str) -> ResourceLocator {
            let locator = self.stored(test_resource(name)).await;
            assert_eq!(
                self.reconciler.reconcile(&locator).await.unwrap(),
                ReconcileOutcome::Created
            );
            let stack_id = self.store.get(&locator).await.unwrap().status.stack_id;
            self.provisioner.set_status(&stack_id, "CREATE_COMPLETE");
            while self.receiver.try_recv().is_some() {}
            locator
        }

        async fn mark_for_deletion(&self, locator: &ResourceLocator) {
            let mut resource = self.store.get(locator).await.unwrap();
            resource.metadata.deletion_timestamp = Some(Utc::now());
            self.store.update(&resource).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_an_error() {
        let h = harness();
        let outcome = h
            .reconciler
            .reconcile(&ResourceLocator::new("default", "ghost"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ResourceGone);
        assert_eq!(h.provisioner.calls().get, 0);
    }

    #[tokio::test]
    async fn test_finalizer_added_before_any_remote_call() {
        let h = harness();
        let locator = h.stored(test_resource("web")).await;

        let stored = h.store.get(&locator).await.unwrap();
        assert!(stored.has_finalizer(STACKS_FINALIZER));
        assert_eq!(h.provisioner.calls(), CallCounts::default());
    }

    #[tokio::test]
    async fn test_new_resource_creates_stack_and_hands_off() {
        let mut h = harness();
        let locator = h.stored(test_resource("web")).await;

        let outcome = h.reconciler.reconcile(&locator).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(h.provisioner.calls().create, 1);

        let stored = h.store.get(&locator).await.unwrap();
        assert!(!stored.status.stack_id.is_empty());
        assert!(!stored.status.applied_spec_hash.is_empty());

        let request = h.receiver.try_recv().expect("follow request");
        assert_eq!(request.stack_id, stored.status.stack_id);
        assert_eq!(request.locator, locator);

        let input = &h.provisioner.created()[0];
        assert_eq!(input.stack_name, "default-web");
        assert_eq!(input.template, TemplateSource::Body(String::from("Resources: {}")));
        assert_eq!(input.tags.get(CONTROLLER_KEY).map(String::as_str), Some(CONTROLLER_VALUE));
        assert_eq!(input.tags.get(OWNER_KEY), Some(&stored.metadata.uid));
    }

    #[tokio::test]
    async fn test_tag_and_capability_precedence() {
        let h = harness_with(|r| {
            r.with_default_tags(BTreeMap::from([
                (String::from("team"), String::from("platform")),
                (String::from("env"), String::from("default")),
            ]))
            .with_default_capabilities(vec![String::from("CAPABILITY_IAM")])
        });

        let mut resource = test_resource("web");
        resource.spec.tags.insert(String::from("env"), String::from("prod"));
        resource.spec.capabilities = vec![
            String::from("CAPABILITY_IAM"),
            String::from("CAPABILITY_AUTO_EXPAND"),
        ];
        let locator = h.stored(resource).await;
        h.reconciler.reconcile(&locator).await.unwrap();

        let input = &h.provisioner.created()[0];
        assert_eq!(input.tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(input.tags.get("team").map(String::as_str), Some("platform"));
        assert_eq!(
            input.capabilities,
            vec![String::from("CAPABILITY_IAM"), String::from("CAPABILITY_AUTO_EXPAND")]
        );
    }

    #[tokio::test]
    async fn test_create_requires_exactly_one_template() {
        let h = harness();

        let neither = StackResource::new("default", "neither", StackSpec::default());
        let both = StackResource::new(
            "default",
            "both",
            StackSpec {
                template: Some(String::from("Resources: {}")),
                template_url: Some(String::from("https://templates.example.com/web.yaml")),
                ..StackSpec::default()
            },
        );

        for resource in [neither, both] {
            let locator = h.stored(resource).await;
            let err = h.reconciler.reconcile(&locator).await.unwrap_err();
            assert!(matches!(
                err,
                OperatorError::Reconcile(ReconcileError::MissingTemplateSpec { .. })
            ));
        }
        assert_eq!(h.provisioner.calls().mutations(), 0);
    }

    #[tokio::test]
    async fn test_in_progress_stack_is_handed_off_without_mutation() {
        let mut h = harness();
        let locator = h.stored(test_resource("web")).await;
        h.reconciler.reconcile(&locator).await.unwrap();
        while h.receiver.try_recv().is_some() {}

        let before = h.provisioner.calls();
        let outcome = h.reconciler.reconcile(&locator).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::HandedOff);

        let after = h.provisioner.calls();
        assert_eq!(after.mutations(), before.mutations());
        // Existence, ownership and terminal checks share one lookup
        assert_eq!(after.get, before.get + 1);
        assert!(h.receiver.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let mut h = harness();
        let locator = h.created("web").await;

        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::UpToDate);
        let calls = h.provisioner.calls();
        let writes = h.store.status_writes();
        let updates = h.store.updates();

        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::UpToDate);
        assert_eq!(h.provisioner.calls().mutations(), calls.mutations());
        assert_eq!(h.store.status_writes(), writes);
        assert_eq!(h.store.updates(), updates);
        assert!(h.receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_changed_spec_updates_stack() {
        let mut h = harness();
        let locator = h.created("web").await;

        let mut resource = h.store.get(&locator).await.unwrap();
        resource.spec.parameters.insert(String::from("Env"), String::from("prod"));
        h.store.update(&resource).await.unwrap();

        let outcome = h.reconciler.reconcile(&locator).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);
        assert_eq!(h.provisioner.calls().update, 1);
        assert!(h.receiver.try_recv().is_some());

        let stack_id = h.store.get(&locator).await.unwrap().status.stack_id;
        let stack = h.provisioner.stack(&stack_id).unwrap();
        assert_eq!(stack.stack_status, "UPDATE_IN_PROGRESS");
    }

    #[tokio::test]
    async fn test_no_updates_refreshes_status_without_handoff() {
        let mut h = harness();
        let locator = h.created("web").await;

        let mut resource = h.store.get(&locator).await.unwrap();
        let old_hash = resource.status.applied_spec_hash.clone();
        resource.spec.tags.insert(String::from("cost-center"), String::from("42"));
        h.store.update(&resource).await.unwrap();
        h.provisioner.fail_next_update(UpdateFailure::NoUpdates);

        let outcome = h.reconciler.reconcile(&locator).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::UpToDate);
        assert!(h.receiver.try_recv().is_none());

        let stored = h.store.get(&locator).await.unwrap();
        assert_eq!(stored.status.stack_status, "CREATE_COMPLETE");
        assert_ne!(stored.status.applied_spec_hash, old_hash);
    }

    #[tokio::test]
    async fn test_update_of_vanished_stack_falls_back_to_create() {
        let mut h = harness();
        let locator = h.created("web").await;

        let mut resource = h.store.get(&locator).await.unwrap();
        resource.spec.parameters.insert(String::from("Env"), String::from("prod"));
        h.store.update(&resource).await.unwrap();
        h.provisioner.fail_next_update(UpdateFailure::DoesNotExist);

        let outcome = h.reconciler.reconcile(&locator).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(h.provisioner.calls().create, 2);
    }

    #[tokio::test]
    async fn test_update_failure_propagates() {
        let mut h = harness();
        let locator = h.created("web").await;

        let mut resource = h.store.get(&locator).await.unwrap();
        resource.spec.parameters.insert(String::from("Env"), String::from("prod"));
        h.store.update(&resource).await.unwrap();
        h.provisioner.fail_next_update(UpdateFailure::Api);

        let err = h.reconciler.reconcile(&locator).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(h.receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_deleted_stack_is_finalized_without_delete_call() {
        let mut h = harness();
        let locator = h.created("web").await;
        let stack_id = h.store.get(&locator).await.unwrap().status.stack_id;
        h.provisioner.set_status(&stack_id, DELETE_COMPLETE);

        h.mark_for_deletion(&locator).await;
        let outcome = h.reconciler.reconcile(&locator).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Finalized);
        assert_eq!(h.provisioner.calls().delete, 0);
        assert!(h.store.get(&locator).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_never_created_stack_is_finalized() {
        let h = harness();
        let mut resource = test_resource("web");
        resource.metadata.finalizers = vec![LEGACY_FINALIZER.to_string()];
        let locator = h.store.create(resource).await.unwrap().locator();

        h.mark_for_deletion(&locator).await;
        let outcome = h.reconciler.reconcile(&locator).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Finalized);
        assert_eq!(h.provisioner.calls().mutations(), 0);
        assert!(h.store.get(&locator).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_owned_stack_is_deleted_then_finalized() {
        let mut h = harness();
        let locator = h.created("web").await;
        let stack_id = h.store.get(&locator).await.unwrap().status.stack_id;

        h.mark_for_deletion(&locator).await;
        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::Deleting);
        assert_eq!(h.provisioner.calls().delete, 1);
        assert!(h.receiver.try_recv().is_some());

        // A repeat pass while the delete runs does not resubmit it
        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::HandedOff);
        assert_eq!(h.provisioner.calls().delete, 1);

        h.provisioner.set_status(&stack_id, DELETE_COMPLETE);
        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::Finalized);
        assert!(h.store.get(&locator).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_without_ownership_skips_remote_delete() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalResourceStore::with_base_dir(temp.path()));

        let mut provisioner = MockStackProvisioner::new();
        provisioner
            .expect_get_stack()
            .returning(|_| Ok(unowned_stack("default-web", "CREATE_COMPLETE")));
        provisioner.expect_delete_stack().never();

        let (hub, mut receiver) = Hub::channel(4);
        let reconciler = StackReconciler::new(store.clone(), Arc::new(provisioner), hub);

        let mut resource = test_resource("web");
        resource.metadata.finalizers = vec![STACKS_FINALIZER.to_string()];
        let mut resource = store.create(resource).await.unwrap();
        resource.metadata.deletion_timestamp = Some(Utc::now());
        store.update(&resource).await.unwrap();

        let outcome = reconciler.reconcile(&resource.locator()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DeleteSkipped);
        assert!(receiver.try_recv().is_none());
        assert!(store.get(&resource.locator()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unowned_existing_stack_goes_to_create() {
        let h = harness();
        h.provisioner
            .insert_stack(unowned_stack("default-web", "CREATE_COMPLETE"));
        let locator = h.stored(test_resource("web")).await;

        let outcome = h.reconciler.reconcile(&locator).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(h.provisioner.calls().update, 0);
    }

    #[tokio::test]
    async fn test_owned_terminal_stack_without_applied_hash_is_updated() {
        let h = harness();
        h.provisioner
            .insert_stack(owned_stack("default-web", "UPDATE_ROLLBACK_COMPLETE"));
        let locator = h.stored(test_resource("web")).await;

        let outcome = h.reconciler.reconcile(&locator).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);
        assert_eq!(h.provisioner.calls().create, 0);
    }

    #[tokio::test]
    async fn test_rolled_back_update_is_reapplied() {
        let mut h = harness();
        let locator = h.created("web").await;

        let mut resource = h.store.get(&locator).await.unwrap();
        resource.spec.parameters.insert(String::from("Env"), String::from("prod"));
        h.store.update(&resource).await.unwrap();
        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::Updated);

        // The update failed remotely and the old inputs were restored
        let stack_id = h.store.get(&locator).await.unwrap().status.stack_id;
        h.provisioner.set_status(&stack_id, "UPDATE_ROLLBACK_COMPLETE");

        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::Updated);
        assert_eq!(h.provisioner.calls().update, 2);
        assert_eq!(
            h.provisioner.stack(&stack_id).unwrap().stack_status,
            "UPDATE_IN_PROGRESS"
        );
    }

    #[tokio::test]
    async fn test_tags_changed_outside_the_operator_are_reapplied() {
        let mut h = harness();
        let locator = h.created("web").await;

        let stack_id = h.store.get(&locator).await.unwrap().status.stack_id;
        let mut stack = h.provisioner.stack(&stack_id).unwrap();
        stack.tags.insert(String::from("cost-center"), String::from("unknown"));
        h.provisioner.insert_stack(stack);

        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::Updated);
        let stack = h.provisioner.stack(&stack_id).unwrap();
        assert!(!stack.tags.contains_key("cost-center"));
    }

    #[tokio::test]
    async fn test_stalled_remote_call_is_bounded() {
        let (store, _temp) = CountingStore::new();
        let (hub, _receiver) = Hub::channel(4);
        let reconciler = StackReconciler::new(store.clone(), Arc::new(StalledProvisioner), hub)
            .with_request_timeout(Duration::from_millis(20));

        let locator = store.create(test_resource("web")).await.unwrap().locator();
        assert_eq!(
            reconciler.reconcile(&locator).await.unwrap(),
            ReconcileOutcome::FinalizerAdded
        );

        let err = tokio::time::timeout(Duration::from_secs(5), reconciler.reconcile(&locator))
            .await
            .expect("reconcile must not hang")
            .unwrap_err();
        assert!(matches!(
            err,
            OperatorError::Provision(ProvisionError::Timeout { operation: "get stack", .. })
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_remote_mutations() {
        let mut h = harness_with(|r| r.with_dry_run(true));
        let locator = h.stored(test_resource("web")).await;

        assert_eq!(h.reconciler.reconcile(&locator).await.unwrap(), ReconcileOutcome::DryRun);
        assert_eq!(h.provisioner.calls().mutations(), 0);
        assert!(h.receiver.try_recv().is_none());
        assert_eq!(h.store.status_writes(), 0);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(ReconcileOutcome::HandedOff.to_string(), "handed off to follower");
        assert!(ReconcileOutcome::Deleting.is_mutation());
        assert!(!ReconcileOutcome::UpToDate.is_mutation());
    }
}
