//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::cloudformation::{
    CreateStackInput, RemoteStack, StackProvisioner, UpdateStackInput, CONTROLLER_KEY,
    CONTROLLER_VALUE, DELETE_COMPLETE,
};
use crate::error::{OperatorError, ProvisionError, Result};
use crate::metrics::MetricsSink;
use crate::resource::{
    LocalResourceStore, ResourceLocator, ResourceStore, StackResource, StackResourceSummary,
    StackSpec,
};

/// Builds a resource with an inline template.
pub fn test_resource(name: &str) -> StackResource {
    StackResource::new(
        "default",
        name,
        StackSpec {
            template: Some(String::from("Resources: {}")),
            parameters: BTreeMap::from([(String::from("Env"), String::from("test"))]),
            ..StackSpec::default()
        },
    )
}

/// Builds a remote stack carrying the ownership tag.
pub fn owned_stack(name: &str, status: &str) -> RemoteStack {
    let mut stack = unowned_stack(name, status);
    stack
        .tags
        .insert(CONTROLLER_KEY.to_string(), CONTROLLER_VALUE.to_string());
    stack
}

/// Builds a remote stack without the ownership tag.
pub fn unowned_stack(name: &str, status: &str) -> RemoteStack {
    RemoteStack {
        stack_id: format!("arn:aws:cloudformation:eu-west-1:123456789012:stack/{name}/0"),
        stack_name: name.to_string(),
        stack_status: status.to_string(),
        ..RemoteStack::default()
    }
}

/// Number of calls made to each provisioner operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub get_resources: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl CallCounts {
    /// Calls that change remote state.
    pub const fn mutations(&self) -> usize {
        self.create + self.update + self.delete
    }
}

/// Failure injected into the next update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFailure {
    NoUpdates,
    DoesNotExist,
    Api,
}

#[derive(Debug, Default)]
struct FakeState {
    stacks: HashMap<String, RemoteStack>,
    names: HashMap<String, String>,
    resources: Vec<StackResourceSummary>,
    update_failure: Option<UpdateFailure>,
    failing_gets: usize,
    calls: CallCounts,
    created: Vec<CreateStackInput>,
    next_id: usize,
}

impl FakeState {
    fn resolve(&self, stack: &str) -> Option<String> {
        if self.stacks.contains_key(stack) {
            Some(stack.to_string())
        } else {
            self.names.get(stack).cloned()
        }
    }
}

/// In-memory provisioning API.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    state: Mutex<FakeState>,
}

impl FakeProvisioner {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake provisioner lock poisoned")
    }

    /// Registers a stack, returning it.
    pub fn insert_stack(&self, stack: RemoteStack) -> RemoteStack {
        let mut state = self.state();
        state
            .names
            .insert(stack.stack_name.clone(), stack.stack_id.clone());
        state.stacks.insert(stack.stack_id.clone(), stack.clone());
        stack
    }

    /// Changes the status of a stack.
    pub fn set_status(&self, stack: &str, status: &str) {
        let mut state = self.state();
        if let Some(id) = state.resolve(stack)
            && let Some(remote) = state.stacks.get_mut(&id)
        {
            remote.stack_status = status.to_string();
        }
    }

    /// Forgets a stack entirely.
    pub fn forget_stack(&self, stack: &str) {
        let mut state = self.state();
        if let Some(id) = state.resolve(stack) {
            state.stacks.remove(&id);
            state.names.retain(|_, v| *v != id);
        }
    }

    /// Returns the stack with the given name or identifier.
    pub fn stack(&self, stack: &str) -> Option<RemoteStack> {
        let state = self.state();
        state.resolve(stack).and_then(|id| state.stacks.get(&id).cloned())
    }

    /// Sets the resource list reported for every stack.
    pub fn set_resources(&self, resources: Vec<StackResourceSummary>) {
        self.state().resources = resources;
    }

    /// Makes the next update call fail.
    pub fn fail_next_update(&self, failure: UpdateFailure) {
        self.state().update_failure = Some(failure);
    }

    /// Makes the next `count` get calls fail with a transient error.
    pub fn fail_next_gets(&self, count: usize) {
        self.state().failing_gets = count;
    }

    /// Returns the call counts so far.
    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Returns the inputs of every create call.
    pub fn created(&self) -> Vec<CreateStackInput> {
        self.state().created.clone()
    }
}

#[async_trait]
impl StackProvisioner for FakeProvisioner {
    async fn get_stack(&self, stack: &str) -> Result<RemoteStack> {
        let mut state = self.state();
        state.calls.get += 1;

        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(ProvisionError::network("connection reset").into());
        }

        state
            .resolve(stack)
            .and_then(|id| state.stacks.get(&id).cloned())
            .ok_or_else(|| {
                ProvisionError::StackNotFound {
                    stack: stack.to_string(),
                }
                .into()
            })
    }

    async fn get_stack_resources(&self, _stack_id: &str) -> Result<Vec<StackResourceSummary>> {
        let mut state = self.state();
        state.calls.get_resources += 1;
        Ok(state.resources.clone())
    }

    async fn create_stack(&self, input: CreateStackInput) -> Result<String> {
        let mut state = self.state();
        state.calls.create += 1;
        state.next_id += 1;

        let stack = RemoteStack {
            stack_id: format!(
                "arn:aws:cloudformation:eu-west-1:123456789012:stack/{}/{}",
                input.stack_name, state.next_id
            ),
            stack_name: input.stack_name.clone(),
            stack_status: String::from("CREATE_IN_PROGRESS"),
            tags: input.tags.clone(),
            role_arn: input.role_arn.clone(),
            ..RemoteStack::default()
        };
        let id = stack.stack_id.clone();

        state.names.insert(stack.stack_name.clone(), id.clone());
        state.stacks.insert(id.clone(), stack);
        state.created.push(input);
        Ok(id)
    }

    async fn update_stack(&self, input: UpdateStackInput) -> Result<()> {
        let mut state = self.state();
        state.calls.update += 1;

        match state.update_failure.take() {
            Some(UpdateFailure::NoUpdates) => {
                return Err(ProvisionError::NoUpdates {
                    stack: input.stack_name,
                }
                .into());
            }
            Some(UpdateFailure::DoesNotExist) => {
                return Err(ProvisionError::StackNotFound {
                    stack: input.stack_name,
                }
                .into());
            }
            Some(UpdateFailure::Api) => {
                return Err(ProvisionError::api_error("ValidationError", "Template format error").into());
            }
            None => {}
        }

        let id = state
            .resolve(&input.stack_name)
            .ok_or_else(|| OperatorError::from(ProvisionError::StackNotFound {
                stack: input.stack_name.clone(),
            }))?;
        if let Some(remote) = state.stacks.get_mut(&id) {
            remote.stack_status = String::from("UPDATE_IN_PROGRESS");
            remote.tags = input.tags;
        }
        Ok(())
    }

    async fn delete_stack(&self, stack: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.delete += 1;

        if let Some(id) = state.resolve(stack)
            && let Some(remote) = state.stacks.get_mut(&id)
            && remote.stack_status != DELETE_COMPLETE
        {
            remote.stack_status = String::from("DELETE_IN_PROGRESS");
        }
        Ok(())
    }
}

/// Provisioning API whose calls never complete.
#[derive(Debug, Default)]
pub struct StalledProvisioner;

#[async_trait]
impl StackProvisioner for StalledProvisioner {
    async fn get_stack(&self, _stack: &str) -> Result<RemoteStack> {
        std::future::pending().await
    }

    async fn get_stack_resources(&self, _stack_id: &str) -> Result<Vec<StackResourceSummary>> {
        std::future::pending().await
    }

    async fn create_stack(&self, _input: CreateStackInput) -> Result<String> {
        std::future::pending().await
    }

    async fn update_stack(&self, _input: UpdateStackInput) -> Result<()> {
        std::future::pending().await
    }

    async fn delete_stack(&self, _stack: &str) -> Result<()> {
        std::future::pending().await
    }
}

/// Resource store that counts writes.
pub struct CountingStore {
    inner: LocalResourceStore,
    updates: AtomicUsize,
    status_writes: AtomicUsize,
}

impl CountingStore {
    /// Creates a store in a fresh temporary directory.
    pub fn new() -> (Arc<Self>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Self {
            inner: LocalResourceStore::with_base_dir(temp_dir.path()),
            updates: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
        };
        (Arc::new(store), temp_dir)
    }

    /// Number of metadata/spec updates.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of status writes.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for CountingStore {
    async fn get(&self, locator: &ResourceLocator) -> Result<StackResource> {
        self.inner.get(locator).await
    }

    async fn list(&self) -> Result<Vec<ResourceLocator>> {
        self.inner.list().await
    }

    async fn create(&self, resource: StackResource) -> Result<StackResource> {
        self.inner.create(resource).await
    }

    async fn update(&self, resource: &StackResource) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(resource).await
    }

    async fn update_status(&self, resource: &StackResource) -> Result<()> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update_status(resource).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceLocator> {
        self.inner.subscribe()
    }

    fn backend_type(&self) -> &'static str {
        "counting"
    }
}

/// Metrics sink that records values.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    values: Mutex<HashMap<String, i64>>,
}

impl RecordingMetrics {
    /// Current value of a metric.
    pub fn value(&self, name: &str) -> i64 {
        self.values
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .copied()
            .unwrap_or_default()
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment(&self, name: &str) {
        *self
            .values
            .lock()
            .expect("metrics lock poisoned")
            .entry(name.to_string())
            .or_default() += 1;
    }

    fn decrement(&self, name: &str) {
        *self
            .values
            .lock()
            .expect("metrics lock poisoned")
            .entry(name.to_string())
            .or_default() -= 1;
    }

    fn set(&self, name: &str, value: i64) {
        self.values
            .lock()
            .expect("metrics lock poisoned")
            .insert(name.to_string(), value);
    }
}
