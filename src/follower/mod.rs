//! Stack follower.
//!
//! The follower watches stacks that have asynchronous work outstanding. A
//! receiver admits follow requests from the [`Hub`](crate::hub::Hub) into a
//! registry, and a poll worker re-checks every registered stack on a fixed
//! interval, merging its state into the owning resource until the stack
//! reaches a terminal state or disappears.

mod registry;

pub use registry::FollowRegistry;
pub use crate::cloudformation::DEFAULT_REQUEST_TIMEOUT;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cloudformation::{with_deadline, StackProvisioner};
use crate::error::Result;
use crate::hub::{FollowRequest, HubReceiver};
use crate::metrics::{MetricsSink, STACKS_FOLLOWED_TOTAL, STACKS_FOLLOWING};
use crate::resource::{ResourceLocator, ResourceStore};
use crate::status::StatusMerger;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why an entry stopped being followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The owning resource no longer exists.
    ResourceGone,
    /// The remote stack no longer exists.
    StackGone,
    /// The remote stack reached a terminal state.
    Terminal,
}

/// Result of processing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Stopped(StopReason),
    InProgress,
}

/// Summary of one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Entries processed.
    pub processed: usize,
    /// Entries no longer followed after this tick.
    pub stopped: usize,
    /// Entries that failed and stay registered.
    pub failed: usize,
}

/// Follows stacks until they reach a terminal state.
pub struct Follower {
    /// Stacks under observation.
    registry: FollowRegistry,
    /// Resource store.
    store: Arc<dyn ResourceStore>,
    /// Provisioning API.
    provisioner: Arc<dyn StackProvisioner>,
    /// Status merger.
    merger: StatusMerger,
    /// Metrics sink.
    metrics: Arc<dyn MetricsSink>,
    /// Interval between poll ticks.
    poll_interval: Duration,
    /// Deadline for each call made while polling.
    request_timeout: Duration,
}

impl Follower {
    /// Creates a new follower.
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        provisioner: Arc<dyn StackProvisioner>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let merger = StatusMerger::new(Arc::clone(&store), Arc::clone(&provisioner));
        Self {
            registry: FollowRegistry::new(),
            store,
            provisioner,
            merger,
            metrics,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the poll interval. Zero is raised to one millisecond.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Sets the deadline for each call made while polling.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns true if the stack is being followed.
    #[must_use]
    pub fn being_followed(&self, stack_id: &str) -> bool {
        let followed = self.registry.contains(stack_id);
        debug!(stack_id, followed, "Checked follow state");
        followed
    }

    /// Number of stacks being followed.
    #[must_use]
    pub fn following_count(&self) -> usize {
        self.registry.len()
    }

    /// Admits a follow request. Returns true if the stack was newly registered.
    pub fn admit(&self, request: FollowRequest) -> bool {
        info!(
            uid = %request.uid,
            stack_id = %request.stack_id,
            resource = %request.locator,
            "Received follow request"
        );

        if request.stack_id.is_empty() {
            warn!(resource = %request.locator, "Follow request without a stack ID, ignoring");
            return false;
        }

        if !self
            .registry
            .insert_if_absent(&request.stack_id, request.locator)
        {
            debug!(stack_id = %request.stack_id, "Stack already followed");
            return false;
        }

        self.metrics.increment(STACKS_FOLLOWED_TOTAL);
        self.metrics.increment(STACKS_FOLLOWING);
        info!(stack_id = %request.stack_id, "Now following stack");
        true
    }

    /// Stops following a stack.
    fn stop_following(&self, stack_id: &str) {
        if self.registry.remove(stack_id).is_some() {
            self.metrics.decrement(STACKS_FOLLOWING);
            info!(stack_id, "Stopped following stack");
        }
    }

    /// Runs one poll pass over every followed stack.
    ///
    /// A failure on one entry is logged and the entry is retried on the next
    /// tick. It never affects the other entries.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        for (stack_id, locator) in self.registry.snapshot() {
            summary.processed += 1;

            match self.process_entry(&stack_id, &locator).await {
                Ok(EntryOutcome::Stopped(reason)) => {
                    debug!(stack_id = %stack_id, ?reason, "Entry finished");
                    summary.stopped += 1;
                }
                Ok(EntryOutcome::InProgress) => {}
                Err(e) => {
                    warn!(
                        stack_id = %stack_id,
                        resource = %locator,
                        "Failed to process followed stack, retrying next tick: {e}"
                    );
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Processes one followed stack.
    async fn process_entry(&self, stack_id: &str, locator: &ResourceLocator) -> Result<EntryOutcome> {
        let mut resource = match self.bounded("get resource", self.store.get(locator)).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                info!(resource = %locator, "Stack resource not found, it must have been deleted");
                self.stop_following(stack_id);
                return Ok(EntryOutcome::Stopped(StopReason::ResourceGone));
            }
            Err(e) => return Err(e),
        };

        let stack = match self
            .bounded("get stack", self.provisioner.get_stack(stack_id))
            .await
        {
            Ok(stack) => stack,
            Err(e) if e.is_stack_not_found() => {
                error!(stack_id, "Followed stack not found");
                self.stop_following(stack_id);
                return Ok(EntryOutcome::Stopped(StopReason::StackGone));
            }
            Err(e) => return Err(e),
        };

        let terminal = self.provisioner.stack_in_terminal_state(&stack.stack_status);

        self.bounded(
            "update stack status",
            self.merger.update_stack_status(&mut resource, Some(stack)),
        )
        .await?;

        if terminal {
            self.stop_following(stack_id);
            return Ok(EntryOutcome::Stopped(StopReason::Terminal));
        }

        Ok(EntryOutcome::InProgress)
    }

    /// Bounds a call by the request timeout.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        with_deadline(operation, self.request_timeout, call).await
    }

    /// Admits follow requests until the hub closes or shutdown is requested.
    pub async fn receive(self: Arc<Self>, mut receiver: HubReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(request) => {
                        self.admit(request);
                    }
                    None => break,
                },
            }
        }
        debug!("Follow receiver stopped");
    }

    /// Polls followed stacks on the configured interval until shutdown.
    pub async fn work(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    if summary.processed > 0 {
                        debug!(?summary, "Poll tick complete");
                    }
                }
            }
        }
        debug!("Follow worker stopped");
    }

    /// Spawns the receiver and the poll worker.
    pub fn spawn(
        self: &Arc<Self>,
        receiver: HubReceiver,
        cancel: &CancellationToken,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let receiver_task = tokio::spawn(Arc::clone(self).receive(receiver, cancel.clone()));
        let worker_task = tokio::spawn(Arc::clone(self).work(cancel.clone()));
        (receiver_task, worker_task)
    }
}
