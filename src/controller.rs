//! Controller driving the reconciler.
//!
//! Reconcile requests come from store change notifications, a periodic
//! resync of every stored resource, and delayed retries of failed passes.
//! Pending requests are de-duplicated and processed one at a time, so a
//! resource is never reconciled concurrently with itself.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::{RecvError, TryRecvError}};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{OperatorError, Result};
use crate::reconciler::StackReconciler;
use crate::resource::{ResourceLocator, ResourceStore};

/// Default interval between full resyncs.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// FIFO of pending reconcile requests without duplicates.
#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: VecDeque<ResourceLocator>,
    queued: HashSet<ResourceLocator>,
}

impl WorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a locator. Returns false if it was already pending.
    pub fn push(&mut self, locator: ResourceLocator) -> bool {
        if !self.queued.insert(locator.clone()) {
            return false;
        }
        self.pending.push_back(locator);
        true
    }

    /// Takes the oldest pending locator.
    pub fn pop(&mut self) -> Option<ResourceLocator> {
        let locator = self.pending.pop_front()?;
        self.queued.remove(&locator);
        Some(locator)
    }

    /// Number of pending locators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Feeds reconcile requests to a [`StackReconciler`].
pub struct Controller {
    /// Resource store.
    store: Arc<dyn ResourceStore>,
    /// Reconciler.
    reconciler: StackReconciler,
    /// Interval between full resyncs.
    resync_interval: Duration,
}

impl Controller {
    /// Creates a new controller.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, reconciler: StackReconciler) -> Self {
        Self {
            store,
            reconciler,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Sets the resync interval. Zero is raised to one millisecond.
    #[must_use]
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Queues every stored resource. Returns how many were newly queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub async fn resync(&self, queue: &mut WorkQueue) -> Result<usize> {
        let locators = self.store.list().await?;
        let total = locators.len();
        let queued = locators.into_iter().filter(|l| queue.push(l.clone())).count();
        debug!(total, queued, "Resynced stack resources");
        Ok(queued)
    }

    /// Runs until the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store change feed closes unexpectedly.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut events = self.store.subscribe();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
        let mut queue = WorkQueue::new();

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            backend = self.store.backend_type(),
            resync_secs = self.resync_interval.as_secs(),
            "Controller started"
        );

        loop {
            while let Some(locator) = queue.pop() {
                if cancel.is_cancelled() {
                    break;
                }
                self.process(&locator, &retry_tx).await;
                if Self::drain_events(&mut events, &mut queue) {
                    self.resync_logged(&mut queue).await;
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.resync_logged(&mut queue).await,
                event = events.recv() => match event {
                    Ok(locator) => {
                        queue.push(locator);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed store events, resyncing");
                        self.resync_logged(&mut queue).await;
                    }
                    Err(RecvError::Closed) => {
                        error!("Store change feed closed");
                        return Err(OperatorError::internal("store change feed closed"));
                    }
                },
                Some(locator) = retry_rx.recv() => {
                    queue.push(locator);
                }
            }
        }

        info!("Controller stopped");
        Ok(())
    }

    /// Reconciles one resource, scheduling a retry on failure.
    async fn process(&self, locator: &ResourceLocator, retry_tx: &mpsc::UnboundedSender<ResourceLocator>) {
        match self.reconciler.reconcile(locator).await {
            Ok(outcome) => debug!(resource = %locator, %outcome, "Reconciled"),
            Err(e) => {
                let delay = Duration::from_secs(e.retry_delay_secs());
                error!(
                    resource = %locator,
                    retry_in_secs = delay.as_secs(),
                    "Reconcile failed: {e}"
                );

                let retry_tx = retry_tx.clone();
                let locator = locator.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // The controller may have stopped in the meantime
                    let _ = retry_tx.send(locator);
                });
            }
        }
    }

    /// Moves buffered events into the queue. Returns true if events were lost.
    fn drain_events(
        events: &mut broadcast::Receiver<ResourceLocator>,
        queue: &mut WorkQueue,
    ) -> bool {
        loop {
            match events.try_recv() {
                Ok(locator) => {
                    queue.push(locator);
                }
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Missed store events, resyncing");
                    return true;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return false,
            }
        }
    }

    async fn resync_logged(&self, queue: &mut WorkQueue) {
        if let Err(e) = self.resync(queue).await {
            warn!("Resync failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::resource::StackSpec;
    use crate::testing::{test_resource, CountingStore, FakeProvisioner};

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_work_queue_dedupes_pending() {
        let mut queue = WorkQueue::new();
        let web = ResourceLocator::new("default", "web");
        let api = ResourceLocator::new("default", "api");

        assert!(queue.push(web.clone()));
        assert!(!queue.push(web.clone()));
        assert!(queue.push(api.clone()));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(web.clone()));
        // Popped entries can be queued again
        assert!(queue.push(web.clone()));
        assert_eq!(queue.pop(), Some(api));
        assert_eq!(queue.pop(), Some(web));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_resync_queues_stored_resources() {
        let (store, _temp) = CountingStore::new();
        store.create(test_resource("web")).await.unwrap();
        store.create(test_resource("api")).await.unwrap();

        let (hub, _receiver) = Hub::channel(4);
        let reconciler = StackReconciler::new(store.clone(), Arc::new(FakeProvisioner::default()), hub);
        let controller = Controller::new(store.clone(), reconciler);

        let mut queue = WorkQueue::new();
        assert_eq!(controller.resync(&mut queue).await.unwrap(), 2);
        assert_eq!(controller.resync(&mut queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_events_drive_resource_to_created() {
        let (store, _temp) = CountingStore::new();
        let provisioner = Arc::new(FakeProvisioner::default());
        let (hub, mut receiver) = Hub::channel(16);
        let reconciler = StackReconciler::new(store.clone(), provisioner.clone(), hub);
        let controller = Arc::new(
            Controller::new(store.clone(), reconciler).with_resync_interval(Duration::from_secs(3600)),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            async move { controller.run(cancel).await }
        });

        // A failing resource does not hold up the others
        store
            .create(crate::resource::StackResource::new("default", "broken", StackSpec::default()))
            .await
            .unwrap();
        store.create(test_resource("web")).await.unwrap();

        wait_for(|| provisioner.calls().create == 1).await;
        let request = receiver.recv().await.expect("follow request");
        assert_eq!(request.locator, ResourceLocator::new("default", "web"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
