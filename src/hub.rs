//! Handoff queue from the reconciler to the follower.
//!
//! Enqueueing never blocks. When the buffer is full the send is completed by
//! a detached task, so requests are never dropped while a runtime is running
//! and the queue effectively grows under pressure.

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::resource::{ResourceLocator, StackResource};

/// A request to follow a remote stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowRequest {
    /// Remote stack identifier.
    pub stack_id: String,
    /// Resource owning the stack.
    pub locator: ResourceLocator,
    /// UID of the owning resource.
    pub uid: String,
}

impl FollowRequest {
    /// Creates a request for the given stack on behalf of a resource.
    #[must_use]
    pub fn new(stack_id: impl Into<String>, resource: &StackResource) -> Self {
        Self {
            stack_id: stack_id.into(),
            locator: resource.locator(),
            uid: resource.metadata.uid.clone(),
        }
    }
}

/// Sending half of the handoff queue.
#[derive(Debug, Clone)]
pub struct Hub {
    sender: mpsc::Sender<FollowRequest>,
}

/// Receiving half of the handoff queue.
#[derive(Debug)]
pub struct HubReceiver {
    receiver: mpsc::Receiver<FollowRequest>,
}

impl Hub {
    /// Creates a handoff queue buffering up to `capacity` requests.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, HubReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, HubReceiver { receiver })
    }

    /// Submits a stack for following without blocking.
    pub fn submit(&self, stack_id: &str, resource: &StackResource) {
        let request = FollowRequest::new(stack_id, resource);
        debug!(stack_id, resource = %request.locator, "Submitting follow request");

        match self.sender.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                let Ok(handle) = Handle::try_current() else {
                    warn!(stack_id = %request.stack_id, "Follow queue full outside a runtime, dropping request");
                    return;
                };
                debug!("Follow queue full, deferring send");
                let sender = self.sender.clone();
                handle.spawn(async move {
                    if sender.send(request).await.is_err() {
                        warn!("Follower stopped before a deferred follow request was delivered");
                    }
                });
            }
            Err(TrySendError::Closed(request)) => {
                warn!(stack_id = %request.stack_id, "Follower is not running, dropping follow request");
            }
        }
    }
}

impl HubReceiver {
    /// Waits for the next follow request.
    ///
    /// Returns `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<FollowRequest> {
        self.receiver.recv().await
    }

    /// Takes a pending request without waiting.
    pub fn try_recv(&mut self) -> Option<FollowRequest> {
        self.receiver.try_recv().ok()
    }
}
