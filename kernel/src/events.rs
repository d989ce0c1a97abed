//! In-process broadcast of branch lifecycle events.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::{BranchName, BranchState, ProjectName};

const EVENT_CAPACITY: usize = 256;

/// Something that happened to a project or branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BranchEvent {
    /// `init` finished; `main` is active.
    ProjectInitialized {
        /// Project.
        project: ProjectName,
        /// Proxy port of the project.
        proxy_port: u16,
    },
    /// A branch was snapshotted and recorded.
    BranchCreated {
        /// Project.
        project: ProjectName,
        /// New branch.
        branch: BranchName,
        /// Branch it was snapshotted from.
        parent: BranchName,
        /// Assigned port.
        port: u16,
    },
    /// A branch moved between lifecycle states.
    StateChanged {
        /// Project.
        project: ProjectName,
        /// Branch.
        branch: BranchName,
        /// Previous state.
        from: BranchState,
        /// New state.
        to: BranchState,
    },
    /// The active pointer moved.
    BranchSwitched {
        /// Project.
        project: ProjectName,
        /// Previously active branch.
        from: BranchName,
        /// Newly active branch.
        to: BranchName,
    },
    /// A branch record and its snapshot were removed.
    BranchDeleted {
        /// Project.
        project: ProjectName,
        /// Removed branch.
        branch: BranchName,
        /// Port returned to the pool.
        port: u16,
    },
    /// A project and all of its branches were removed.
    ProjectDeleted {
        /// Project.
        project: ProjectName,
    },
    /// The proxy now sends new connections of `project` to `backend`.
    RoutePublished {
        /// Project.
        project: ProjectName,
        /// Routed branch.
        branch: BranchName,
        /// Backend address.
        backend: SocketAddr,
    },
    /// New connections of `project` are refused.
    RouteWithdrawn {
        /// Project.
        project: ProjectName,
    },
}

/// Why [`EventReceiver::recv`] returned no event.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    /// The bus was dropped.
    #[error("event bus closed")]
    Closed,
    /// The receiver fell behind and `0` events were discarded.
    #[error("receiver lagged, {0} events skipped")]
    Lagged(u64),
}

/// Broadcasts [`BranchEvent`]s to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BranchEvent>,
    subscribers: Arc<AtomicUsize>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sender,
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> EventReceiver {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        EventReceiver {
            inner: self.sender.subscribe(),
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: BranchEvent) {
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "Event published"),
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "Event dropped, no subscribers");
            }
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`EventBus`] subscription.
#[derive(Debug)]
pub struct EventReceiver {
    inner: broadcast::Receiver<BranchEvent>,
    subscribers: Arc<AtomicUsize>,
}

impl EventReceiver {
    /// Waits for the next event.
    ///
    /// # Errors
    ///
    /// [`EventError::Lagged`] if events were skipped (the receiver stays
    /// usable), [`EventError::Closed`] once the bus is gone.
    pub async fn recv(&mut self) -> Result<BranchEvent, EventError> {
        self.inner.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventError::Closed,
            broadcast::error::RecvError::Lagged(count) => {
                warn!(skipped = count, "Event receiver lagged");
                EventError::Lagged(count)
            }
        })
    }

    /// Returns the next already-published event, if any.
    pub fn try_recv(&mut self) -> Option<BranchEvent> {
        self.inner.try_recv().ok()
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.subscribers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted(name: &str) -> BranchEvent {
        BranchEvent::ProjectDeleted {
            project: ProjectName::new(name).unwrap(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(deleted("a"));
        bus.publish(deleted("b"));
        assert_eq!(rx.recv().await.unwrap(), deleted("a"));
        assert_eq!(rx.recv().await.unwrap(), deleted("b"));
    }

    #[test]
    fn subscriber_count_tracks_drops() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx2);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(deleted("nobody-listens"));
    }

    #[tokio::test]
    async fn lagging_receiver_recovers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for _ in 0..=EVENT_CAPACITY {
            bus.publish(deleted("spam"));
        }
        assert!(matches!(rx.recv().await, Err(EventError::Lagged(_))));
        assert_eq!(rx.recv().await.unwrap(), deleted("spam"));
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(deleted("p1")).unwrap();
        assert_eq!(json["event"], "project_deleted");
        assert_eq!(json["project"], "p1");
    }
}
