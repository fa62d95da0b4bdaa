use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::debug;

use crate::models::dto::{GraphSnapshot, StatusEvent};

const STATUS_CAPACITY: usize = 32;

/// Fans snapshots out to viewers through a single-slot "latest value" cell.
///
/// Publishing never waits on a viewer: each subscription only remembers
/// which version it saw last, so a slow viewer skips straight to the newest
/// snapshot.
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

struct Shared {
    latest: watch::Sender<Arc<GraphSnapshot>>,
    status: broadcast::Sender<StatusEvent>,
    viewers: AtomicUsize,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(Arc::new(GraphSnapshot::default()));
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            shared: Arc::new(Shared {
                latest,
                status,
                viewers: AtomicUsize::new(0),
                wake_tx,
                wake_rx,
            }),
        }
    }

    /// Replaces the current snapshot unless it is already newer. Returns
    /// whether viewers will see `snapshot`.
    pub fn publish(&self, snapshot: Arc<GraphSnapshot>) -> bool {
        self.shared.latest.send_if_modified(|current| {
            if snapshot.version <= current.version {
                return false;
            }
            *current = snapshot;
            true
        })
    }

    pub fn publish_status(&self, event: StatusEvent) {
        // no receivers is fine; status is best effort
        let _ = self.shared.status.send(event);
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> Arc<GraphSnapshot> {
        self.shared.latest.borrow().clone()
    }

    pub fn viewers(&self) -> usize {
        self.shared.viewers.load(Ordering::SeqCst)
    }

    /// Registers a viewer. The first viewer after an empty period wakes any
    /// paused source.
    pub fn subscribe(&self) -> Subscription {
        let previous = self.shared.viewers.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            debug!("first viewer subscribed; waking source");
            let _ = self.shared.wake_tx.try_send(());
        }
        let snapshots = self.shared.latest.subscribe();
        let initial = snapshots.borrow().clone();
        Subscription {
            snapshots,
            status: self.shared.status.subscribe(),
            initial: Some(initial),
            seen: None,
            shared: self.shared.clone(),
        }
    }

    /// Status stream that does not count as a viewer.
    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.status.subscribe()
    }

    pub fn presence(&self) -> Presence {
        Presence {
            shared: self.shared.clone(),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Snapshot(Arc<GraphSnapshot>),
    Status(StatusEvent),
}

/// One viewer's mailbox. Dropping it deregisters the viewer.
pub struct Subscription {
    snapshots: watch::Receiver<Arc<GraphSnapshot>>,
    status: broadcast::Receiver<StatusEvent>,
    initial: Option<Arc<GraphSnapshot>>,
    seen: Option<u64>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Next snapshot or status event. Snapshots arrive in increasing version
    /// order; intermediate ones may be skipped.
    pub async fn recv(&mut self) -> Option<Update> {
        if let Some(snapshot) = self.initial.take() {
            self.seen = Some(snapshot.version);
            return Some(Update::Snapshot(snapshot));
        }
        loop {
            tokio::select! {
                changed = self.snapshots.changed() => {
                    changed.ok()?;
                    let snapshot = self.snapshots.borrow_and_update().clone();
                    if self.seen.map_or(true, |seen| snapshot.version > seen) {
                        self.seen = Some(snapshot.version);
                        return Some(Update::Snapshot(snapshot));
                    }
                }
                status = self.status.recv() => match status {
                    Ok(event) => return Some(Update::Status(event)),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "viewer fell behind on status events");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    }

    /// Waits for the next snapshot, skipping status events.
    pub async fn next_snapshot(&mut self) -> Option<Arc<GraphSnapshot>> {
        loop {
            if let Update::Snapshot(snapshot) = self.recv().await? {
                return Some(snapshot);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.viewers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a source sees of its audience: the viewer count, a wake signal for
/// the 0 -> 1 transition, and the status channel.
#[derive(Clone)]
pub struct Presence {
    shared: Arc<Shared>,
}

impl Presence {
    pub fn viewers(&self) -> usize {
        self.shared.viewers.load(Ordering::SeqCst)
    }

    pub fn wake(&self) -> &Receiver<()> {
        &self.shared.wake_rx
    }

    pub fn announce(&self, event: StatusEvent) {
        let _ = self.shared.status.send(event);
    }
}
