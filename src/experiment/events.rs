//! Run event fan-out.
//!
//! The scheduler publishes every lifecycle event through an [`EventChannel`]. Delivery
//! happens two ways, both in emission order:
//!
//! - **Observers**: objects implementing [`AcquisitionObserver`], called synchronously
//!   on the scheduler task. They must return quickly.
//! - **Subscribers**: `tokio::sync::broadcast` receivers for async consumers such as
//!   the CLI progress printer. A lagging subscriber loses events; the scheduler never
//!   waits for it.
//!
//! Neither path replays history: a late registration only sees later events.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::experiment::state::RunState;

/// Notification emitted by a run.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// Emitted once on entry to `Running`
    Started {
        /// Identifier of the new run
        run_id: String,
        /// Steps the run will take
        total: u64,
    },
    /// Emitted after each successful write
    Progress(RunState),
    /// Informational message (cancel acknowledgements, timepoint timing)
    Log(String),
    /// Terminal: every coordinate was written
    Completed {
        /// Frames accepted by the sink
        frames_written: u64,
    },
    /// Terminal: a step failed
    Failed {
        /// Classification of the error
        kind: ErrorKind,
        /// Rendered error message
        message: String,
    },
    /// Terminal: cancelled at a step boundary
    Cancelled {
        /// Frames accepted by the sink before the stop
        frames_written: u64,
    },
}

impl AcquisitionEvent {
    /// True for the three events that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AcquisitionEvent::Completed { .. }
                | AcquisitionEvent::Failed { .. }
                | AcquisitionEvent::Cancelled { .. }
        )
    }
}

/// Capability interface for run observers. Every hook defaults to a no-op.
pub trait AcquisitionObserver: Send + Sync {
    /// Run entered `Running`.
    fn on_started(&self, _run_id: &str, _total: u64) {}

    /// A frame was written.
    fn on_progress(&self, _state: &RunState) {}

    /// Informational message.
    fn on_log(&self, _message: &str) {}

    /// Run completed.
    fn on_completed(&self, _frames_written: u64) {}

    /// Run failed.
    fn on_failed(&self, _message: &str) {}

    /// Run cancelled.
    fn on_cancelled(&self, _frames_written: u64) {}
}

fn dispatch(observer: &dyn AcquisitionObserver, event: &AcquisitionEvent) {
    match event {
        AcquisitionEvent::Started { run_id, total } => observer.on_started(run_id, *total),
        AcquisitionEvent::Progress(state) => observer.on_progress(state),
        AcquisitionEvent::Log(message) => observer.on_log(message),
        AcquisitionEvent::Completed { frames_written } => observer.on_completed(*frames_written),
        AcquisitionEvent::Failed { message, .. } => observer.on_failed(message),
        AcquisitionEvent::Cancelled { frames_written } => observer.on_cancelled(*frames_written),
    }
}

/// Registration token returned by [`EventChannel::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

struct Inner {
    observers: RwLock<Vec<(ObserverHandle, Arc<dyn AcquisitionObserver>)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<AcquisitionEvent>,
}

/// Ordered fan-out of [`AcquisitionEvent`]s. Clones share the same registry.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("observers", &self.observer_count())
            .field("subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventChannel {
    /// Create a channel whose broadcast side buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                observers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
                sender,
            }),
        }
    }

    /// Attach `observer`; it stays registered while the returned handle lives.
    pub fn register(&self, observer: Arc<dyn AcquisitionObserver>) -> ObserverHandle {
        let handle = ObserverHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.observers.write().push((handle, observer));
        handle
    }

    /// Remove an observer. Returns false if the handle was not registered.
    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.inner.observers.write();
        let before = observers.len();
        observers.retain(|(h, _)| *h != handle);
        observers.len() != before
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.read().len()
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.inner.sender.subscribe()
    }

    /// Deliver `event` to all observers, then to subscribers.
    pub fn emit(&self, event: AcquisitionEvent) {
        // Snapshot the registry so observers can (un)register from inside a hook.
        let observers: Vec<Arc<dyn AcquisitionObserver>> = self
            .inner
            .observers
            .read()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in &observers {
            dispatch(observer.as_ref(), &event);
        }
        // No subscribers is not an error.
        let _ = self.inner.sender.send(event);
    }
}
