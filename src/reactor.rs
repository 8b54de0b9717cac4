//! Readiness event sources
//!
//! Bridges socket descriptors to the reactor's single event queue.
//! Each `EventSource` owns a small watcher task that waits for its
//! descriptor to become readable, posts its `Event` to the queue and then
//! parks until the reactor re-arms it. The reactor (`ChatServer::run`)
//! drains the queue one event at a time, so every handler runs on one
//! serial execution context and never overlaps another.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{Generation, SessionKey};

/// Capacity of the reactor's event queue
pub const EVENT_QUEUE_SIZE: usize = 256;

/// Readiness notification delivered to the reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The listening socket has a pending connection (or woke spuriously)
    Acceptable,
    /// A session's socket has data (or EOF) to consume
    ///
    /// Descriptors are reused after close, so the generation tells a live
    /// session apart from an earlier one on the same descriptor.
    Readable(SessionKey, Generation),
}

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Create the reactor's event queue
pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_QUEUE_SIZE)
}

/// Read-readiness registration for one descriptor
///
/// At most one event per source is queued at a time: after posting, the
/// watcher waits for `rearm()`, which the reactor calls once it has handled
/// the event. Dropping the source cancels it.
#[derive(Debug)]
pub struct EventSource {
    event: Event,
    rearm: Arc<Notify>,
    watcher: Option<JoinHandle<()>>,
}

impl EventSource {
    /// Start watching `io` for read-readiness, posting `event` to `queue`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(io: Arc<AsyncFd<T>>, event: Event, queue: EventSender) -> Self
    where
        T: AsRawFd + Send + Sync + 'static,
    {
        let rearm = Arc::new(Notify::new());
        let watcher = tokio::spawn(watch(io, event, queue, Arc::clone(&rearm)));
        Self {
            event,
            rearm,
            watcher: Some(watcher),
        }
    }

    /// Whether the source is still registered
    pub fn is_active(&self) -> bool {
        self.watcher.is_some()
    }

    /// Allow the next readiness notification to be posted
    pub fn rearm(&self) {
        if self.is_active() {
            self.rearm.notify_one();
        }
    }

    /// Deregister interest; idempotent
    ///
    /// No event from this source is posted after this returns. An event
    /// posted earlier may still sit in the queue; the reactor drops events
    /// whose target is gone.
    pub fn cancel(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
            debug!("Cancelled event source {:?}", self.event);
        }
    }

    /// Cancel and wait until the watcher has released the descriptor
    pub async fn release(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
            let _ = watcher.await;
            debug!("Released event source {:?}", self.event);
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Watcher task: readiness -> queue, then park until re-armed
async fn watch<T: AsRawFd>(
    io: Arc<AsyncFd<T>>,
    event: Event,
    queue: EventSender,
    rearm: Arc<Notify>,
) {
    loop {
        // The guard is dropped without clearing readiness; the reactor's
        // own try_io clears it once the descriptor reports WouldBlock.
        if let Err(e) = io.readable().await.map(drop) {
            warn!("Readiness wait failed for {:?}: {}", event, e);
            break;
        }

        if queue.send(event).await.is_err() {
            debug!("Reactor gone, ending watcher for {:?}", event);
            break;
        }

        rearm.notified().await;
    }
}
