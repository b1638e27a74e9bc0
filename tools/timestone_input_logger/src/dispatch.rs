//! Delivery of captured events to subscribers, off the hook thread.

use crate::event::InputEvent;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Receives every captured event, in capture order, on the dispatch thread.
///
/// Implementations should return quickly; an error or a panic is logged and the
/// event still reaches the remaining subscribers.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &InputEvent) -> anyhow::Result<()>;
}

impl<F> EventSubscriber for F
where
    F: Fn(&InputEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &InputEvent) -> anyhow::Result<()> {
        self(event)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Subscribers {
    entries: RwLock<Vec<(SubscriptionId, Arc<dyn EventSubscriber>)>>,
    next_id: AtomicU64,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, subscriber));
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deliver(&self, event: &InputEvent) {
        // Snapshot so a subscriber may (un)subscribe from inside its callback.
        let snapshot: Vec<(SubscriptionId, Arc<dyn EventSubscriber>)> = self.entries.read().clone();
        for (id, subscriber) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(subscription = id.0, "subscriber failed: {err:#}"),
                Err(_) => warn!(subscription = id.0, "subscriber panicked"),
            }
        }
    }
}

/// Background thread that drains the capture queue every `interval`.
pub struct DispatchLoop {
    cancel: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DispatchLoop {
    pub fn spawn(queue: Receiver<InputEvent>, subscribers: Arc<Subscribers>, interval: Duration) -> io::Result<Self> {
        let (cancel, cancelled) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("input-dispatch".to_string())
            .spawn(move || run_dispatch(queue, subscribers, interval, cancelled))?;
        Ok(Self {
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }

    /// Cancels the loop and waits for it. Events already queued are drained once more
    /// before the thread exits.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the loop out of its tick wait.
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(queue: &Receiver<InputEvent>, subscribers: &Subscribers) -> usize {
    let mut delivered = 0;
    for event in queue.try_iter() {
        subscribers.deliver(&event);
        delivered += 1;
    }
    delivered
}

fn run_dispatch(queue: Receiver<InputEvent>, subscribers: Arc<Subscribers>, interval: Duration, cancelled: Receiver<()>) {
    loop {
        drain(&queue, &subscribers);
        match cancelled.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    let tail = drain(&queue, &subscribers);
    debug!(tail, "dispatch loop stopped");
}
