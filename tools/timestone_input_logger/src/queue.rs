use crate::dispatch::EventSubscriber;
use crate::event::InputEvent;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unbounded hand-off from the dispatch thread to the log writer worker.
///
/// [`complete`](Self::complete) drops the only sender, so the consumer sees the
/// channel disconnect once everything already pushed has been received.
pub struct PersistenceQueue {
    sender: Mutex<Option<Sender<InputEvent>>>,
    dropped: AtomicU64,
}

impl PersistenceQueue {
    pub fn new() -> (Self, Receiver<InputEvent>) {
        let (tx, rx) = unbounded();
        let queue = Self {
            sender: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
        };
        (queue, rx)
    }

    /// Returns `false` once the queue has been completed.
    pub fn push(&self, event: InputEvent) -> bool {
        let sender = self.sender.lock();
        let accepted = match sender.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        };
        if !accepted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    pub fn complete(&self) {
        self.sender.lock().take();
    }

    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Events pushed after completion (or after the consumer went away).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSubscriber for PersistenceQueue {
    fn on_event(&self, event: &InputEvent) -> anyhow::Result<()> {
        self.push(*event);
        Ok(())
    }
}
