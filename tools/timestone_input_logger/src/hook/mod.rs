//! Hook engine: registers the low-level hooks through a [`HookBackend`] and runs the
//! dispatch loop that hands captured events to subscribers.

#[cfg(windows)]
mod win32;

#[cfg(windows)]
pub use win32::{HookThread, Win32Foreground, Win32Hooks};

use crate::capture::CaptureFilter;
use crate::dispatch::{DispatchLoop, EventSubscriber, SubscriptionId, Subscribers, DEFAULT_DISPATCH_INTERVAL};
use crate::error::{EngineStartError, HookInstallError};
use crate::event::InputEvent;
use crossbeam_channel::{unbounded, Sender};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Joins a thread that was just asked to exit. When the request could not be
/// delivered the thread never sees it, so it is detached instead of joined.
/// Returns whether the thread was joined.
#[cfg_attr(not(any(windows, test)), allow(dead_code))]
fn join_signalled<E: fmt::Display>(handle: thread::JoinHandle<()>, signalled: Result<(), E>) -> bool {
    if let Err(err) = signalled {
        warn!("failed to signal hook thread, detaching it: {err}");
        return false;
    }
    if handle.join().is_err() {
        warn!("hook thread panicked");
    }
    true
}

#[cfg(windows)]
pub type SystemHookEngine = HookEngine<Win32Hooks>;

/// Producer side of the low-latency queue, handed to the hook callbacks.
/// `push` never blocks.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<InputEvent>,
}

impl EventSink {
    pub fn push(&self, event: InputEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Registers the OS interception points.
///
/// `install` must register both the keyboard and the mouse hook or neither. The
/// returned registration owns the callback state and unregisters both hooks when
/// dropped.
pub trait HookBackend {
    type Registration;

    fn install(&mut self, filter: CaptureFilter, sink: EventSink) -> Result<Self::Registration, HookInstallError>;
}

enum EngineState<R> {
    Idle,
    Running {
        target_pid: u32,
        hooks: R,
        dispatch: DispatchLoop,
    },
}

pub struct HookEngine<B: HookBackend> {
    backend: B,
    subscribers: Arc<Subscribers>,
    dispatch_interval: Duration,
    state: EngineState<B::Registration>,
}

impl<B: HookBackend> HookEngine<B> {
    pub fn new(backend: B) -> Self {
        Self::with_dispatch_interval(backend, DEFAULT_DISPATCH_INTERVAL)
    }

    pub fn with_dispatch_interval(backend: B, dispatch_interval: Duration) -> Self {
        Self {
            backend,
            subscribers: Arc::new(Subscribers::new()),
            dispatch_interval,
            state: EngineState::Idle,
        }
    }

    /// Starts the dispatch loop and installs the hooks for `target_pid`. No-op while running.
    pub fn start(&mut self, target_pid: u32) -> Result<(), EngineStartError> {
        if let EngineState::Running { target_pid: current, .. } = &self.state {
            debug!(current, requested = target_pid, "hook engine already running");
            return Ok(());
        }
        let (tx, rx) = unbounded();
        let dispatch = DispatchLoop::spawn(rx, self.subscribers.clone(), self.dispatch_interval);
        self.launch(target_pid, EventSink { tx }, dispatch)
    }

    fn launch(
        &mut self,
        target_pid: u32,
        sink: EventSink,
        dispatch: io::Result<DispatchLoop>,
    ) -> Result<(), EngineStartError> {
        let dispatch = dispatch.map_err(EngineStartError::Dispatch)?;
        let hooks = match self.backend.install(CaptureFilter::new(target_pid), sink) {
            Ok(hooks) => hooks,
            Err(err) => {
                dispatch.stop();
                return Err(err.into());
            }
        };
        self.state = EngineState::Running {
            target_pid,
            hooks,
            dispatch,
        };
        info!(target_pid, "hook engine started");
        Ok(())
    }

    /// Unregisters the hooks, then stops the dispatch loop after one last drain.
    /// No-op while idle.
    pub fn stop(&mut self) {
        if let EngineState::Running {
            target_pid,
            hooks,
            dispatch,
        } = std::mem::replace(&mut self.state, EngineState::Idle)
        {
            drop(hooks);
            dispatch.stop();
            info!(target_pid, "hook engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, EngineState::Running { .. })
    }

    pub fn target_pid(&self) -> Option<u32> {
        match self.state {
            EngineState::Running { target_pid, .. } => Some(target_pid),
            EngineState::Idle => None,
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        self.subscribers.add(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: HookBackend> Drop for HookEngine<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
