//! System-wide keyboard and mouse capture scoped to one target process.
//!
//! Low-level hooks observe input from every application; only events that arrive while
//! a window of the target process is in the foreground are kept. Captured events are
//! fanned out to subscribers by a dispatch loop, and a recording session persists them
//! to an append-only CSV operation log.

pub mod capture;
pub mod config;
pub mod csv_log;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod hook;
pub mod process;
pub mod queue;
pub mod session;

pub use capture::{CaptureFilter, ForegroundContext, ForegroundProbe, Point, RawInput};
pub use csv_log::{LogWriter, WorkerReport, WriterWorker};
pub use dispatch::{EventSubscriber, SubscriptionId};
pub use error::{EngineStartError, HookInstallError, HookKind, LogError, SessionError};
pub use event::{InputEvent, InputKind, MouseButton, Operation, WheelAxis};
pub use hook::{EventSink, HookBackend, HookEngine};
pub use queue::PersistenceQueue;
pub use session::{SessionConfig, SessionController, SessionInfo, SessionSummary, Target};

#[cfg(windows)]
pub use hook::{SystemHookEngine, Win32Hooks};
