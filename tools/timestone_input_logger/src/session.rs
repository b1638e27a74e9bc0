//! Recording session lifecycle.
//!
//! Start builds the consumer side first (log file, persistence queue, writer
//! worker, persistence subscription) and only then installs the hooks, so the
//! first captured event already has somewhere to go. Stop runs the same steps
//! in reverse and returns once every queued row has been flushed.

use crate::csv_log::{LogWriter, WriterWorker, DEFAULT_FLUSH_INTERVAL};
use crate::dispatch::{EventSubscriber, SubscriptionId};
use crate::error::{LogError, SessionError};
use crate::hook::{HookBackend, HookEngine};
use crate::queue::PersistenceQueue;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub log_dir: PathBuf,
    pub file_prefix: String,
    pub flush_interval: Duration,
    /// Upper bound on waiting for the writer to drain during stop.
    pub stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("input_logs"),
            file_prefix: "operation_log".to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub pid: u32,
    pub app_name: String,
}

impl Target {
    pub fn new(pid: u32, app_name: impl Into<String>) -> Self {
        Self {
            pid,
            app_name: app_name.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub session_id: String,
    pub target: Target,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub info: SessionInfo,
    pub rows_written: u64,
    pub write_failures: u64,
    /// Events that arrived after the persistence queue was completed.
    pub dropped: u64,
}

struct ActiveSession {
    info: SessionInfo,
    writer: Arc<LogWriter>,
    queue: Arc<PersistenceQueue>,
    subscription: SubscriptionId,
    worker: WriterWorker,
}

enum SessionState {
    Idle,
    Recording(ActiveSession),
}

pub struct SessionController<B: HookBackend> {
    engine: HookEngine<B>,
    config: SessionConfig,
    state: SessionState,
}

impl<B: HookBackend> SessionController<B> {
    pub fn new(engine: HookEngine<B>, config: SessionConfig) -> Self {
        Self {
            engine,
            config,
            state: SessionState::Idle,
        }
    }

    pub fn start(&mut self, target: Option<Target>) -> Result<SessionInfo, SessionError> {
        let target = target.filter(|target| target.pid != 0).ok_or(SessionError::NoTarget)?;
        if matches!(self.state, SessionState::Recording(_)) {
            return Err(SessionError::AlreadyRecording);
        }

        let writer = Arc::new(LogWriter::create(&self.config.log_dir, &self.config.file_prefix)?);
        let (queue, queue_rx) = PersistenceQueue::new();
        let queue = Arc::new(queue);
        let worker = WriterWorker::spawn(queue_rx, writer.clone(), target.app_name.clone(), self.config.flush_interval)
            .map_err(LogError::Worker)?;
        let subscription = self.engine.subscribe(queue.clone());

        if let Err(err) = self.engine.start(target.pid) {
            warn!(pid = target.pid, "hook engine failed to start: {err}");
            self.engine.unsubscribe(subscription);
            queue.complete();
            worker.finish(self.config.stop_timeout);
            writer.close();
            return Err(err.into());
        }

        let info = SessionInfo {
            session_id: Uuid::new_v4().to_string(),
            target,
            log_path: writer.path().to_path_buf(),
            started_at: Utc::now(),
        };
        info!(
            session_id = %info.session_id,
            pid = info.target.pid,
            app = %info.target.app_name,
            path = %info.log_path.display(),
            "recording started"
        );
        self.state = SessionState::Recording(ActiveSession {
            info: info.clone(),
            writer,
            queue,
            subscription,
            worker,
        });
        Ok(info)
    }

    /// Stops recording and flushes everything captured so far. Returns `None` when idle.
    pub fn stop(&mut self) -> Option<SessionSummary> {
        let SessionState::Recording(active) = std::mem::replace(&mut self.state, SessionState::Idle) else {
            return None;
        };
        self.engine.stop();
        self.engine.unsubscribe(active.subscription);
        active.queue.complete();
        let report = active.worker.finish(self.config.stop_timeout);
        active.writer.close();

        let summary = SessionSummary {
            info: active.info,
            rows_written: report.rows_written,
            write_failures: report.write_failures,
            dropped: active.queue.dropped(),
        };
        info!(
            session_id = %summary.info.session_id,
            rows = summary.rows_written,
            failures = summary.write_failures,
            "recording stopped"
        );
        Some(summary)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, SessionState::Recording(_))
    }

    pub fn current_session(&self) -> Option<&SessionInfo> {
        match &self.state {
            SessionState::Recording(active) => Some(&active.info),
            SessionState::Idle => None,
        }
    }

    /// True once a row could not be written during the current session.
    pub fn is_degraded(&self) -> bool {
        match &self.state {
            SessionState::Recording(active) => active.worker.is_degraded(),
            SessionState::Idle => false,
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        self.engine.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.engine.unsubscribe(id)
    }

    pub fn engine(&self) -> &HookEngine<B> {
        &self.engine
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl<B: HookBackend> Drop for SessionController<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
