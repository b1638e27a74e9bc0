//! Append-only CSV operation log and the worker thread that feeds it.

use crate::error::LogError;
use crate::event::InputEvent;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const HEADER: &str = "timestamp,target_pid,target_app_name,operation,x,y,delta,virtual_key";
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";
const WORKER_POLL: Duration = Duration::from_millis(250);

type CsvOut = csv::Writer<BufWriter<File>>;

pub fn log_file_name(prefix: &str) -> String {
    format!("{}_{}_utc.csv", prefix, Utc::now().format("%Y%m%d_%H%M%S"))
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// The eight column values of one row, unquoted. Absent fields are empty.
pub fn row_fields(event: &InputEvent, app_name: &str) -> [String; 8] {
    let (x, y) = match event.position() {
        Some((x, y)) => (Some(x), Some(y)),
        None => (None, None),
    };
    [
        event.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        event.target_pid.to_string(),
        app_name.to_string(),
        event.operation().as_str().to_string(),
        optional(x),
        optional(y),
        optional(event.delta()),
        optional(event.virtual_key()),
    ]
}

/// Quotes only fields holding a comma, a double quote or a line break; rows end in CRLF.
fn csv_writer(out: BufWriter<File>) -> CsvOut {
    WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::CRLF)
        .from_writer(out)
}

pub struct LogWriter {
    path: PathBuf,
    out: Mutex<Option<CsvOut>>,
    rows: AtomicU64,
}

impl LogWriter {
    /// Opens `{dir}/{prefix}_{yyyyMMdd_HHmmss}_utc.csv`, creating `dir` if needed.
    pub fn create(dir: &Path, prefix: &str) -> Result<Self, LogError> {
        fs::create_dir_all(dir).map_err(|source| LogError::Open {
            path: dir.to_path_buf(),
            source,
        })?;
        Self::open(dir.join(log_file_name(prefix)))
    }

    /// Opens `path` for appending. The BOM and header are written only when the file is empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let open_err = |source: io::Error| LogError::Open {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new().create(true).append(true).open(&path).map_err(open_err)?;
        let is_empty = file.metadata().map_err(open_err)?.len() == 0;
        let mut buffered = BufWriter::new(file);
        if is_empty {
            buffered.write_all(UTF8_BOM).map_err(open_err)?;
        }
        let mut out = csv_writer(buffered);
        if is_empty {
            out.write_record(HEADER.split(','))
                .map_err(|err| open_err(err.into()))?;
        }
        debug!(path = %path.display(), new_file = is_empty, "opened operation log");
        Ok(Self {
            path,
            out: Mutex::new(Some(out)),
            rows: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Buffers one row; nothing reaches the disk until a flush or close.
    pub fn write(&self, event: &InputEvent, app_name: &str) -> Result<(), LogError> {
        let mut out = self.out.lock();
        let out = out.as_mut().ok_or(LogError::Closed)?;
        out.write_record(row_fields(event, app_name))
            .map_err(|err| LogError::Write(err.into()))?;
        self.rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Best effort; a failed flush is logged and otherwise ignored.
    pub fn flush(&self) {
        if let Some(out) = self.out.lock().as_mut() {
            if let Err(err) = out.flush() {
                warn!(path = %self.path.display(), "log flush failed: {err}");
            }
        }
    }

    pub fn close(&self) {
        let Some(mut out) = self.out.lock().take() else {
            return;
        };
        if let Err(err) = out.flush() {
            warn!(path = %self.path.display(), "log flush on close failed: {err}");
        }
        debug!(path = %self.path.display(), rows = self.rows_written(), "closed operation log");
    }

    pub fn is_closed(&self) -> bool {
        self.out.lock().is_none()
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub rows_written: u64,
    pub write_failures: u64,
}

/// Single consumer of the persistence queue.
pub struct WriterWorker {
    writer: Arc<LogWriter>,
    cancel: Arc<AtomicBool>,
    failures: Arc<AtomicU64>,
    finished: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WriterWorker {
    pub fn spawn(
        queue: Receiver<InputEvent>,
        writer: Arc<LogWriter>,
        app_name: String,
        flush_interval: Duration,
    ) -> io::Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let failures = Arc::new(AtomicU64::new(0));
        let (done_tx, finished) = crossbeam_channel::bounded(1);
        let worker_writer = writer.clone();
        let worker_cancel = cancel.clone();
        let worker_failures = failures.clone();
        let handle = thread::Builder::new().name("input-log-writer".to_string()).spawn(move || {
            run_writer(queue, &worker_writer, &app_name, flush_interval, &worker_cancel, &worker_failures);
            let _ = done_tx.send(());
        })?;
        Ok(Self {
            writer,
            cancel,
            failures,
            finished,
            handle: Some(handle),
        })
    }

    pub fn report(&self) -> WorkerReport {
        WorkerReport {
            rows_written: self.writer.rows_written(),
            write_failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.failures.load(Ordering::Relaxed) > 0
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Waits up to `timeout` for the worker to drain the completed queue. If it is
    /// still busy after that it is cancelled, which still ends with a final flush.
    pub fn finish(mut self, timeout: Duration) -> WorkerReport {
        if self.finished.recv_timeout(timeout).is_err() {
            warn!(?timeout, "log writer did not drain in time, cancelling");
            self.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("log writer thread panicked");
            }
        }
        self.report()
    }
}

impl Drop for WriterWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel();
            let _ = handle.join();
        }
    }
}

fn run_writer(
    queue: Receiver<InputEvent>,
    writer: &LogWriter,
    app_name: &str,
    flush_interval: Duration,
    cancel: &AtomicBool,
    failures: &AtomicU64,
) {
    let mut last_flush = Instant::now();
    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!("log writer cancelled");
            break;
        }
        match queue.recv_timeout(WORKER_POLL) {
            Ok(event) => {
                if let Err(err) = writer.write(&event, app_name) {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!("log row write failed: {err}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_flush.elapsed() >= flush_interval {
            writer.flush();
            last_flush = Instant::now();
        }
    }
    writer.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MouseButton, WheelAxis};
    use chrono::{TimeZone, Utc};
    use csv::{ReaderBuilder, StringRecord};
    use tempfile::tempdir;

    fn ts() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 15).unwrap() + chrono::Duration::milliseconds(42)
    }

    fn read(path: &Path) -> String {
        String::from_utf8(fs::read(path).unwrap()).unwrap()
    }

    /// Data records of a log file, parsed independently of the writer.
    fn records(path: &Path) -> Vec<StringRecord> {
        let contents = read(path);
        let body = contents.strip_prefix('\u{feff}').unwrap_or(&contents);
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(body.as_bytes());
        assert_eq!(reader.headers().unwrap(), &StringRecord::from(HEADER.split(',').collect::<Vec<_>>()));
        reader.records().map(|record| record.unwrap()).collect()
    }

    #[test]
    fn keyboard_row_layout() {
        let row = row_fields(&InputEvent::keyboard(ts(), 1234, 65), "notepad").join(",");
        assert_eq!(row, "2024-05-01T08:30:15.042,1234,notepad,keyboard,,,,65");
    }

    #[test]
    fn mouse_and_wheel_row_layout() {
        let click = row_fields(&InputEvent::button(ts(), 5, MouseButton::Left, 120, 40), "app").join(",");
        assert!(click.ends_with(",mouse_l,120,40,,"), "{click}");
        let wheel = row_fields(&InputEvent::wheel(ts(), 5, WheelAxis::Vertical, 1, 2, 120), "app").join(",");
        assert!(wheel.ends_with(",wheel_v,1,2,120,"), "{wheel}");
    }

    #[test]
    fn awkward_app_names_survive_a_csv_reader() {
        let dir = tempdir().unwrap();
        let writer = LogWriter::create(dir.path(), "operation_log").unwrap();
        let name = "My, \"odd\"\napp\r";
        writer.write(&InputEvent::keyboard(ts(), 9, 65), name).unwrap();
        writer.write(&InputEvent::keyboard(ts(), 9, 66), "plain").unwrap();
        writer.close();

        let contents = read(writer.path());
        assert!(contents.contains(",\"My, \"\"odd\"\"\napp\r\",keyboard,"));
        assert!(contents.ends_with(",9,plain,keyboard,,,,66\r\n"));

        let records = records(writer.path());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].len(), 8);
        assert_eq!(&records[0][2], name);
        assert_eq!(&records[0][7], "65");
        assert_eq!(&records[1][2], "plain");
    }

    #[test]
    fn file_name_pattern() {
        let name = log_file_name("operation_log");
        assert!(name.starts_with("operation_log_"));
        assert!(name.ends_with("_utc.csv"));
        assert_eq!(name.len(), "operation_log_".len() + "yyyyMMdd_HHmmss".len() + "_utc.csv".len());
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");

        let writer = LogWriter::open(&path).unwrap();
        writer.write(&InputEvent::keyboard(ts(), 1, 65), "a").unwrap();
        writer.close();

        let writer = LogWriter::open(&path).unwrap();
        writer.write(&InputEvent::keyboard(ts(), 1, 66), "a").unwrap();
        drop(writer);

        let contents = read(&path);
        assert!(contents.starts_with("\u{feff}timestamp,"));
        assert!(contents.starts_with(&format!("\u{feff}{HEADER}\r\n")));
        assert_eq!(contents.matches(HEADER).count(), 1);
        assert_eq!(contents.matches("\u{feff}").count(), 1);
        assert_eq!(records(&path).len(), 2);
    }

    #[test]
    fn writes_are_buffered_until_flush() {
        let dir = tempdir().unwrap();
        let writer = LogWriter::create(dir.path(), "operation_log").unwrap();
        writer.flush();
        let header_only = read(writer.path());
        writer.write(&InputEvent::keyboard(ts(), 1, 65), "a").unwrap();
        assert_eq!(read(writer.path()), header_only);
        writer.flush();
        assert!(read(writer.path()).ends_with(",keyboard,,,,65\r\n"));
        assert_eq!(writer.rows_written(), 1);
    }

    #[test]
    fn close_is_idempotent_and_rejects_writes() {
        let dir = tempdir().unwrap();
        let writer = LogWriter::create(&dir.path().join("nested"), "log").unwrap();
        writer.close();
        writer.close();
        assert!(writer.is_closed());
        assert!(matches!(
            writer.write(&InputEvent::keyboard(ts(), 1, 65), "a"),
            Err(LogError::Closed)
        ));
        assert_eq!(writer.rows_written(), 0);
        writer.flush();
    }

    #[test]
    fn open_failure_is_reported() {
        let dir = tempdir().unwrap();
        let err = LogWriter::open(dir.path()).err().unwrap();
        assert!(matches!(err, LogError::Open { .. }));
    }

    #[test]
    fn worker_flushes_everything_on_completion() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(LogWriter::create(dir.path(), "operation_log").unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = WriterWorker::spawn(rx, writer.clone(), "app".to_string(), Duration::from_secs(3600)).unwrap();
        for vk in 0..25 {
            tx.send(InputEvent::keyboard(ts(), 1, vk)).unwrap();
        }
        drop(tx);
        let report = worker.finish(Duration::from_secs(5));
        assert_eq!(report, WorkerReport { rows_written: 25, write_failures: 0 });
        assert_eq!(report.rows_written, writer.rows_written());
        assert_eq!(records(writer.path()).len(), 25);
    }

    #[test]
    fn worker_flushes_on_interval_while_queue_is_open() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(LogWriter::create(dir.path(), "operation_log").unwrap());
        writer.flush();
        let header_only = read(writer.path());
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = WriterWorker::spawn(rx, writer.clone(), "app".to_string(), Duration::from_millis(100)).unwrap();
        tx.send(InputEvent::keyboard(ts(), 1, 65)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while read(writer.path()) == header_only && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        // Sender still alive and the worker not finished: only the interval flush can have run.
        assert!(read(writer.path()).ends_with(",app,keyboard,,,,65\r\n"));
        assert!(!writer.is_closed());

        drop(tx);
        worker.finish(Duration::from_secs(5));
    }

    #[test]
    fn cancelled_worker_still_flushes() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(LogWriter::create(dir.path(), "operation_log").unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = WriterWorker::spawn(rx, writer.clone(), "app".to_string(), Duration::from_secs(3600)).unwrap();
        tx.send(InputEvent::keyboard(ts(), 1, 65)).unwrap();
        while worker.report().rows_written < 1 {
            thread::sleep(Duration::from_millis(5));
        }
        // Sender still alive: the queue never completes, so the short wait times out.
        let report = worker.finish(Duration::from_millis(10));
        assert_eq!(report.rows_written, 1);
        assert!(read(writer.path()).ends_with(",keyboard,,,,65\r\n"));
        drop(tx);
    }

    #[test]
    fn worker_counts_failed_writes() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(LogWriter::create(dir.path(), "operation_log").unwrap());
        writer.close();
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = WriterWorker::spawn(rx, writer, "app".to_string(), DEFAULT_FLUSH_INTERVAL).unwrap();
        tx.send(InputEvent::keyboard(ts(), 1, 65)).unwrap();
        drop(tx);
        while !worker.is_degraded() {
            thread::sleep(Duration::from_millis(5));
        }
        let report = worker.finish(Duration::from_secs(5));
        assert_eq!(report, WorkerReport { rows_written: 0, write_failures: 1 });
    }
}
