use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use timestone_input_logger::config::{ensure_app_dir, ConfigOverrides};
use timestone_input_logger::session::SessionInfo;
use tracing_subscriber::EnvFilter;

const LOCK_FILE: &str = "input_logger.lock";
const STOP_FILE: &str = "input_logger.stop";

#[derive(Debug, Default)]
struct StartArgs {
    pid: Option<u32>,
    app_name: Option<String>,
    overrides: ConfigOverrides,
}

fn main() -> Result<()> {
    init_tracing();
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("start") => {
            let start = parse_start_args(args);
            run_logger(start)?;
        }
        Some("stop") => {
            stop_logger()?;
        }
        Some("status") => {
            print_status()?;
        }
        _ => {
            print_usage();
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_usage() {
    println!("timestone_input_logger");
    println!("Usage:");
    println!("  timestone_input_logger start --pid PID [--app-name NAME] [--config PATH]");
    println!("                               [--log-dir DIR] [--prefix PREFIX] [--echo]");
    println!("  timestone_input_logger stop");
    println!("  timestone_input_logger status");
}

fn parse_start_args(mut args: impl Iterator<Item = String>) -> StartArgs {
    let mut start = StartArgs::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--pid" => {
                if let Some(value) = args.next() {
                    start.pid = value.parse::<u32>().ok();
                }
            }
            "--app-name" => {
                if let Some(value) = args.next() {
                    start.app_name = Some(value);
                }
            }
            "--config" => {
                if let Some(value) = args.next() {
                    start.overrides.config_path = Some(PathBuf::from(value));
                }
            }
            "--log-dir" => {
                if let Some(value) = args.next() {
                    start.overrides.log_dir = Some(value);
                }
            }
            "--prefix" => {
                if let Some(value) = args.next() {
                    start.overrides.file_prefix = Some(value);
                }
            }
            "--echo" => {
                start.overrides.echo_events = Some(true);
            }
            _ => {}
        }
    }
    start
}

#[cfg(windows)]
fn run_logger(start: StartArgs) -> Result<()> {
    use crossbeam_channel::{bounded, select};
    use std::sync::Arc;
    use std::time::Duration;
    use timestone_input_logger::config::load_config;
    use timestone_input_logger::event::InputEvent;
    use timestone_input_logger::hook::{HookEngine, Win32Hooks};
    use timestone_input_logger::process::{app_name_from_image_path, is_pid_running, process_image_path};
    use timestone_input_logger::session::{SessionController, Target};
    use tracing::{info, warn};

    let base_dir = ensure_app_dir()?;
    let config = load_config(&base_dir, &start.overrides)?;
    let lock_path = base_dir.join(LOCK_FILE);
    if lock_path.exists() {
        println!("Input logger already running (lock file present).");
        return Ok(());
    }

    let target = match start.pid {
        Some(pid) if is_pid_running(pid) => {
            let app_name = start
                .app_name
                .or_else(|| process_image_path(pid).map(|path| app_name_from_image_path(&path)))
                .unwrap_or_default();
            Some(Target::new(pid, app_name))
        }
        Some(pid) => anyhow::bail!("process {pid} is not running"),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            let _ = shutdown_tx.try_send(());
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    let engine = HookEngine::with_dispatch_interval(Win32Hooks, config.dispatch_interval());
    let mut session = SessionController::new(engine, config.session_config(&base_dir));
    if config.echo_events {
        session.subscribe(Arc::new(|event: &InputEvent| -> anyhow::Result<()> {
            println!("{}", serde_json::to_string(event)?);
            Ok(())
        }));
    }
    let info = session.start(target).context("Failed to start recording")?;
    let _lock = LockFile::create(lock_path, &info)?;
    println!("Recording {} (pid {}) to {}", info.target.app_name, info.target.pid, info.log_path.display());

    let stop_path = base_dir.join(STOP_FILE);
    let (watcher_done_tx, watcher_done_rx) = bounded::<()>(0);
    let watcher = spawn_stop_watcher(stop_path, shutdown_tx, watcher_done_rx);

    let target_pid = info.target.pid;
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            default(Duration::from_secs(1)) => {
                if !is_pid_running(target_pid) {
                    info!(target_pid, "target process exited");
                    break;
                }
                if session.is_degraded() {
                    warn!("log writes are failing; rows are being lost");
                }
            }
        }
    }

    drop(watcher_done_tx);
    watcher.join().ok();
    if let Some(summary) = session.stop() {
        println!(
            "Recorded {} rows to {} ({} write failures)",
            summary.rows_written,
            summary.info.log_path.display(),
            summary.write_failures
        );
    }
    Ok(())
}

#[cfg(not(windows))]
fn run_logger(_start: StartArgs) -> Result<()> {
    anyhow::bail!("input capture requires Windows")
}

#[cfg(windows)]
fn spawn_stop_watcher(
    stop_path: PathBuf,
    shutdown: crossbeam_channel::Sender<()>,
    done: crossbeam_channel::Receiver<()>,
) -> std::thread::JoinHandle<()> {
    use crossbeam_channel::RecvTimeoutError;
    use std::time::Duration;

    std::thread::spawn(move || {
        let interval = Duration::from_millis(200);
        loop {
            if stop_path.exists() {
                let _ = fs::remove_file(&stop_path);
                let _ = shutdown.try_send(());
                break;
            }
            match done.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }
    })
}

fn stop_logger() -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let lock_path = base_dir.join(LOCK_FILE);
    if !lock_path.exists() {
        println!("No active input logger session found.");
        return Ok(());
    }
    let stop_path = base_dir.join(STOP_FILE);
    fs::write(&stop_path, b"stop").context("Failed to write stop signal")?;
    println!("Stop signal written.");
    if let Some(pid) = read_lock_info(&lock_path).and_then(|info| info.pid) {
        if !pid_running(pid) {
            let _ = fs::remove_file(&lock_path);
            let _ = fs::remove_file(&stop_path);
            println!("Input logger was not running; stale lock cleared.");
        }
    }
    Ok(())
}

fn print_status() -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let lock_path = base_dir.join(LOCK_FILE);
    let Some(info) = read_lock_info(&lock_path) else {
        println!("Input logger status: stopped");
        return Ok(());
    };
    if info.pid.is_some_and(|pid| !pid_running(pid)) {
        let _ = fs::remove_file(&lock_path);
        println!("Input logger status: stopped (stale lock cleared)");
        return Ok(());
    }
    println!("Input logger status: running");
    if !info.raw.trim().is_empty() {
        println!("{}", info.raw.trim_end());
    }
    Ok(())
}

#[cfg(windows)]
fn pid_running(pid: u32) -> bool {
    timestone_input_logger::process::is_pid_running(pid)
}

#[cfg(not(windows))]
fn pid_running(_pid: u32) -> bool {
    true
}

#[cfg_attr(not(windows), allow(dead_code))]
fn lock_contents(info: &SessionInfo, pid: u32) -> String {
    format!(
        "session_id={}\npid={}\ntarget_pid={}\ntarget_app={}\nlog_path={}\nstarted_at={}\n",
        info.session_id,
        pid,
        info.target.pid,
        info.target.app_name,
        info.log_path.display(),
        info.started_at.to_rfc3339()
    )
}

/// The lock file of a running recorder; removed again when dropped.
#[cfg_attr(not(windows), allow(dead_code))]
struct LockFile {
    path: PathBuf,
}

#[cfg_attr(not(windows), allow(dead_code))]
impl LockFile {
    fn create(path: PathBuf, info: &SessionInfo) -> Result<Self> {
        fs::write(&path, lock_contents(info, std::process::id())).context("Failed to write lock file")?;
        Ok(Self { path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

struct LockInfo {
    pid: Option<u32>,
    raw: String,
}

fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let raw = fs::read_to_string(path).ok()?;
    let pid = raw.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "pid").then(|| value.trim().parse::<u32>().ok()).flatten()
    });
    Some(LockInfo { pid, raw })
}
