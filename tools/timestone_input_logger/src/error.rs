use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    Keyboard,
    Mouse,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Keyboard => f.write_str("keyboard"),
            HookKind::Mouse => f.write_str("mouse"),
        }
    }
}

/// A low-level hook could not be registered. `code` is the OS error code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to install {hook} hook (os error {code})")]
pub struct HookInstallError {
    pub hook: HookKind,
    pub code: u32,
}

impl HookInstallError {
    pub fn new(hook: HookKind, code: u32) -> Self {
        Self { hook, code }
    }
}

/// Why the hook engine could not start. Nothing is left running in either case.
#[derive(Debug, Error)]
pub enum EngineStartError {
    #[error(transparent)]
    Hook(#[from] HookInstallError),
    #[error("failed to start dispatch thread")]
    Dispatch(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to open log file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write log row")]
    Write(#[source] io::Error),
    #[error("log writer is closed")]
    Closed,
    #[error("failed to start log writer thread")]
    Worker(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no target process selected")]
    NoTarget,
    #[error("a recording session is already active")]
    AlreadyRecording,
    #[error(transparent)]
    Hook(#[from] HookInstallError),
    #[error("failed to start dispatch thread")]
    Dispatch(#[source] io::Error),
    #[error(transparent)]
    Log(#[from] LogError),
}

impl From<EngineStartError> for SessionError {
    fn from(err: EngineStartError) -> Self {
        match err {
            EngineStartError::Hook(err) => SessionError::Hook(err),
            EngineStartError::Dispatch(err) => SessionError::Dispatch(err),
        }
    }
}
