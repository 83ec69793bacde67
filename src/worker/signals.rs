//! Exit classification for worker processes.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// SIGKILL: either our forced kill or the OOM killer.
    Killed,
    /// SIGSEGV or SIGBUS.
    Segfault(Signal),
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig.as_str()),
            Self::Killed => "killed by SIGKILL (forced kill or OOM killer)".to_string(),
            Self::Segfault(sig) => format!("crashed with {}", sig.as_str()),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<ExitStatus> for TerminationReason {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        match status.signal().map(Signal::try_from) {
            Some(Ok(Signal::SIGKILL)) => Self::Killed,
            Some(Ok(sig @ (Signal::SIGSEGV | Signal::SIGBUS))) => Self::Segfault(sig),
            Some(Ok(sig)) => Self::Signaled(sig),
            _ => Self::Unknown,
        }
    }
}
