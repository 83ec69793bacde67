//! Worker subprocess spawning.
//!
//! Workers are the host program itself, re-executed with the same arguments
//! and the worker id in [`WORKER_ID_ENV`]. `worker_rota::run` checks that
//! variable to decide which side of the pool it is on.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use super::pool::EventSender;
use super::proc::{ProcessHandle, WorkerProcess};
use super::protocol::{WORKER_ID_ENV, WorkerId};
use crate::error::{Result, RotaError};

/// Creates worker processes for the supervisor.
pub trait Launcher: Send {
    /// Start worker `id`.
    ///
    /// Control messages and the eventual exit of the process must be
    /// delivered through `events`.
    fn launch(&mut self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches workers as OS processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = OsString>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    /// Re-execute the running program with its own arguments.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| RotaError::Worker(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(program, std::env::args_os().skip(1)))
    }

    fn command(&self, id: WorkerId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env(WORKER_ID_ENV, id.to_string());

        // stdin/stdout form the control channel; logs share our stderr.
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerProcess>> {
        let mut child = self
            .command(id)
            .spawn()
            .map_err(|e| RotaError::Worker(format!("Failed to spawn worker: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RotaError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RotaError::Worker("Child stdout not captured".into()))?;

        Ok(Box::new(ProcessHandle::monitor(id, child, stdin, stdout, events)))
    }
}
