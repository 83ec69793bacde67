//! Process handle for worker subprocesses.
//!
//! Each spawned child is owned by a monitor task. The supervisor keeps a
//! [`ProcessHandle`] that holds the child's stdin (the control channel) and
//! asks the monitor to signal the child. The monitor forwards control
//! messages from the child's stdout and reports the exit as pool events.

use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;

use super::pool::{EventSender, PoolEvent};
use super::protocol::{ControlMessage, WorkerId};
use super::signals::TerminationReason;

/// How long to keep reading a dead worker's stdout for trailing messages.
const STDOUT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Supervisor-side view of a worker process.
///
/// Every operation must be safe to call on a process that already exited.
pub trait WorkerProcess: Send {
    /// OS process id, if the process is still known to the OS.
    fn pid(&self) -> Option<u32>;

    /// Close the control channel. Workers drain on EOF.
    fn disconnect(&mut self);

    /// Ask the worker to drain and exit (SIGTERM).
    fn terminate(&mut self);

    /// Forcibly terminate the worker (SIGKILL).
    fn kill(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Terminate,
    Kill,
}

/// Handle to a worker subprocess.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    control: mpsc::UnboundedSender<Control>,
}

impl ProcessHandle {
    /// Take ownership of a spawned child and start monitoring it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn monitor(
        id: WorkerId,
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        events: EventSender,
    ) -> Self {
        let pid = child.id();
        let (control, requests) = mpsc::unbounded_channel();
        tokio::spawn(monitor_child(id, child, stdout, requests, events));
        Self {
            pid,
            stdin: Some(stdin),
            control,
        }
    }
}

impl WorkerProcess for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn disconnect(&mut self) {
        // Dropping the pipe closes it.
        self.stdin.take();
    }

    fn terminate(&mut self) {
        // The monitor is gone once the child has been reaped.
        let _ = self.control.send(Control::Terminate);
    }

    fn kill(&mut self) {
        let _ = self.control.send(Control::Kill);
    }
}

/// Forward control messages and signals until the child exits.
async fn monitor_child(
    id: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    mut requests: mpsc::UnboundedReceiver<Control>,
    events: EventSender,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;

    let status = loop {
        tokio::select! {
            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => forward_line(id, &line, &events),
                Ok(None) => stdout_open = false,
                Err(e) => {
                    tracing::debug!(worker_id = %id, error = %e, "Control channel read failed");
                    stdout_open = false;
                }
            },
            Some(request) = requests.recv() => signal_child(id, &mut child, request),
            status = child.wait() => break status,
        }
    };

    // A message written right before exit may still be buffered in the pipe.
    if stdout_open {
        let drain = async {
            while let Ok(Some(line)) = lines.next_line().await {
                forward_line(id, &line, &events);
            }
        };
        let _ = tokio::time::timeout(STDOUT_DRAIN_GRACE, drain).await;
    }

    let reason = match status {
        Ok(status) => TerminationReason::from(status),
        Err(e) => {
            tracing::warn!(worker_id = %id, error = %e, "Failed to wait for worker");
            TerminationReason::Unknown
        }
    };
    let _ = events.send(PoolEvent::Exited { worker: id, reason });
}

fn forward_line(id: WorkerId, line: &str, events: &EventSender) {
    if line.trim().is_empty() {
        return;
    }
    match ControlMessage::from_line(line) {
        Ok(message) => {
            let _ = events.send(PoolEvent::Message { from: id, message });
        }
        Err(e) => {
            tracing::debug!(worker_id = %id, line, error = %e, "Ignoring malformed control message");
        }
    }
}

fn signal_child(id: WorkerId, child: &mut Child, request: Control) {
    match request {
        Control::Terminate => {
            let Some(pid) = child.id() else { return };
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(worker_id = %id, pid, error = %e, "Failed to send SIGTERM");
            }
        }
        Control::Kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(worker_id = %id, error = %e, "Failed to send SIGKILL");
            }
        }
    }
}
