//! The supervisor: owns the worker pool and its lifecycle state machine.
//!
//! All state transitions happen in [`Supervisor::handle`], one event at a
//! time, on a single task. Process monitors, kill-deadline timers, spawn
//! retries and shutdown requests only ever *send* [`PoolEvent`]s.
//!
//! Per-worker lifecycle:
//!
//! ```text
//! Spawning ──► Listening ──► Running ──► Draining ──► Terminated
//!     │            │            │
//!     └────────────┴────────────┴──────► Crashed (exit without disconnect)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::proc::WorkerProcess;
use super::protocol::{ControlMessage, WorkerId};
use super::signals::TerminationReason;
use super::spawn::Launcher;
use crate::config::PoolConfig;
use crate::error::{Result, RotaError};

/// Sending half of the supervisor's event channel.
pub type EventSender = mpsc::UnboundedSender<PoolEvent>;

/// Everything the supervisor reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A control message arrived on worker `from`'s channel.
    Message {
        from: WorkerId,
        message: ControlMessage,
    },
    /// Worker process exited and has been reaped.
    Exited {
        worker: WorkerId,
        reason: TerminationReason,
    },
    /// A retired worker's graceful-kill deadline expired.
    KillDeadline { worker: WorkerId },
    /// Retry a failed spawn.
    RetrySpawn {
        predecessor: Option<WorkerId>,
        attempt: u32,
    },
    /// Shut the whole pool down.
    Shutdown,
}

/// Lifecycle state of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Listening,
    Running,
    Draining,
    Terminated,
    Crashed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spawning => "spawning",
            Self::Listening => "listening",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Running,
    ShuttingDown,
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker processes started.
    pub spawned: u64,
    /// Workers that exited without being retired.
    pub crashes: u64,
    /// Completed rotations (successor listening, predecessor retired).
    pub replacements: u64,
    /// Workers sent a graceful stop.
    pub retired: u64,
    /// Workers that missed their deadline and were killed.
    pub forced_kills: u64,
}

/// Snapshot of one worker, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
    /// Worker this one will replace once it is listening.
    pub predecessor: Option<WorkerId>,
    /// Worker started to replace this one.
    pub successor: Option<WorkerId>,
}

struct WorkerRecord {
    id: WorkerId,
    process: Box<dyn WorkerProcess>,
    state: WorkerState,
    /// Set once the supervisor closed the control channel; an exit after
    /// this point is a retirement, not a crash.
    disconnected: bool,
    kill_timer: Option<AbortHandle>,
    predecessor: Option<WorkerId>,
    successor: Option<WorkerId>,
    /// A successor is running or a spawn for one is pending.
    replacement_requested: bool,
}

impl WorkerRecord {
    fn new(id: WorkerId, process: Box<dyn WorkerProcess>, predecessor: Option<WorkerId>) -> Self {
        Self {
            id,
            process,
            state: WorkerState::Spawning,
            disconnected: false,
            kill_timer: None,
            predecessor,
            successor: None,
            replacement_requested: false,
        }
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            pid: self.process.pid(),
            state: self.state,
            predecessor: self.predecessor,
            successor: self.successor,
        }
    }
}

/// Requests a pool shutdown from outside the event loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(EventSender);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(PoolEvent::Shutdown);
    }
}

/// Keeps `worker_count` workers serving, rotating and respawning them.
pub struct Supervisor<L: Launcher> {
    config: PoolConfig,
    launcher: L,
    state: PoolState,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    next_id: u64,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    stats: PoolStats,
    fatal: Option<RotaError>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(config: PoolConfig, launcher: L) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            launcher,
            state: PoolState::Running,
            workers: BTreeMap::new(),
            next_id: 1,
            events_tx,
            events_rx,
            stats: PoolStats::default(),
            fatal: None,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn is_running(&self) -> bool {
        self.state == PoolState::Running
    }

    /// All tracked workers, ordered by id.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers.values().map(WorkerRecord::info).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.events_tx.clone())
    }

    /// Start the configured number of workers.
    pub fn start(&mut self) {
        tracing::info!(
            workers = self.config.worker_count,
            kill_deadline_ms = self.config.kill_deadline.as_millis() as u64,
            "Starting worker pool"
        );
        self.fork(self.config.worker_count);
    }

    /// Spawn `n` independent workers.
    pub fn fork(&mut self, n: usize) {
        for _ in 0..n {
            self.spawn(None);
        }
    }

    /// Spawn one worker, optionally as the successor of `predecessor`.
    ///
    /// Failures are retried through the event loop; see [`PoolConfig::spawn_attempts`].
    pub fn spawn(&mut self, predecessor: Option<WorkerId>) -> Option<WorkerId> {
        self.spawn_attempt(predecessor, 1)
    }

    fn spawn_attempt(&mut self, predecessor: Option<WorkerId>, attempt: u32) -> Option<WorkerId> {
        let id = WorkerId::new(self.next_id);
        self.next_id += 1;

        match self.launcher.launch(id, self.events_tx.clone()) {
            Ok(process) => {
                tracing::info!(worker_id = %id, pid = ?process.pid(), predecessor = ?predecessor.map(|p| p.get()), "Spawned worker");
                self.stats.spawned += 1;
                if let Some(record) = predecessor.and_then(|p| self.workers.get_mut(&p)) {
                    record.successor = Some(id);
                }
                self.workers
                    .insert(id, WorkerRecord::new(id, process, predecessor));
                Some(id)
            }
            Err(e) if attempt < self.config.spawn_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts = self.config.spawn_attempts,
                    error = %e,
                    "Failed to spawn worker, retrying"
                );
                self.schedule(
                    self.config.spawn_retry_backoff,
                    PoolEvent::RetrySpawn {
                        predecessor,
                        attempt: attempt + 1,
                    },
                );
                None
            }
            Err(e) => {
                tracing::error!(attempts = attempt, error = %e, "Failed to spawn worker, shutting down pool");
                if self.fatal.is_none() {
                    self.fatal = Some(RotaError::Spawn {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                self.shutdown();
                None
            }
        }
    }

    /// Deliver `event` after `delay` without blocking the loop.
    fn schedule(&self, delay: Duration, event: PoolEvent) -> AbortHandle {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        })
        .abort_handle()
    }

    /// Gracefully stop a worker, killing it if it outlives the deadline.
    ///
    /// Idempotent: retiring a draining or unknown worker does nothing.
    pub fn retire(&mut self, id: WorkerId) {
        let deadline = self.config.kill_deadline;
        let Some(record) = self.workers.get_mut(&id) else {
            return;
        };
        if record.state == WorkerState::Draining {
            return;
        }

        tracing::info!(worker_id = %id, pid = ?record.process.pid(), "Retiring worker");
        record.state = WorkerState::Draining;
        record.disconnected = true;
        record.process.disconnect();
        record.process.terminate();
        self.stats.retired += 1;

        let timer = self.schedule(deadline, PoolEvent::KillDeadline { worker: id });
        if let Some(record) = self.workers.get_mut(&id) {
            record.kill_timer = Some(timer);
        }
    }

    /// Stop reacting to crashes and replacement requests, and retire every worker.
    pub fn shutdown(&mut self) {
        if self.state == PoolState::ShuttingDown {
            return;
        }
        self.state = PoolState::ShuttingDown;
        tracing::info!(workers = self.workers.len(), "Shutting down worker pool");

        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            self.retire(id);
        }
    }

    /// Apply a single event to the pool.
    pub fn handle(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Message { from, message } => self.on_message(from, message),
            PoolEvent::Exited { worker, reason } => self.on_exit(worker, reason),
            PoolEvent::KillDeadline { worker } => self.on_kill_deadline(worker),
            PoolEvent::RetrySpawn {
                predecessor,
                attempt,
            } => self.on_retry_spawn(predecessor, attempt),
            PoolEvent::Shutdown => self.shutdown(),
        }
    }

    fn on_message(&mut self, from: WorkerId, message: ControlMessage) {
        if message.worker_id() != from {
            tracing::debug!(
                worker_id = %from,
                claimed = %message.worker_id(),
                "Ignoring control message with mismatched worker id"
            );
            return;
        }
        match message {
            ControlMessage::Listening { .. } => self.on_listening(from),
            ControlMessage::RequestReplacement { reason, .. } => {
                self.on_replacement_request(from, &reason)
            }
        }
    }

    fn on_listening(&mut self, id: WorkerId) {
        if !self.is_running() {
            tracing::debug!(worker_id = %id, "Ignoring readiness during shutdown");
            return;
        }
        let Some(record) = self.workers.get_mut(&id) else {
            return;
        };
        if record.state != WorkerState::Spawning {
            return;
        }
        record.state = WorkerState::Listening;
        tracing::info!(worker_id = %id, pid = ?record.process.pid(), "Worker listening");

        let predecessor = record.predecessor.take();
        record.state = WorkerState::Running;

        if let Some(old) = predecessor
            && self.workers.contains_key(&old)
        {
            tracing::info!("Replacing worker {} with worker {}", old, id);
            self.stats.replacements += 1;
            self.retire(old);
        }
    }

    fn on_replacement_request(&mut self, id: WorkerId, reason: &str) {
        if !self.is_running() {
            tracing::debug!(worker_id = %id, "Ignoring replacement request during shutdown");
            return;
        }
        let Some(record) = self.workers.get_mut(&id) else {
            return;
        };
        if record.state == WorkerState::Draining || record.replacement_requested {
            tracing::debug!(worker_id = %id, "Ignoring duplicate replacement request");
            return;
        }
        record.replacement_requested = true;
        tracing::info!(worker_id = %id, reason, "Worker requested replacement");

        if let Some(successor) = self.spawn(Some(id)) {
            tracing::info!(
                worker_id = %id,
                successor = %successor,
                "Waiting for successor to listen"
            );
        }
    }

    fn on_kill_deadline(&mut self, id: WorkerId) {
        // Runs during shutdown too: retired workers must still die.
        let Some(record) = self.workers.get_mut(&id) else {
            return;
        };
        tracing::warn!(
            worker_id = %id,
            pid = ?record.process.pid(),
            deadline_ms = self.config.kill_deadline.as_millis() as u64,
            "Ensured death of worker {}",
            id
        );
        record.kill_timer = None;
        record.process.kill();
        self.stats.forced_kills += 1;
    }

    fn on_exit(&mut self, id: WorkerId, reason: TerminationReason) {
        let Some(mut record) = self.workers.remove(&id) else {
            return;
        };
        if let Some(timer) = record.kill_timer.take() {
            timer.abort();
        }

        if record.disconnected {
            record.state = WorkerState::Terminated;
            tracing::info!(
                worker_id = %id,
                reason = %reason,
                clean = reason.is_success(),
                "Worker terminated"
            );
            return;
        }

        record.state = WorkerState::Crashed;
        self.stats.crashes += 1;
        tracing::warn!(worker_id = %id, reason = %reason, "Worker crashed");

        if !self.is_running() {
            return;
        }

        // A successor (running or pending) already fills this slot.
        if record.replacement_requested {
            if let Some(successor) = record.successor.and_then(|s| self.workers.get_mut(&s)) {
                successor.predecessor = None;
            }
            tracing::info!(worker_id = %id, "Successor takes over crashed worker's slot");
            return;
        }

        // A successor that died before listening passes the role on.
        let predecessor = record.predecessor.filter(|p| self.workers.contains_key(p));
        tracing::info!(worker_id = %id, "Respawning worker");
        self.spawn(predecessor);
    }

    fn on_retry_spawn(&mut self, predecessor: Option<WorkerId>, attempt: u32) {
        if !self.is_running() {
            return;
        }
        let predecessor = predecessor.filter(|p| self.workers.contains_key(p));
        self.spawn_attempt(predecessor, attempt);
    }

    /// True once shutdown has begun and every worker has exited.
    pub fn is_finished(&self) -> bool {
        self.state == PoolState::ShuttingDown && self.workers.is_empty()
    }

    /// Run the pool until SIGTERM or SIGINT, then shut it down.
    pub async fn run(self) -> Result<PoolStats> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let host_signal = async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = sigint.recv() => tracing::info!("Received SIGINT"),
            }
        };
        self.run_until(host_signal).await
    }

    /// Run the pool until `stop` completes, then shut it down.
    ///
    /// Returns the final statistics, or the error that forced the pool down.
    pub async fn run_until<F>(mut self, stop: F) -> Result<PoolStats>
    where
        F: Future<Output = ()>,
    {
        self.start();
        tokio::pin!(stop);
        let mut stopped = false;

        while !self.is_finished() {
            let event = tokio::select! {
                _ = &mut stop, if !stopped => {
                    stopped = true;
                    PoolEvent::Shutdown
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event);
        }

        let stats = self.stats;
        tracing::info!(
            spawned = stats.spawned,
            crashes = stats.crashes,
            replacements = stats.replacements,
            retired = stats.retired,
            forced_kills = stats.forced_kills,
            "Worker pool stopped"
        );

        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}
