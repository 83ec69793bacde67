//! Supervised worker processes.
//!
//! The supervisor keeps a fixed number of worker processes serving, replaces
//! workers that ask to be retired, and respawns workers that crash.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │    Supervisor    │
//!                     │  (event loop)    │
//!                     └────────┬─────────┘
//!                stdin (EOF = disconnect) ▼ ▲ stdout (JSON lines)
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │  Service  │  │  Service  │  │  Service  │
//!         │  + guards │  │  + guards │  │  + guards │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Rotation
//!
//! 1. A guard inside worker A crosses its threshold and sends
//!    `request-replacement`.
//! 2. The supervisor spawns worker B as A's successor.
//! 3. B reports `listening`.
//! 4. The supervisor closes A's stdin, sends SIGTERM and arms a kill
//!    deadline. A drains and exits, or is killed when the deadline fires.

pub mod ipc;
mod pool;
mod proc;
mod protocol;
mod signals;
mod spawn;
mod worker_main;

pub use pool::{
    EventSender, PoolEvent, PoolStats, ShutdownHandle, Supervisor, WorkerInfo, WorkerState,
};
pub use proc::{ProcessHandle, WorkerProcess};
pub use protocol::{ControlMessage, WORKER_ID_ENV, WorkerId};
pub use signals::TerminationReason;
pub use spawn::{Launcher, ProcessLauncher};
pub use worker_main::{
    Drain, DrainTrigger, Reporter, Service, WorkerContext, drain_channel, run_worker,
};
