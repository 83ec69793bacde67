//! worker-rota: a pre-fork worker pool supervisor.
//!
//! A host program calls [`run`] with a pool configuration and a service
//! factory. The same program runs in two roles:
//!
//! - **Supervisor** (normal start): forks `worker_count` copies of itself,
//!   respawns crashed workers, rotates workers whose guards ask to be
//!   replaced, and shuts the pool down on SIGTERM/SIGINT.
//! - **Worker** (`ROTA_WORKER_ID` set): builds the service with the factory,
//!   serves until told to drain, and exits.
//!
//! Workers never drop below `worker_count - 1` serving processes during a
//! rotation: the successor must report `listening` before its predecessor
//! is retired, and a retired worker that does not exit within the graceful
//! kill deadline is killed.

pub mod config;
pub mod error;
pub mod guard;
pub mod logging;
pub mod memory;
pub mod server;
pub mod worker;

pub use config::PoolConfig;
pub use error::{Result, RotaError};
pub use worker::{
    Drain, PoolStats, Reporter, Service, Supervisor, WorkerContext, WorkerId, run_worker,
};

use worker::ProcessLauncher;

/// Run a worker pool, or be one of its workers.
///
/// In the supervisor process this returns once the pool has shut down. In a
/// worker process it never returns: the process exits when the service has
/// drained (status 0) or failed (status 1).
pub async fn run<F, S>(config: PoolConfig, factory: F) -> Result<PoolStats>
where
    F: FnOnce(WorkerContext) -> Result<S>,
    S: Service,
{
    if let Some(worker_id) = WorkerId::from_env()? {
        let code = match run_worker(worker_id, factory).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "Worker failed");
                1
            }
        };
        std::process::exit(code);
    }

    let supervisor = Supervisor::new(config, ProcessLauncher::current_exe()?)?;
    supervisor.run().await
}
