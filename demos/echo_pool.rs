//! echo-pool: a small HTTP worker pool built on worker-rota.
//!
//! Every worker answers `GET /` with its worker id and pid, so rotation and
//! respawning are visible from the outside. `GET /crash` aborts the worker
//! that serves it.
//!
//! ```bash
//! echo-pool --addr 127.0.0.1:3000 --workers 4 --max-requests 100 --max-rss 512M
//! curl http://127.0.0.1:3000/
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, extract::State, routing::get};
use clap::Parser;
use worker_rota::{
    PoolConfig, WorkerContext, WorkerId,
    guard::{MemoryFootprint, RequestCount},
    logging::{self, LogConfig},
    memory::MemorySize,
    server::{HttpService, with_guard},
};

/// Pre-fork HTTP echo server with worker rotation.
#[derive(Parser, Debug, Clone)]
#[command(name = "echo-pool")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address every worker listens on.
    #[arg(long, env = "ECHO_POOL_ADDR", default_value = "127.0.0.1:3000")]
    addr: SocketAddr,

    /// Number of workers (default: one per CPU, or ROTA_WORKERS).
    #[arg(long)]
    workers: Option<usize>,

    /// Replace a worker after it has served this many requests.
    #[arg(long)]
    max_requests: Option<u64>,

    /// Replace a worker once its resident memory reaches this size (e.g. 512M, 1G).
    #[arg(long)]
    max_rss: Option<MemorySize>,

    /// How long a retired worker may drain before it is killed.
    #[arg(long)]
    kill_deadline_ms: Option<u64>,
}

impl Args {
    fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::default().with_env_overrides();
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if let Some(ms) = self.kill_deadline_ms {
            config = config.with_kill_deadline(Duration::from_millis(ms));
        }
        config
    }

    fn router(&self, ctx: &WorkerContext) -> Router {
        let mut router = Router::new()
            .route("/", get(echo))
            .route("/crash", get(crash))
            .with_state(ctx.worker_id());

        if let Some(max) = self.max_requests {
            router = with_guard(router, ctx.guard(RequestCount::new(max)));
        }
        if let Some(max) = self.max_rss {
            router = with_guard(router, ctx.guard(MemoryFootprint::new(max.as_mib())));
        }
        router
    }
}

async fn echo(State(worker_id): State<WorkerId>) -> String {
    format!("worker {} pid {}\n", worker_id, std::process::id())
}

async fn crash() -> &'static str {
    std::process::abort()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(LogConfig::default().with_env_overrides());

    let config = args.pool_config();
    let stats = worker_rota::run(config, move |ctx| {
        Ok(HttpService::new(args.addr, args.router(&ctx)))
    })
    .await
    .context("worker pool failed")?;

    tracing::info!(
        spawned = stats.spawned,
        crashes = stats.crashes,
        replacements = stats.replacements,
        "echo-pool exited"
    );
    Ok(())
}
