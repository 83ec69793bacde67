//! Worker process entry point.
//!
//! Runs when the host program is re-executed with `ROTA_WORKER_ID` set. It
//! builds the user's [`Service`], reports readiness to the supervisor, and
//! drains the service on SIGTERM, SIGINT or supervisor disconnect (EOF on
//! stdin). The process exits once the service has closed.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::Instrument;

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{ControlMessage, WorkerId};
use crate::error::{Result, RotaError};
use crate::guard::{Guard, Interceptor};

/// A request-serving service run inside each worker.
pub trait Service: Send + 'static {
    /// Start accepting connections. The worker reports readiness once this
    /// returns.
    fn listen(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Serve until `drain` fires, then stop accepting, finish in-flight
    /// work and return.
    fn serve(self, drain: Drain) -> impl Future<Output = Result<()>> + Send;
}

/// Resolves when the worker should stop accepting new work.
#[derive(Debug, Clone)]
pub struct Drain {
    rx: watch::Receiver<bool>,
}

impl Drain {
    pub async fn wait(mut self) {
        // A dropped trigger also means nobody will keep us serving.
        let _ = self.rx.wait_for(|draining| *draining).await;
    }

    pub fn is_draining(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Fires a [`Drain`].
#[derive(Debug)]
pub struct DrainTrigger {
    tx: watch::Sender<bool>,
}

impl DrainTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

pub fn drain_channel() -> (DrainTrigger, Drain) {
    let (tx, rx) = watch::channel(false);
    (DrainTrigger { tx }, Drain { rx })
}

/// Writes control messages to the supervisor.
#[derive(Clone)]
pub struct Reporter {
    worker_id: WorkerId,
    writer: Arc<Mutex<LineWriter>>,
}

impl Reporter {
    pub fn new(worker_id: WorkerId, channel: PipeFd) -> Self {
        Self {
            worker_id,
            writer: Arc::new(Mutex::new(LineWriter::new(channel))),
        }
    }

    /// Reporter on this process's stdout.
    pub(crate) fn stdout(worker_id: WorkerId) -> io::Result<Self> {
        Ok(Self::new(worker_id, PipeFd::stdout()?))
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn listening(&self) -> Result<()> {
        self.send(&ControlMessage::listening(self.worker_id))
    }

    pub fn request_replacement(&self, reason: &str) -> Result<()> {
        self.send(&ControlMessage::request_replacement(self.worker_id, reason))
    }

    fn send(&self, message: &ControlMessage) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| RotaError::Worker("control channel lock poisoned".into()))?;
        writer.write_line(&message.to_line())?;
        Ok(())
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// What a service factory gets to build its worker's service.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker_id: WorkerId,
    reporter: Reporter,
}

impl WorkerContext {
    pub fn new(worker_id: WorkerId, reporter: Reporter) -> Self {
        Self {
            worker_id,
            reporter,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Attach a guard reporting through this worker's control channel.
    pub fn guard<G: Guard>(&self, guard: G) -> Arc<Interceptor<G>> {
        Arc::new(Interceptor::new(guard, self.reporter.clone()))
    }
}

/// Run the worker side of the pool until the service has drained.
pub async fn run_worker<F, S>(worker_id: WorkerId, factory: F) -> Result<()>
where
    F: FnOnce(WorkerContext) -> Result<S>,
    S: Service,
{
    let stop = stop_signals()?;
    let ctx = WorkerContext::new(worker_id, Reporter::stdout(worker_id)?);
    let span = tracing::info_span!("worker", worker_id = %worker_id, pid = std::process::id());
    drive(ctx, factory, stop).instrument(span).await
}

/// Resolves on SIGTERM, SIGINT, or EOF on stdin.
fn stop_signals() -> io::Result<impl Future<Output = ()> + Send + 'static> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut control = LineReader::new(PipeFd::stdin()?);
    let disconnected = tokio::task::spawn_blocking(move || {
        if let Err(e) = control.wait_for_eof() {
            tracing::debug!(error = %e, "Control channel read failed");
        }
    });

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, draining"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, draining"),
            _ = disconnected => tracing::info!("Supervisor disconnected, draining"),
        }
    })
}

async fn drive<F, S, T>(ctx: WorkerContext, factory: F, stop: T) -> Result<()>
where
    F: FnOnce(WorkerContext) -> Result<S>,
    S: Service,
    T: Future<Output = ()> + Send + 'static,
{
    let reporter = ctx.reporter().clone();
    let mut service = factory(ctx)?;

    service.listen().await?;
    reporter.listening()?;
    tracing::info!("Reported readiness to supervisor");

    let (trigger, drain) = drain_channel();
    tokio::spawn(async move {
        stop.await;
        trigger.trigger();
    });

    service.serve(drain).await?;
    tracing::info!("Worker drained");
    Ok(())
}
