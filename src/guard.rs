//! Request guards: decide when a worker should ask to be replaced.
//!
//! A [`Guard`] takes a reading when a request is intercepted; once the
//! request completes, an [`Interceptor`] compares that reading against the
//! guard's limit and sends one `request-replacement` message the first time
//! the limit is reached. A request that never completes is still counted.
//! Interceptors never delay or reject a request.
//!
//! ```no_run
//! use worker_rota::guard::RequestCount;
//! # fn demo(ctx: worker_rota::WorkerContext) {
//! let interceptor = ctx.guard(RequestCount::new(1000));
//! let body = interceptor.observe(|| "handled");
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::memory::{MemorySize, resident_set_size};
use crate::worker::Reporter;

/// A per-worker threshold on some observed quantity.
pub trait Guard: Send + Sync + 'static {
    /// Account for a request as it enters and return the reading to check
    /// once it completes.
    fn enter(&self) -> u64;

    /// Reading at which the worker should be replaced.
    fn limit(&self) -> u64;

    /// Reason sent to the supervisor.
    fn reason(&self) -> String;
}

/// Replace the worker after `max_requests` requests.
#[derive(Debug)]
pub struct RequestCount {
    max_requests: u64,
    count: AtomicU64,
}

impl RequestCount {
    pub fn new(max_requests: u64) -> Self {
        Self {
            max_requests,
            count: AtomicU64::new(0),
        }
    }

    /// Requests observed so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Guard for RequestCount {
    fn enter(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn limit(&self) -> u64 {
        self.max_requests
    }

    fn reason(&self) -> String {
        format!("Request count limit of {} reached!", self.max_requests)
    }
}

type Probe = Box<dyn Fn() -> Option<MemorySize> + Send + Sync>;

/// Replace the worker once its resident memory reaches `max_rss_mb` MiB.
pub struct MemoryFootprint {
    max_rss_mb: u64,
    probe: Probe,
}

impl MemoryFootprint {
    pub fn new(max_rss_mb: u64) -> Self {
        Self::with_probe(max_rss_mb, resident_set_size)
    }

    /// Use a custom memory probe instead of this process's RSS.
    pub fn with_probe<P>(max_rss_mb: u64, probe: P) -> Self
    where
        P: Fn() -> Option<MemorySize> + Send + Sync + 'static,
    {
        Self {
            max_rss_mb,
            probe: Box::new(probe),
        }
    }
}

impl std::fmt::Debug for MemoryFootprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFootprint")
            .field("max_rss_mb", &self.max_rss_mb)
            .finish_non_exhaustive()
    }
}

impl Guard for MemoryFootprint {
    fn enter(&self) -> u64 {
        // An unreadable RSS never trips the guard.
        (self.probe)().map(|rss| rss.as_mib()).unwrap_or(0)
    }

    fn limit(&self) -> u64 {
        self.max_rss_mb
    }

    fn reason(&self) -> String {
        format!("Memory footprint limit of {} reached!", self.max_rss_mb)
    }
}

/// Attaches a guard to a worker's request path.
#[derive(Debug)]
pub struct Interceptor<G> {
    guard: G,
    signaled: AtomicBool,
    reporter: Reporter,
}

impl<G: Guard> Interceptor<G> {
    pub fn new(guard: G, reporter: Reporter) -> Self {
        Self {
            guard,
            signaled: AtomicBool::new(false),
            reporter,
        }
    }

    pub fn guard(&self) -> &G {
        &self.guard
    }

    /// Whether this interceptor has already asked for a replacement.
    pub fn has_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Check the reading taken when a request entered, after it completed.
    fn settle(&self, reading: u64) {
        if reading < self.guard.limit() {
            return;
        }
        // The flag flips exactly once, so concurrent requests crossing the
        // limit together still produce a single message.
        if self.signaled.swap(true, Ordering::AcqRel) {
            return;
        }

        let reason = self.guard.reason();
        match self.reporter.request_replacement(&reason) {
            Ok(()) => tracing::info!(reading, limit = self.guard.limit(), %reason, "Requested replacement"),
            Err(e) => tracing::warn!(error = %e, %reason, "Failed to request replacement"),
        }
    }

    /// Run a synchronous request handler under the guard.
    pub fn observe<T>(&self, handler: impl FnOnce() -> T) -> T {
        let reading = self.guard.enter();
        let output = handler();
        self.settle(reading);
        output
    }

    /// Await an asynchronous request under the guard.
    ///
    /// The request is accounted for as soon as this future is first polled;
    /// the limit is checked only if the request runs to completion.
    pub async fn intercept<F: Future>(&self, request: F) -> F::Output {
        let reading = self.guard.enter();
        let output = request.await;
        self.settle(reading);
        output
    }
}
