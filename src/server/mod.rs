//! HTTP service adapter.
//!
//! Runs an [`axum::Router`] as a pool [`Service`]. Every worker binds the
//! same address with `SO_REUSEPORT`, so the kernel spreads connections over
//! all listening workers and a successor can start accepting before its
//! predecessor stops.
//!
//! # Example
//!
//! ```no_run
//! use axum::{Router, routing::get};
//! use worker_rota::{PoolConfig, guard::RequestCount, server::{HttpService, with_guard}};
//!
//! #[tokio::main]
//! async fn main() -> worker_rota::Result<()> {
//!     let addr = "127.0.0.1:3000".parse().unwrap();
//!     worker_rota::run(PoolConfig::default(), move |ctx| {
//!         let router = Router::new().route("/", get(|| async { "ok" }));
//!         let router = with_guard(router, ctx.guard(RequestCount::new(1000)));
//!         Ok(HttpService::new(addr, router))
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod middleware;

pub use middleware::{guard_middleware, with_guard};

use std::io;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::{TcpListener, TcpSocket};

use crate::error::Result;
use crate::worker::{Drain, Service};

/// Connection backlog for the shared listener.
const LISTEN_BACKLOG: u32 = 1024;

/// Serves an axum router inside a worker.
pub struct HttpService {
    addr: SocketAddr,
    router: Router,
    listener: Option<TcpListener>,
}

impl HttpService {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self {
            addr,
            router,
            listener: None,
        }
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

/// Bind `addr` so that several processes can listen on it at once.
fn bind_shared(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

impl Service for HttpService {
    async fn listen(&mut self) -> Result<()> {
        let listener = bind_shared(self.addr)?;
        tracing::info!(addr = %listener.local_addr()?, "HTTP service listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn serve(self, drain: Drain) -> Result<()> {
        let listener = match self.listener {
            Some(listener) => listener,
            None => bind_shared(self.addr)?,
        };
        axum::serve(listener, self.router)
            .with_graceful_shutdown(drain.wait())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::drain_channel;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn router() -> Router {
        Router::new().route("/", get(|| async { "hello" }))
    }

    async fn get_root(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_until_drained() {
        let mut service = HttpService::new("127.0.0.1:0".parse().unwrap(), router());
        service.listen().await.unwrap();
        let addr = service.local_addr().unwrap();

        let (trigger, drain) = drain_channel();
        let server = tokio::spawn(service.serve(drain));

        let response = get_root(addr).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello"));

        trigger.trigger();
        server.await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_two_services_share_a_port() {
        let mut first = HttpService::new("127.0.0.1:0".parse().unwrap(), router());
        first.listen().await.unwrap();
        let addr = first.local_addr().unwrap();

        let mut second = HttpService::new(addr, router());
        second.listen().await.unwrap();
        assert_eq!(second.local_addr(), Some(addr));
    }
}
