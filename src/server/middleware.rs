//! Guard middleware for axum routers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
};

use crate::guard::{Guard, Interceptor};

/// Middleware that records every request with a guard's interceptor.
///
/// The request is always forwarded; the guard only observes it.
///
/// # Example
///
/// ```ignore
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(middleware::from_fn_with_state(interceptor, guard_middleware::<RequestCount>));
/// ```
pub async fn guard_middleware<G: Guard>(
    State(interceptor): State<Arc<Interceptor<G>>>,
    request: Request,
    next: Next,
) -> Response {
    interceptor.intercept(next.run(request)).await
}

/// Attach `interceptor` to every route of `router`.
pub fn with_guard<G: Guard>(router: Router, interceptor: Arc<Interceptor<G>>) -> Router {
    router.layer(middleware::from_fn_with_state(
        interceptor,
        guard_middleware::<G>,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{MemoryFootprint, RequestCount};
    use crate::worker::ipc::{LineReader, pipe};
    use crate::worker::{ControlMessage, Reporter, WorkerId};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
    };
    use tower::ServiceExt;

    async fn echo_handler() -> &'static str {
        "ok"
    }

    fn test_app<G: Guard>(interceptor: Arc<Interceptor<G>>) -> Router {
        with_guard(Router::new().route("/", get(echo_handler)), interceptor)
    }

    async fn send(app: &Router) -> StatusCode {
        app.clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_requests_pass_through_and_signal_once() {
        let (read_fd, write_fd) = pipe();
        let interceptor = Arc::new(Interceptor::new(
            RequestCount::new(2),
            Reporter::new(WorkerId::new(3), write_fd),
        ));
        let app = test_app(interceptor.clone());

        for _ in 0..5 {
            assert_eq!(send(&app).await, StatusCode::OK);
        }
        assert_eq!(interceptor.guard().count(), 5);
        drop(app);
        drop(interceptor);

        let mut reader = LineReader::new(read_fd);
        let line = reader.read_line().unwrap().unwrap().to_string();
        assert_eq!(
            ControlMessage::from_line(&line).unwrap(),
            ControlMessage::request_replacement(
                WorkerId::new(3),
                "Request count limit of 2 reached!"
            )
        );
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_guard_is_transparent() {
        let (_read_fd, write_fd) = pipe();
        let interceptor = Arc::new(Interceptor::new(
            MemoryFootprint::with_probe(1, || None),
            Reporter::new(WorkerId::new(1), write_fd),
        ));
        assert_eq!(send(&test_app(interceptor.clone())).await, StatusCode::OK);
        assert!(!interceptor.has_signaled());
    }
}
