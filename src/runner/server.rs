//! Runner HTTP server
//!
//! Serves `/tool-call` and `/resource-request` until a termination signal
//! arrives or no connection has been open for the idle timeout.

use std::any::Any;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gram_functions_core::RUNNER_VERSION_HEADER;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{Span, error, info, info_span, warn};

use super::auth::auth_middleware;
use super::bootstrap::Language;
use super::idle::{IdleListener, IdleTracker};
use super::service::{DEFAULT_CALL_TIMEOUT, FunctionService, resource_request, tool_call};
use super::sys;
use crate::encryption::Encryption;
use crate::secret::Secret;
use crate::{Error, Result};

/// Shut down after this long without an open connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period for in-flight calls once shutdown starts.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything `run` needs.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Listen address
    pub listen: SocketAddr,
    /// Language of the initialised work dir
    pub language: Language,
    /// Initialised work dir
    pub work_dir: PathBuf,
    /// Base64 AES-256 key shared with the gateway
    pub auth_secret: Secret<String>,
    /// Idle shutdown
    pub idle_timeout: Duration,
    /// Graceful shutdown window
    pub shutdown_timeout: Duration,
    /// Per-call ceiling
    pub call_timeout: Duration,
}

impl RunnerOptions {
    /// Options with the default timeouts.
    pub fn new(listen: SocketAddr, language: Language, work_dir: PathBuf, auth_secret: Secret<String>) -> Self {
        Self {
            listen,
            language,
            work_dir,
            auth_secret,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Identity fields attached to every log line, read from `GRAM_*` variables.
fn root_span() -> Span {
    let var = |name: &str| std::env::var(name).unwrap_or_default();
    info_span!(
        "runner",
        project_id = %var("GRAM_PROJECT_ID"),
        project_slug = %var("GRAM_PROJECT_SLUG"),
        deployment_id = %var("GRAM_DEPLOYMENT_ID"),
        function_id = %var("GRAM_FUNCTIONS_ID"),
    )
}

/// Build the runner router.
pub fn router(service: Arc<FunctionService>, key: Arc<Encryption>, root: Span) -> Router {
    let calls = Router::new()
        .route("/tool-call", post(tool_call))
        .route("/resource-request", post(resource_request))
        .route_layer(middleware::from_fn_with_state(key, auth_middleware))
        .with_state(service);

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(calls)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(runner_version))
        .layer(TraceLayer::new_for_http().make_span_with(move |req: &Request<Body>| {
            info_span!(
                parent: &root,
                "request",
                method = %req.method(),
                uri = %req.uri(),
            )
        }))
}

async fn runner_version(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        RUNNER_VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    let backtrace = std::backtrace::Backtrace::force_capture();
    error!(panic = message, %backtrace, "recovered from panic in handler");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONNECTION, "close")],
        "Internal Server Error",
    )
        .into_response()
}

/// Serve until terminated or idle.
///
/// # Errors
///
/// Fails when run as root, on a bad key, or when the listener cannot bind.
pub async fn run(options: RunnerOptions) -> Result<()> {
    if sys::is_root() {
        return Err(Error::Config("refusing to run as root".into()));
    }
    let key = Arc::new(Encryption::from_base64(&options.auth_secret)?);

    let program = options.language.program(&options.work_dir);
    let service = Arc::new(
        FunctionService::new(program.clone(), &options.work_dir).with_call_timeout(options.call_timeout),
    );

    let root = root_span();
    let app = router(service, key, root.clone());

    let listener = TcpListener::bind(options.listen).await?;
    let addr = listener.local_addr()?;
    let tracker = IdleTracker::new(options.idle_timeout);
    let listener = IdleListener::new(listener, Arc::clone(&tracker));

    root.in_scope(|| {
        info!("========================================");
        info!("Function runner v{}", env!("CARGO_PKG_VERSION"));
        info!("========================================");
        info!(%addr, "Listening");
        info!(command = %program.command, work_dir = %options.work_dir.display(), "Program");
        info!(idle_timeout = ?options.idle_timeout, call_timeout = ?options.call_timeout, "Limits");
    });

    let cancel = CancellationToken::new();
    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .into_future(),
    );

    let cause = tokio::select! {
        () = terminated() => "terminated",
        () = tracker.done() => "idle server timeout",
        res = &mut server => {
            return match res {
                Ok(res) => res.map_err(Error::Io),
                Err(e) => Err(Error::Internal(format!("server task failed: {e}"))),
            };
        }
    };
    info!(cause, "Shutting down");
    cancel.cancel();

    match tokio::time::timeout(options.shutdown_timeout, &mut server).await {
        Ok(Ok(res)) => res.map_err(Error::Io)?,
        Ok(Err(e)) => return Err(Error::Internal(format!("server task failed: {e}"))),
        Err(_) => {
            warn!(timeout = ?options.shutdown_timeout, "Graceful shutdown timed out");
            server.abort();
        }
    }
    info!("Runner stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn terminated() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let term = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = term => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::bootstrap::Program;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        let program = Program {
            command: "true".into(),
            args: Vec::new(),
        };
        let service = Arc::new(FunctionService::new(program, "/"));
        let key = Arc::new(Encryption::new(&[1u8; 32]).unwrap());
        router(service, key, Span::none())
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let resp = app()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[RUNNER_VERSION_HEADER],
            env!("CARGO_PKG_VERSION")
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn calls_require_a_token() {
        for path in ["/tool-call", "/resource-request"] {
            let resp = app()
                .oneshot(Request::post(path).body(Body::from("{}")).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{path}");
            assert!(resp.headers().contains_key(RUNNER_VERSION_HEADER));
        }
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let resp = app()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn panic_response_closes_connection() {
        let resp = panic_response(Box::new("boom"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers()[header::CONNECTION], "close");
    }

    #[tokio::test]
    async fn idle_runner_stops_on_its_own() {
        let mut options = RunnerOptions::new(
            "127.0.0.1:0".parse().unwrap(),
            Language::Javascript,
            std::env::temp_dir(),
            Secret::new(Encryption::generate_key()),
        );
        options.idle_timeout = Duration::from_millis(100);
        if sys::is_root() {
            assert!(matches!(run(options).await, Err(Error::Config(_))));
            return;
        }
        tokio::time::timeout(Duration::from_secs(5), run(options))
            .await
            .expect("runner did not stop")
            .unwrap();
    }
}
