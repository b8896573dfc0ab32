//! HTTP server implementation.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::middleware::{
    admission, request_id, request_logger, AdmissionState, RequestLoggerState,
};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::ratelimit::RateLimiter;

/// Service name reported by the health endpoint.
const SERVICE_NAME: &str = "ratewarden";
/// Budget for the store liveness probe.
const STORE_PING_TIMEOUT: Duration = Duration::from_secs(3);

/// State shared by the route handlers.
#[derive(Clone)]
pub struct AppState {
    limiter: Arc<RateLimiter>,
    environment: String,
}

/// Everything the router needs besides the limiter itself.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub environment: String,
    pub burst: u32,
    pub rate_per_second: f64,
    pub slow_request: Duration,
}

impl RouterSettings {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            environment: config.server.environment.clone(),
            burst: config.rate_limiting.burst,
            rate_per_second: config.rate_limiting.rate_per_second,
            slow_request: config.server.slow_request(),
        }
    }
}

/// Build the application router.
///
/// Middleware runs outermost first: request id, request logger, admission.
pub fn router(limiter: Arc<RateLimiter>, settings: &RouterSettings) -> Router {
    let admission_state =
        AdmissionState::new(limiter.clone(), settings.burst, settings.rate_per_second);
    let logger_state = RequestLoggerState {
        slow_request: settings.slow_request,
    };
    let state = AppState {
        limiter,
        environment: settings.environment.clone(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/ping-store", get(ping_store))
        .with_state(state)
        .layer(from_fn_with_state(admission_state, admission))
        .layer(from_fn_with_state(logger_state, request_logger))
        .layer(from_fn(request_id))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "env": state.environment,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

async fn ping_store(State(state): State<AppState>) -> Response {
    let store = state.limiter.store();
    let outcome = match tokio::time::timeout(STORE_PING_TIMEOUT, store.ping()).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("no answer within {:?}", STORE_PING_TIMEOUT)),
    };

    match outcome {
        Ok(()) => Json(json!({
            "status": "ok",
            "store": store.name(),
        }))
        .into_response(),
        Err(e) => {
            warn!(store = store.name(), error = %e, "Store liveness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "failed",
                    "store": store.name(),
                    "error": e,
                })),
            )
                .into_response()
        }
    }
}

/// HTTP server hosting the admission middleware.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The application router
    router: Router,
    /// Upper bound on draining connections after the shutdown signal
    shutdown_timeout: Duration,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router, shutdown_timeout: Duration) -> Self {
        Self {
            addr,
            router,
            shutdown_timeout,
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// gives in-flight requests up to the shutdown timeout to finish.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server");

        let (stopping_tx, mut stopping_rx) = watch::channel(false);
        let graceful = async move {
            signal.await;
            let _ = stopping_tx.send(true);
        };

        let server = axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful)
        .into_future();
        tokio::pin!(server);

        let shutdown_timeout = self.shutdown_timeout;
        let deadline = async move {
            let stopping = stopping_rx.wait_for(|stopping| *stopping).await.is_ok();
            if !stopping {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = &mut server => result.map_err(|e| {
                error!(error = %e, "HTTP server failed");
                WardenError::Io(e)
            }),
            _ = deadline => {
                warn!(
                    timeout_ms = shutdown_timeout.as_millis() as u64,
                    "HTTP server forced to shut down with requests in flight"
                );
                Ok(())
            }
        }
    }
}
