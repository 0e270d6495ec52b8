use crate::url::parser::is_browser_application;
use crate::url::store::UrlStore;
use crate::util::http::serve_blocking;
use crate::util::threading::{spawn_worker, WorkerHandle};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct UrlUpdateRequest {
    #[serde(default)]
    application: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    timestamp: i64,
}

/// Loopback HTTP endpoint the browser extension posts page URLs to.
pub struct UrlIngressServer {
    addr: SocketAddr,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl UrlIngressServer {
    pub fn spawn(store: Arc<UrlStore>, port: u16) -> Result<Self> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("failed to bind URL ingress on 127.0.0.1:{port}"))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = spawn_worker("url-ingress", move || {
            serve_blocking(listener, router(store), shutdown_rx)
        })?;

        info!("URL ingress listening on {addr}");
        Ok(Self {
            addr,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Idempotent.
    pub fn stop(&self) {
        let Some(shutdown_tx) = self
            .shutdown_tx
            .lock()
            .expect("ingress shutdown lock poisoned")
            .take()
        else {
            return;
        };
        let _ = shutdown_tx.send(());

        if let Some(worker) = self
            .worker
            .lock()
            .expect("ingress worker lock poisoned")
            .take()
        {
            if !worker.join_timeout(SHUTDOWN_TIMEOUT) {
                warn!("URL ingress did not stop within {SHUTDOWN_TIMEOUT:?}");
            }
        }
        info!("URL ingress stopped");
    }
}

pub(crate) fn router(store: Arc<UrlStore>) -> Router {
    Router::new()
        .route("/api/v1/url-update", post(handle_url_update))
        .route("/api/v1/health", get(handle_health))
        .layer(middleware::from_fn(cors))
        .with_state(store)
}

/// Applies extension-friendly CORS headers to every response and answers
/// preflight requests for any path.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("3600"),
    );
    response
}

async fn handle_url_update(State(store): State<Arc<UrlStore>>, body: Bytes) -> Response {
    let request: UrlUpdateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Failed to decode URL update request: {e}");
            return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
        }
    };

    if request.application.is_empty() || request.url.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing required fields").into_response();
    }

    // Only browsers may feed the store.
    if !is_browser_application(&request.application) {
        warn!(
            "Rejected URL update from non-browser application: {}",
            request.application
        );
        return (StatusCode::BAD_REQUEST, "Invalid application").into_response();
    }

    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        warn!("Rejected invalid URL format: {}", request.url);
        return (StatusCode::BAD_REQUEST, "Invalid URL format").into_response();
    }

    store.store(&request.application, &request.title, &request.url);
    info!(
        "URL update received: application={} title={} url={} timestamp={}",
        request.application, request.title, request.url, request.timestamp
    );

    Json(json!({ "status": "ok" })).into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().timestamp() }))
}
