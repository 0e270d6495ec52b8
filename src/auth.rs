use crate::platform::Platform;
use crate::util::http::serve_blocking;
use crate::util::threading::{spawn_worker, WorkerHandle};
use anyhow::{anyhow, Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(120);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

const SUCCESS_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>Device Registration</title></head>\n<body>\n<h1>Device registered successfully</h1>\n<p>Your device has been registered and authorised. You can close this window.</p>\n</body>\n</html>";

const ERROR_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>Device Registration Error</title></head>\n<body>\n<h1>Registration failed</h1>\n<p>{reason}</p>\n<p>Please try again.</p>\n</body>\n</html>";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub device_id: String,
    /// Seconds until the token expires.
    pub expires_in: i64,
}

/// Browser-based device authorisation: open the backend's authorize page,
/// catch the code on a loopback callback, trade it for a device token.
pub struct DeviceAuthFlow {
    platform: Arc<dyn Platform>,
    callback_port: u16,
    base_url: String,
}

impl DeviceAuthFlow {
    pub fn new(platform: Arc<dyn Platform>, callback_port: u16, base_url: impl Into<String>) -> Self {
        Self {
            platform,
            callback_port,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Run the authorisation round trip and return the one-time code.
    pub fn authorize_device(&self, device_id: &str, device_name: &str) -> Result<String> {
        let redirect_uri = format!("http://localhost:{}/callback", self.callback_port);
        let mut auth_url =
            reqwest::Url::parse(&format!("{}/auth/device/authorize", self.base_url))
                .context("invalid backend base URL")?;
        auth_url
            .query_pairs_mut()
            .append_pair("deviceId", device_id)
            .append_pair("redirectUri", &redirect_uri);
        if !device_name.is_empty() {
            auth_url.query_pairs_mut().append_pair("deviceName", device_name);
        }

        info!("Starting device authorization: device_id={device_id} auth_url={auth_url}");

        let server = CallbackServer::spawn(self.callback_port)?;

        info!("Opening browser for authorization");
        if let Err(e) = self.platform.open_browser(auth_url.as_str()) {
            server.stop();
            return Err(anyhow!("failed to open browser: {e}"));
        }

        let result = server.wait_for_code(AUTHORIZATION_TIMEOUT);
        server.stop();
        result
    }

    /// Exchange the authorization code for a device token.
    pub fn exchange_code(&self, code: &str, device_id: &str) -> Result<TokenResponse> {
        let http = reqwest::blocking::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let response = http
            .post(format!("{}/auth/device/token", self.base_url))
            .json(&json!({ "code": code, "deviceId": device_id }))
            .send()
            .context("token exchange request failed")?;

        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        if status != 200 && status != 201 {
            anyhow::bail!("token exchange failed: status {status}, body: {body}");
        }

        let token: TokenResponse =
            serde_json::from_str(&body).context("failed to parse token response")?;
        info!(
            "Device token received: device_id={} expires_in={}",
            token.device_id, token.expires_in
        );
        Ok(token)
    }
}

struct CallbackServer {
    code_rx: Receiver<Result<String, String>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl CallbackServer {
    fn spawn(port: u16) -> Result<Self> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("failed to start callback server on port {port}"))?;
        listener.set_nonblocking(true)?;

        let (code_tx, code_rx) = bounded::<Result<String, String>>(1);
        let router = Router::new()
            .route("/callback", get(handle_callback))
            .with_state(code_tx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = spawn_worker("auth-callback", move || {
            serve_blocking(listener, router, shutdown_rx)
        })?;

        info!("Callback server started: port={port}");
        Ok(Self {
            code_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn wait_for_code(&self, timeout: Duration) -> Result<String> {
        match self.code_rx.recv_timeout(timeout) {
            Ok(Ok(code)) => {
                info!("Authorization code received");
                Ok(code)
            }
            Ok(Err(reason)) => Err(anyhow!("authorization error: {reason}")),
            Err(RecvTimeoutError::Timeout) => Err(anyhow!("authorization timeout")),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("callback server closed")),
        }
    }

    fn stop(&self) {
        let Some(shutdown_tx) = self
            .shutdown_tx
            .lock()
            .expect("callback shutdown lock poisoned")
            .take()
        else {
            return;
        };
        let _ = shutdown_tx.send(());
        if let Some(worker) = self
            .worker
            .lock()
            .expect("callback worker lock poisoned")
            .take()
        {
            if !worker.join_timeout(Duration::from_secs(2)) {
                warn!("Callback server did not stop in time");
            }
        }
    }
}

async fn handle_callback(
    State(code_tx): State<Sender<Result<String, String>>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    if let Some(error) = params.get("error") {
        warn!("Authorization error: {error}");
        let _ = code_tx.try_send(Err(error.clone()));
        return (
            StatusCode::BAD_REQUEST,
            Html(ERROR_HTML.replace("{reason}", error)),
        );
    }

    match params.get("code") {
        Some(code) if !code.is_empty() => {
            let _ = code_tx.try_send(Ok(code.clone()));
            (StatusCode::OK, Html(SUCCESS_HTML.to_string()))
        }
        _ => {
            warn!("No authorization code received");
            let _ = code_tx.try_send(Err("no authorization code received".into()));
            (
                StatusCode::BAD_REQUEST,
                Html(ERROR_HTML.replace("{reason}", "No authorization code received")),
            )
        }
    }
}
