//! HTTP transport and status publishing.
//!
//! Routes, relative to `server.base_topic`:
//! - `POST /{base}/cmd`: one command payload, always answered with 202
//! - `GET /{base}/status`: retained `online` / `offline`
//! - `GET /{base}/heartbeat`: retained unix timestamp of the last beat
//!
//! When `server.username` is set every route requires HTTP basic auth.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{CommandInterpreter, Handled};
use crate::config::ServerConfig;

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

pub fn status_topic(base: &str) -> String {
    format!("{base}/status")
}

pub fn heartbeat_topic(base: &str) -> String {
    format!("{base}/heartbeat")
}

/// Sink for retained status values.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, topic: &str, value: String);
}

/// Keeps the last value published on each topic.
#[derive(Default)]
pub struct StatusBoard {
    retained: Mutex<HashMap<String, String>>,
}

impl StatusBoard {
    pub fn get(&self, topic: &str) -> Option<String> {
        self.retained.lock().unwrap().get(topic).cloned()
    }
}

impl StatusPublisher for StatusBoard {
    fn publish(&self, topic: &str, value: String) {
        debug!("{topic} = {value}");
        self.retained.lock().unwrap().insert(topic.to_string(), value);
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub interpreter: Arc<CommandInterpreter>,
    pub board: Arc<StatusBoard>,
    pub base_topic: String,
    pub credentials: Option<(String, String)>,
}

impl ApiState {
    pub fn new(
        interpreter: Arc<CommandInterpreter>,
        board: Arc<StatusBoard>,
        config: &ServerConfig,
    ) -> Self {
        let credentials = (!config.username.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));
        Self {
            interpreter,
            board,
            base_topic: config.base_topic.clone(),
            credentials,
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    let base = state.base_topic.trim_matches('/').to_string();
    let router = Router::new()
        .route(&format!("/{base}/cmd"), post(handle_cmd))
        .route(&format!("/{base}/status"), get(handle_status))
        .route(&format!("/{base}/heartbeat"), get(handle_heartbeat));

    let router = if state.credentials.is_some() {
        router.route_layer(middleware::from_fn_with_state(state.clone(), require_basic_auth))
    } else {
        router
    };
    router.with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    config: &ServerConfig,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening for commands on http://{addr}/{}/cmd", state.base_topic);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Publish the current unix time every `interval` until `stop` is cancelled.
pub async fn heartbeat(
    publisher: Arc<dyn StatusPublisher>,
    topic: String,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                publisher.publish(&topic, chrono::Utc::now().timestamp().to_string());
            }
            _ = stop.cancelled() => break,
        }
    }
}

// --- Handlers ---

async fn handle_cmd(State(state): State<ApiState>, body: Bytes) -> StatusCode {
    match state.interpreter.handle(&body) {
        Handled::Queued { seq, tasks } => debug!("Queued batch #{seq} with {tasks} tasks"),
        Handled::Control(command) => debug!("Applied {command:?}"),
        Handled::Rejected(reason) => debug!("Command rejected: {reason}"),
        Handled::QueueFull => debug!("Command dropped, queue full"),
    }
    StatusCode::ACCEPTED
}

async fn handle_status(State(state): State<ApiState>) -> Response {
    retained(&state, &status_topic(&state.base_topic))
}

async fn handle_heartbeat(State(state): State<ApiState>) -> Response {
    retained(&state, &heartbeat_topic(&state.base_topic))
}

fn retained(state: &ApiState, topic: &str) -> Response {
    match state.board.get(topic) {
        Some(value) => value.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn require_basic_auth(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let authorized = match (&state.credentials, basic_credentials(&request)) {
        (Some((user, pass)), Some((given_user, given_pass))) => {
            *user == given_user && *pass == given_pass
        }
        (None, _) => true,
        _ => false,
    };
    if !authorized {
        warn!("Rejected unauthenticated request to {}", request.uri().path());
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"tts\"")],
        )
            .into_response();
    }
    next.run(request).await
}

fn basic_credentials(request: &Request) -> Option<(String, String)> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
