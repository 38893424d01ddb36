//! HTTP/WebSocket surface of the relay.
//!
//! Routes:
//! - `POST /auth/login`, `POST /auth/logout` — session lifecycle
//! - `GET /sensors/authorized` — sensor ids the caller may view
//! - `POST /admin/users`, `POST /admin/revoke` — user and grant management
//! - `POST /ingest` — raw reading batches from sensor sources
//! - `GET /ws` — live telemetry stream plus toggle commands
//! - `GET /health` — liveness, version, ingest counters
//!
//! # Architecture
//!
//! ```text
//! sensor sources ──→ POST /ingest ──→ IngestGateway ──→ SensorRegistry
//!                                                            │ change events
//! browser client ──→ GET /ws ──→ BroadcastHub ──→ filtered snapshots/deltas
//!        │
//!        └──→ {sensorId, action} ──→ CommandProcessor ──→ SensorRegistry
//! ```

use crate::access::AccessControl;
use crate::auth::{MemoryCredentials, Session, SessionAuthenticator};
use crate::command::{CommandProcessor, ToggleCommand};
use crate::config::Config;
use crate::hub::BroadcastHub;
use crate::ingest::IngestGateway;
use crate::registry::SensorRegistry;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Shared server state, cheap to clone into handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SensorRegistry>,
    pub access: Arc<AccessControl>,
    pub credentials: Arc<MemoryCredentials>,
    pub auth: Arc<SessionAuthenticator>,
    pub commands: Arc<CommandProcessor>,
    pub hub: BroadcastHub,
    pub ingest: Arc<IngestGateway>,
    pub ingest_token: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire up all components and seed users/grants from configuration.
    pub fn new(config: &Config) -> Self {
        let registry = Arc::new(SensorRegistry::new(config.update_capacity));
        let access = Arc::new(AccessControl::new());
        let credentials = Arc::new(MemoryCredentials::new());
        let auth = Arc::new(SessionAuthenticator::new(
            Arc::clone(&credentials) as Arc<dyn crate::auth::CredentialStore>,
            config.session_ttl_secs.map(Duration::from_secs),
        ));
        let commands = Arc::new(CommandProcessor::new(
            Arc::clone(&auth),
            Arc::clone(&access),
            Arc::clone(&registry),
        ));
        let hub = BroadcastHub::new(
            Arc::clone(&registry),
            Arc::clone(&access),
            config.max_subscribers,
        );
        let ingest = Arc::new(IngestGateway::new(Arc::clone(&registry)));

        for seed in &config.users {
            credentials.upsert_user(&seed.user_id, &seed.secret);
            access.set_admin(&seed.user_id, seed.admin);
            if !seed.sensors.is_empty() {
                access.grant(&seed.user_id, &seed.sensors, seed.capability);
            }
        }

        Self {
            registry,
            access,
            credentials,
            auth,
            commands,
            hub,
            ingest,
            ingest_token: config.ingest_token.clone(),
            started_at: Utc::now(),
        }
    }
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    pub code: String,
}

fn reject(status: StatusCode, code: &str, error: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            ok: false,
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_id: String,
    pub secret: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub ok: bool,
    pub token: String,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instance: String,
    pub uptime_secs: i64,
    pub sensors: usize,
    pub subscribers: usize,
    pub ingest_accepted: u64,
    pub ingest_rejected: u64,
    pub ingest_last_event_ms: i64,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolve the caller's session from the Authorization header.
fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Session, (StatusCode, Json<ErrorResponse>)> {
    let token = bearer_token(headers).ok_or_else(|| {
        reject(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "missing bearer token",
        )
    })?;
    state.auth.validate(token).map_err(|e| {
        reject(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            &e.to_string(),
        )
    })
}

fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Session, (StatusCode, Json<ErrorResponse>)> {
    let session = require_session(state, headers)?;
    if !state.access.is_admin(&session.user_id) {
        return Err(reject(
            StatusCode::FORBIDDEN,
            "forbidden",
            "administrative session required",
        ));
    }
    Ok(session)
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let instance = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        sensors: state.registry.len(),
        subscribers: state.hub.subscriber_count(),
        ingest_accepted: state.ingest.stats().accepted(),
        ingest_rejected: state.ingest.stats().rejected(),
        ingest_last_event_ms: state.ingest.stats().last_event_ms(),
    })
}

/// POST /auth/login
///
/// The failure body never distinguishes an unknown user from a wrong secret.
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.auth.login(&request.user_id, &request.secret) {
        Ok(session) => {
            tracing::info!(user = %session.user_id, "login");
            Ok(Json(LoginResponse {
                ok: true,
                token: session.token,
            }))
        }
        Err(e) => Err(reject(
            StatusCode::UNAUTHORIZED,
            "auth_failed",
            &e.to_string(),
        )),
    }
}

/// POST /auth/logout
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<OkResponse> {
    if let Some(token) = bearer_token(&headers) {
        state.auth.logout(token);
    }
    Json(OkResponse { ok: true })
}

#[derive(Serialize)]
pub struct AuthorizedSensorsResponse {
    pub sensors: Vec<String>,
}

/// GET /sensors/authorized
async fn authorized_sensors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuthorizedSensorsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let session = require_session(&state, &headers)?;

    let sensors = if state.access.is_admin(&session.user_id) {
        state
            .registry
            .snapshot()
            .into_iter()
            .map(|s| s.sensor_id)
            .collect()
    } else {
        state.access.list_granted(&session.user_id)
    };
    Ok(Json(AuthorizedSensorsResponse { sensors }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserRequest {
    pub user_id: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub sensor_ids: Vec<String>,
    #[serde(default)]
    pub capability: Option<crate::access::Capability>,
}

/// POST /admin/users
///
/// Creates or updates a user and adds grants. Grants are additive; use
/// `/admin/revoke` to take them away.
async fn add_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AddUserRequest>,
) -> Result<Json<OkResponse>, (StatusCode, Json<ErrorResponse>)> {
    let admin = require_admin(&state, &headers)?;

    if let Some(secret) = &request.secret {
        state.credentials.upsert_user(&request.user_id, secret);
    }
    if request.admin {
        state.access.set_admin(&request.user_id, true);
    }
    if !request.sensor_ids.is_empty() {
        let capability = request
            .capability
            .unwrap_or(crate::access::Capability::View);
        state
            .access
            .grant(&request.user_id, &request.sensor_ids, capability);
    }
    tracing::info!(admin = %admin.user_id, user = %request.user_id, "user updated");
    Ok(Json(OkResponse { ok: true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
    pub user_id: String,
    pub sensor_ids: Vec<String>,
}

/// POST /admin/revoke
async fn revoke_grants(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RevokeRequest>,
) -> Result<Json<OkResponse>, (StatusCode, Json<ErrorResponse>)> {
    let admin = require_admin(&state, &headers)?;
    state.access.revoke(&request.user_id, &request.sensor_ids);
    tracing::info!(admin = %admin.user_id, user = %request.user_id, "grants revoked");
    Ok(Json(OkResponse { ok: true }))
}

/// POST /ingest
///
/// Accepts a batch keyed by sensor name. Entries are validated
/// independently; the response lists what was rejected and why.
async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<crate::ingest::IngestReport>, (StatusCode, Json<ErrorResponse>)> {
    if let Some(expected) = &state.ingest_token {
        if bearer_token(&headers) != Some(expected.as_str()) {
            return Err(reject(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "invalid ingest token",
            ));
        }
    }

    let batch = body.as_object().ok_or_else(|| {
        reject(
            StatusCode::BAD_REQUEST,
            "malformed_input",
            "batch must be an object keyed by sensor name",
        )
    })?;

    Ok(Json(state.ingest.ingest_batch(batch)))
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws
///
/// Browsers cannot set headers on WebSocket upgrades, so the token is also
/// accepted as a query parameter.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_token(&headers)
        .map(|t| t.to_string())
        .or(query.token);
    let token = match token {
        Some(token) => token,
        None => {
            return reject(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "missing session token",
            )
                .into_response()
        }
    };

    let session = match state.auth.validate(&token) {
        Ok(session) => session,
        Err(e) => {
            return reject(StatusCode::UNAUTHORIZED, "unauthenticated", &e.to_string())
                .into_response()
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, session, state))
}

/// Reply to one inbound toggle command.
#[derive(Serialize)]
struct CommandReply {
    ok: bool,
    #[serde(rename = "sensorId", skip_serializing_if = "Option::is_none")]
    sensor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// One live connection: push frames out, apply toggle commands in.
async fn handle_socket(socket: WebSocket, session: Session, state: AppState) {
    let mut subscription = match state.hub.subscribe(&session) {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(user = %session.user_id, "subscription rejected: {e}");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    // Every subscriber's first observation is the complete authorized view.
    if send_json(&mut sink, &subscription.snapshot_frame())
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            frame = subscription.next_frame() => match frame {
                Some(frame) => {
                    if send_json(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let reply = dispatch_command(&state, &session.token, &text);
                    if send_json(&mut sink, &reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(user = %session.user_id, "socket error: {e}");
                    break;
                }
            },
        }
    }
    // Dropping the subscription releases the slot and the session reference.
}

fn dispatch_command(state: &AppState, token: &str, text: &str) -> CommandReply {
    let command: ToggleCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            return CommandReply {
                ok: false,
                sensor_id: None,
                error: Some(format!("malformed command: {e}")),
            }
        }
    };

    match state.commands.apply(token, &command.sensor_id, command.action) {
        Ok(sensor) => {
            tracing::info!(sensor = %sensor.sensor_id, active = sensor.active, "toggle applied");
            CommandReply {
                ok: true,
                sensor_id: Some(command.sensor_id),
                error: None,
            }
        }
        Err(reason) => CommandReply {
            ok: false,
            sensor_id: Some(command.sensor_id),
            error: Some(reason.code().to_string()),
        },
    }
}

async fn send_json<T: Serialize>(
    sink: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).map_err(axum::Error::new)?;
    sink.send(Message::Text(text)).await
}

/// Build the router over shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/sensors/authorized", get(authorized_sensors))
        .route("/admin/users", post(add_user))
        .route("/admin/revoke", post(revoke_grants))
        .route("/ingest", post(ingest))
        .route("/ws", get(ws_upgrade))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the relay server.
pub async fn run(
    config: &Config,
    state: AppState,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("relay listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("server shutdown signal received");
            })
            .await
        {
            tracing::error!("server error: {e}");
        }
    });

    Ok((actual_addr, shutdown_tx))
}
