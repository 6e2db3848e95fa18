//! HTTP and WebSocket handlers for the Roomcast server.
//!
//! A connection request is authenticated and admitted before the upgrade;
//! after the upgrade the socket is handed to a [`ClientSession`] and this
//! module only waits for it to finish.

use crate::config::{AuthConfig, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use roomcast_core::{
    admit, Admission, AdmissionError, ClientSession, HubHandle, RoomGate, RoomId, UserId,
};
use roomcast_protocol::WireFormat;
use roomcast_transport::AxumConnection;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the running hub.
    pub hub: HubHandle,
    /// Room membership gate.
    pub gate: Arc<dyn RoomGate>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state using the gate described by `config`.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle) -> Self {
        let gate = config.gate();
        info!(
            rooms = gate.room_count(),
            open = config.open_rooms,
            "Room gate configured"
        );
        Self {
            hub,
            gate: Arc::new(gate),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, hub: HubHandle) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Roomcast server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws/{{room_id}}", addr);

    let state = Arc::new(AppState::new(config, hub));
    serve(listener, state, shutdown_signal()).await
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/:room_id", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Read the caller's user id from the configured header, falling back to
/// the query parameter when one is configured.
fn resolve_identity(
    auth: &AuthConfig,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Option<String> {
    headers
        .get(auth.user_header.as_str())
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            let key = auth.user_query.as_deref()?;
            params.get(key).map(String::as_str)
        })
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
}

fn reject(status: StatusCode, reason: &'static str, detail: impl Into<String>) -> Response {
    metrics::record_rejection(reason);
    (status, detail.into()).into_response()
}

/// WebSocket upgrade handler for `GET /ws/:room_id`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(user_id) = resolve_identity(&state.config.auth, &headers, &params) else {
        debug!(remote = %remote, room = %room_id, "Missing identity");
        return reject(StatusCode::UNAUTHORIZED, "unauthenticated", "missing user identity");
    };

    let room = match RoomId::parse(room_id) {
        Ok(room) => room,
        Err(e) => return reject(StatusCode::BAD_REQUEST, "bad_room", e.to_string()),
    };
    let user = match UserId::parse(user_id) {
        Ok(user) => user,
        Err(e) => return reject(StatusCode::BAD_REQUEST, "bad_user", e.to_string()),
    };
    let format = match params.get("format") {
        None => WireFormat::default(),
        Some(name) => match WireFormat::from_name(name) {
            Some(format) => format,
            None => {
                return reject(
                    StatusCode::BAD_REQUEST,
                    "bad_format",
                    format!("unknown format {name:?}"),
                )
            }
        },
    };

    let admission = match admit(state.gate.as_ref(), room, user).await {
        Ok(admission) => admission,
        Err(e @ AdmissionError::NotMember { .. }) => {
            info!(remote = %remote, "{}", e);
            return reject(StatusCode::FORBIDDEN, "not_member", e.to_string());
        }
        Err(AdmissionError::Gate(e)) => {
            error!(remote = %remote, error = %e, "Room gate failed");
            return reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                "gate_error",
                "membership check failed",
            );
        }
    };

    ws.max_message_size(state.config.session.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, admission, format, remote))
}

/// Run an admitted WebSocket connection until its session ends.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    admission: Admission,
    format: WireFormat,
    remote: SocketAddr,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = AxumConnection::new(socket).with_remote_addr(remote.to_string());
    let config = state.config.session.to_session_config(format);

    let session =
        match ClientSession::register(state.hub.clone(), Box::new(connection), admission, config)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(remote = %remote, error = %e, "Failed to register session");
                return;
            }
        };

    session.serve().join().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use futures_util::{SinkExt, StreamExt};
    use roomcast_core::Hub;
    use tokio_tungstenite::{connect_async, tungstenite};

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn query_auth() -> AuthConfig {
        AuthConfig {
            user_query: Some("user_id".into()),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn test_identity_ignores_query_by_default() {
        let auth = AuthConfig::default();
        let query = params(&[("user_id", "mallory")]);
        assert_eq!(resolve_identity(&auth, &HeaderMap::new(), &query), None);

        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("alice"));
        assert_eq!(resolve_identity(&auth, &headers, &query).as_deref(), Some("alice"));
    }

    #[test]
    fn test_identity_prefers_header() {
        let auth = query_auth();
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("alice"));

        let query = params(&[("user_id", "mallory")]);
        assert_eq!(resolve_identity(&auth, &headers, &query).as_deref(), Some("alice"));
        assert_eq!(
            resolve_identity(&auth, &HeaderMap::new(), &query).as_deref(),
            Some("mallory")
        );
        assert_eq!(resolve_identity(&auth, &HeaderMap::new(), &params(&[])), None);
        assert_eq!(
            resolve_identity(&auth, &HeaderMap::new(), &params(&[("user_id", "  ")])),
            None
        );
    }

    async fn start_server(config: Config) -> (SocketAddr, HubHandle) {
        let hub = Hub::new();
        let handle = hub.handle();
        hub.spawn();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(config, handle.clone()));
        tokio::spawn(serve(listener, state, std::future::pending()));
        (addr, handle)
    }

    async fn wait_for_members(hub: &HubHandle, room: &str, count: usize) {
        let room = RoomId::new(room);
        for _ in 0..200 {
            if hub.members(&room).await.unwrap().len() == count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("room {room} never reached {count} members");
    }

    fn rejected_status(result: Result<impl Sized, tungstenite::Error>) -> u16 {
        match result {
            Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("connection was accepted"),
        }
    }

    #[tokio::test]
    async fn test_chat_over_websocket() {
        let config = Config {
            open_rooms: true,
            auth: query_auth(),
            ..Config::default()
        };
        let (addr, hub) = start_server(config).await;

        let (mut alice, _) = connect_async(format!("ws://{addr}/ws/lobby?user_id=alice"))
            .await
            .unwrap();
        let (mut bob, _) = connect_async(format!("ws://{addr}/ws/lobby?user_id=bob"))
            .await
            .unwrap();
        wait_for_members(&hub, "lobby", 2).await;

        alice
            .send(tungstenite::Message::Text(
                r#"{"sender_id":"mallory","content":"hello bob"}"#.into(),
            ))
            .await
            .unwrap();

        let received = loop {
            match bob.next().await.unwrap().unwrap() {
                tungstenite::Message::Text(text) => break text,
                _ => continue,
            }
        };
        let message: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(message["sender_id"], "alice");
        assert_eq!(message["room_id"], "lobby");
        assert_eq!(message["content"], "hello bob");

        alice.close(None).await.unwrap();
        wait_for_members(&hub, "lobby", 1).await;
    }

    #[tokio::test]
    async fn test_admission_failures_reject_upgrade() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            user_query = "user_id"

            [[rooms]]
            id = "lobby"
            members = ["alice"]
        "#,
        )
        .unwrap();
        let (addr, hub) = start_server(config).await;

        let missing = connect_async(format!("ws://{addr}/ws/lobby")).await;
        assert_eq!(rejected_status(missing), 401);

        let outsider = connect_async(format!("ws://{addr}/ws/lobby?user_id=mallory")).await;
        assert_eq!(rejected_status(outsider), 403);

        let bad_room = connect_async(format!("ws://{addr}/ws/$system?user_id=alice")).await;
        assert_eq!(rejected_status(bad_room), 400);

        let bad_format =
            connect_async(format!("ws://{addr}/ws/lobby?user_id=alice&format=xml")).await;
        assert_eq!(rejected_status(bad_format), 400);

        assert_eq!(hub.stats().await.unwrap().sessions, 0);
    }

    #[tokio::test]
    async fn test_query_identity_is_refused_by_default() {
        let config = Config {
            open_rooms: true,
            ..Config::default()
        };
        let (addr, hub) = start_server(config).await;

        let spoofed = connect_async(format!("ws://{addr}/ws/lobby?user_id=alice")).await;
        assert_eq!(rejected_status(spoofed), 401);
        assert_eq!(hub.stats().await.unwrap().sessions, 0);
    }
}
