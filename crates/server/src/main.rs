use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, info};

use authcrypt::{FieldCipher, MasterKey};
use protocol_link::UnboundConnector;
use session_core::{SessionError, SessionManager};
use shared::{
    domain::{ChannelId, SessionKey, TenantId},
    error::{ApiError, ErrorCode},
};
use storage::Storage;

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    to: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    tenant_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let master_key = settings
        .master_key
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("MASTER_KEY is not configured"))
        .and_then(|encoded| MasterKey::from_encoded(encoded).map_err(Into::into))?;

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url, FieldCipher::new(&master_key))
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;

    let manager = SessionManager::new(
        Arc::new(storage.clone()),
        Arc::new(storage),
        Arc::new(UnboundConnector),
        settings.manager_config(),
    );

    let state = AppState {
        manager: Arc::clone(&manager),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "session manager listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down; draining live sessions");
    manager.shutdown_all().await;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions/:tenant_id/:channel_id/start", post(start_session))
        .route("/sessions/:tenant_id/:channel_id/stop", post(stop_session))
        .route("/sessions/:tenant_id/:channel_id/messages", post(send_message))
        .route("/sessions/:tenant_id/:channel_id", get(session_status))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn session_key(tenant_id: i64, channel_id: i64) -> SessionKey {
    SessionKey::new(TenantId(tenant_id), ChannelId(channel_id))
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, channel_id)): Path<(i64, i64)>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .manager
        .start(session_key(tenant_id, channel_id))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, channel_id)): Path<(i64, i64)>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .manager
        .stop(session_key(tenant_id, channel_id))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, channel_id)): Path<(i64, i64)>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    if req.to.trim().is_empty() || req.text.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                ErrorCode::Validation,
                "recipient and text must not be empty",
            )),
        ));
    }

    let message_id = state
        .manager
        .send(session_key(tenant_id, channel_id), &req.to, &req.text)
        .await
        .map_err(|e| match e {
            SessionError::NotReady { .. } => (
                StatusCode::CONFLICT,
                Json(ApiError::new(ErrorCode::NotReady, e.to_string())),
            ),
            SessionError::Delivery { .. } => (
                StatusCode::BAD_GATEWAY,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            ),
        })?;
    Ok(Json(serde_json::json!({ "message_id": message_id })))
}

async fn session_status(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, channel_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let (connection_state, ready) = state
        .manager
        .session_status(session_key(tenant_id, channel_id))
        .await
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::new(ErrorCode::NotFound, "session not running")),
            )
        })?;
    Ok(Json(
        serde_json::json!({ "state": connection_state, "ready": ready }),
    ))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, TenantId(q.tenant_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    tenant_id: TenantId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.manager.bridge().subscribe(tenant_id).await;

    let send_task = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
