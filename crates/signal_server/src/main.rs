use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use shared::{
    domain::{
        CallHistoryEntry, CallRole, CandidateRecord, NewCallSession, NewHistoryEntry, PairKey,
        ParticipantId,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        AcceptCallRequest, AppendCandidateRequest, CreateCallResponse, DeleteHistoryRequest,
        DeleteHistoryResponse, FinalizeCallRequest, FinalizeHistoryRequest, HistoryListResponse,
        PublishDescriptionRequest, PublishDescriptionResponse, ResolveGlareRequest,
        SessionResponse,
    },
};
use signal_store::{SessionCreate, SignalStore, SqliteStore, StoreError};
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

mod config;

use config::{load_settings, normalize_database_url};

// Signaling payloads are small; anything larger is a client bug.
const MAX_BODY_BYTES: usize = 64 * 1024;

struct AppState {
    store: SqliteStore,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    participant: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let store = SqliteStore::new(&database_url).await.map_err(|error| {
        tracing::error!(%database_url, %error, "failed to open SQLite database");
        anyhow::anyhow!(error)
    })?;

    let state = AppState { store };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "signal server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/calls", post(create_call))
        .route("/calls/:pair", get(get_call))
        .route("/calls/:pair/offer", post(publish_offer))
        .route("/calls/:pair/answer", post(publish_answer))
        .route("/calls/:pair/accept", post(accept_call))
        .route("/calls/:pair/glare", post(resolve_glare))
        .route("/calls/:pair/end", post(finalize_call))
        .route(
            "/calls/:pair/candidates",
            post(append_candidate).delete(clear_candidates),
        )
        .route("/calls/:pair/candidates/:role", get(list_candidates))
        .route("/history", post(record_history))
        .route("/history/finalize", post(finalize_history))
        .route("/users/:owner/history", get(list_history).delete(delete_history))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn store_error(err: StoreError) -> (StatusCode, Json<ApiError>) {
    match err {
        StoreError::Conflict => (
            StatusCode::CONFLICT,
            Json(ApiError::new(ErrorCode::Conflict, "conditional write lost")),
        ),
        StoreError::Malformed(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(ErrorCode::Internal, message)),
        ),
        StoreError::Unavailable(message) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, message)),
        ),
    }
}

fn validation(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.store.health_check().await.map_err(store_error)?;
    Ok("ok")
}

async fn create_call(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewCallSession>,
) -> Result<Json<CreateCallResponse>, (StatusCode, Json<ApiError>)> {
    if req.caller_id.as_str().trim().is_empty() || req.receiver_id.as_str().trim().is_empty() {
        return Err(validation("participant ids cannot be empty"));
    }
    if req.caller_id == req.receiver_id {
        return Err(validation("caller and receiver must differ"));
    }
    let response = match state.store.create_session(req).await.map_err(store_error)? {
        SessionCreate::Created(session) => CreateCallResponse {
            created: true,
            session,
        },
        SessionCreate::Live(session) => CreateCallResponse {
            created: false,
            session,
        },
    };
    Ok(Json(response))
}

async fn get_call(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
) -> Result<Json<SessionResponse>, (StatusCode, Json<ApiError>)> {
    let session = state
        .store
        .load_session(&PairKey::from_raw(pair))
        .await
        .map_err(store_error)?;
    Ok(Json(SessionResponse { session }))
}

async fn publish_offer(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
    Json(req): Json<PublishDescriptionRequest>,
) -> Result<Json<PublishDescriptionResponse>, (StatusCode, Json<ApiError>)> {
    let wrote = state
        .store
        .set_offer(&PairKey::from_raw(pair), &req.writer_id, &req.description)
        .await
        .map_err(store_error)?;
    Ok(Json(PublishDescriptionResponse { wrote }))
}

async fn publish_answer(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
    Json(req): Json<PublishDescriptionRequest>,
) -> Result<Json<PublishDescriptionResponse>, (StatusCode, Json<ApiError>)> {
    let wrote = state
        .store
        .set_answer(&PairKey::from_raw(pair), &req.writer_id, &req.description)
        .await
        .map_err(store_error)?;
    Ok(Json(PublishDescriptionResponse { wrote }))
}

async fn accept_call(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
    Json(req): Json<AcceptCallRequest>,
) -> Result<Json<SessionResponse>, (StatusCode, Json<ApiError>)> {
    let session = state
        .store
        .accept_session(&PairKey::from_raw(pair), &req.receiver_id)
        .await
        .map_err(store_error)?;
    Ok(Json(SessionResponse { session }))
}

async fn resolve_glare(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
    Json(req): Json<ResolveGlareRequest>,
) -> Result<Json<SessionResponse>, (StatusCode, Json<ApiError>)> {
    let session = state
        .store
        .resolve_glare(&PairKey::from_raw(pair), &req.caller_id)
        .await
        .map_err(store_error)?;
    Ok(Json(SessionResponse { session }))
}

async fn finalize_call(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
    Json(req): Json<FinalizeCallRequest>,
) -> Result<Json<SessionResponse>, (StatusCode, Json<ApiError>)> {
    if !req.status.is_terminal() {
        return Err(validation("finalize requires a terminal status"));
    }
    let session = state
        .store
        .finalize_session(&PairKey::from_raw(pair), req.status, req.ended_at)
        .await
        .map_err(store_error)?;
    Ok(Json(SessionResponse { session }))
}

async fn append_candidate(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
    Json(req): Json<AppendCandidateRequest>,
) -> Result<Json<Option<CandidateRecord>>, (StatusCode, Json<ApiError>)> {
    let record = state
        .store
        .append_candidate(&PairKey::from_raw(pair), req.role, &req.candidate)
        .await
        .map_err(store_error)?;
    Ok(Json(record))
}

async fn list_candidates(
    State(state): State<Arc<AppState>>,
    Path((pair, role)): Path<(String, String)>,
) -> Result<Json<Vec<CandidateRecord>>, (StatusCode, Json<ApiError>)> {
    let role = match role.as_str() {
        "caller" => CallRole::Caller,
        "receiver" => CallRole::Receiver,
        _ => return Err(validation("role must be 'caller' or 'receiver'")),
    };
    let records = state
        .store
        .list_candidates(&PairKey::from_raw(pair), role)
        .await
        .map_err(store_error)?;
    Ok(Json(records))
}

async fn clear_candidates(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .store
        .clear_candidates(&PairKey::from_raw(pair))
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn record_history(
    State(state): State<Arc<AppState>>,
    Json(entry): Json<NewHistoryEntry>,
) -> Result<Json<CallHistoryEntry>, (StatusCode, Json<ApiError>)> {
    let stored = state
        .store
        .record_history(entry)
        .await
        .map_err(store_error)?;
    Ok(Json(stored))
}

async fn finalize_history(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FinalizeHistoryRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .store
        .finalize_history(req.entry, req.reason, req.ended_at)
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_history(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
) -> Result<Json<HistoryListResponse>, (StatusCode, Json<ApiError>)> {
    let entries = state
        .store
        .list_history(&ParticipantId::new(owner))
        .await
        .map_err(store_error)?;
    Ok(Json(HistoryListResponse { entries }))
}

async fn delete_history(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
    Json(req): Json<DeleteHistoryRequest>,
) -> Result<Json<DeleteHistoryResponse>, (StatusCode, Json<ApiError>)> {
    let removed = state
        .store
        .delete_history(&ParticipantId::new(owner), &req.entry_ids)
        .await
        .map_err(store_error)?;
    Ok(Json(DeleteHistoryResponse { removed }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, ParticipantId::new(q.participant)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    participant: ParticipantId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.store.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    if !event.concerns(&participant) {
                        continue;
                    }
                    let text = match serde_json::to_string(&event) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
