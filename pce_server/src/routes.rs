//! HTTP + streaming surface over a shared [`PceKernel`].
//!
//! All endpoints are JSON except the SSE stream. The transcript table is
//! the source of truth for both stream transports: SSE clients reconnect
//! with `?since=<cursor>` (or use the catch-up endpoint) and receive every
//! missed item before the live tail resumes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use pce::{PceError, PceKernel, TranscriptItem};

pub struct AppState {
    pub kernel: Arc<PceKernel>,
}

/// Map the core error taxonomy onto HTTP statuses. Internal faults with a
/// safe default never reach this point; what does is producer-facing.
struct ApiError(PceError);

impl From<PceError> for ApiError {
    fn from(err: PceError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            PceError::InvalidSchema(_) | PceError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            PceError::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
            PceError::ApprovalAlreadyTerminal(_) | PceError::InsufficientBudget { .. } => {
                StatusCode::CONFLICT
            }
            PceError::StateConflict => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.tag(),
            "detail": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(kernel: Arc<PceKernel>) -> Router {
    let state = Arc::new(AppState { kernel });
    Router::new()
        .route("/events", post(ingest_event))
        .route("/v1/events", post(ingest_event))
        .route("/state", get(get_state))
        .route("/cci", get(get_cci))
        .route("/cci/history", get(get_cci_history))
        .route("/os/approvals", get(get_approvals))
        .route("/v1/os/approvals", get(get_approvals))
        .route("/os/approvals/:approval_id/approve", post(approve_request))
        .route("/v1/os/approvals/:approval_id/approve", post(approve_request))
        .route("/os/approvals/:approval_id/reject", post(reject_request))
        .route("/v1/os/approvals/:approval_id/reject", post(reject_request))
        .route("/v1/os/approvals/:approval_id/override", post(override_request))
        .route("/os/robotics/state", get(get_robotics_state))
        .route("/v1/os/state", get(get_os_state))
        .route("/v1/os/agents/transcript", get(get_transcript))
        .route("/v1/stream/os", get(stream_os))
        .route("/v1/stream/os/ws", get(stream_os_ws))
        .route(
            "/agents/assistant/control/clear_memory",
            post(clear_assistant_memory),
        )
        .route("/agents/rover/control/:command", post(rover_control))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Pipeline & state
// ---------------------------------------------------------------------------

async fn ingest_event(
    State(app): State<Arc<AppState>>,
    Json(raw): Json<Value>,
) -> ApiResult<Json<pce::PipelineResponse>> {
    let response = app.kernel.process_raw(&raw).await?;
    Ok(Json(response))
}

async fn get_state(State(app): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let state = app.kernel.state_snapshot()?;
    Ok(Json(json!({"state": Value::Object(state)})))
}

async fn get_cci(State(app): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let reading = app.kernel.cci_reading()?;
    Ok(Json(json!({"cci": reading.cci})))
}

async fn get_cci_history(State(app): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let history = app.kernel.cci_history()?;
    Ok(Json(json!({"history": history})))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApprovalDecisionIn {
    actor: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl ApprovalDecisionIn {
    fn validated(self) -> Result<Self, ApiError> {
        if self.actor.trim().is_empty() {
            return Err(ApiError(PceError::InvalidSchema(
                "actor must not be empty".into(),
            )));
        }
        Ok(self)
    }
}

async fn get_approvals(State(app): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let items = app.kernel.list_approvals()?;
    let pending: Vec<_> = items.iter().filter(|a| a.is_pending()).collect();
    Ok(Json(json!({"pending": pending, "items": items})))
}

async fn approve_request(
    State(app): State<Arc<AppState>>,
    Path(approval_id): Path<String>,
    Json(body): Json<ApprovalDecisionIn>,
) -> ApiResult<Json<pce::PipelineResponse>> {
    let body = body.validated()?;
    let notes = body.notes.unwrap_or_default();
    let response = app.kernel.approve(&approval_id, &body.actor, &notes).await?;
    Ok(Json(response))
}

async fn reject_request(
    State(app): State<Arc<AppState>>,
    Path(approval_id): Path<String>,
    Json(body): Json<ApprovalDecisionIn>,
) -> ApiResult<Json<pce::PipelineResponse>> {
    let body = body.validated()?;
    let reason = body
        .reason
        .or(body.notes)
        .unwrap_or_else(|| "no reason provided".to_string());
    let response = app.kernel.reject(&approval_id, &body.actor, &reason).await?;
    Ok(Json(response))
}

async fn override_request(
    State(app): State<Arc<AppState>>,
    Path(approval_id): Path<String>,
    Json(body): Json<ApprovalDecisionIn>,
) -> ApiResult<Json<pce::PipelineResponse>> {
    let body = body.validated()?;
    let notes = body.notes.unwrap_or_else(|| "override".to_string());
    let response = app
        .kernel
        .override_approval(&approval_id, &body.actor, &notes)
        .await?;
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// OS state views
// ---------------------------------------------------------------------------

async fn get_robotics_state(State(app): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let twin = app.kernel.robotics_twin()?;
    Ok(Json(json!({"robotics_twin": twin})))
}

#[derive(Debug, Deserialize)]
struct OsStateParams {
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

fn default_audit_limit() -> usize {
    30
}

async fn get_os_state(
    State(app): State<Arc<AppState>>,
    Query(params): Query<OsStateParams>,
) -> ApiResult<Json<pce::OsStateView>> {
    let limit = params.limit.clamp(1, 200);
    Ok(Json(app.kernel.os_state(limit)?))
}

// ---------------------------------------------------------------------------
// Transcript & stream
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TranscriptParams {
    #[serde(default)]
    since: i64,
}

async fn get_transcript(
    State(app): State<Arc<AppState>>,
    Query(params): Query<TranscriptParams>,
) -> ApiResult<Json<Value>> {
    let items = app.kernel.transcript_since(params.since.max(0))?;
    let cursor = app.kernel.transcript_cursor()?;
    Ok(Json(json!({"cursor": cursor, "items": items})))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    #[serde(default)]
    since: Option<i64>,
}

fn sse_event(item: &TranscriptItem) -> Event {
    Event::default()
        .event(item.kind.stream_event())
        .data(serde_json::to_string(item).unwrap_or_else(|_| "{}".to_string()))
}

async fn stream_os(
    State(app): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // Subscribe before the catch-up read so nothing falls in the gap;
    // duplicates are filtered by cursor below (at-least-once is fine).
    let rx = app.kernel.transcript().subscribe();
    let catchup = match params.since {
        Some(since) => app.kernel.transcript_since(since.max(0))?,
        None => Vec::new(),
    };
    let mut last = catchup
        .last()
        .map(|item| item.cursor)
        .or(params.since)
        .unwrap_or(0);

    let live = BroadcastStream::new(rx).filter_map(move |received| {
        let event = match received {
            Ok(item) if item.cursor > last => {
                last = item.cursor;
                Some(Ok::<_, Infallible>(sse_event(&item)))
            }
            _ => None,
        };
        futures::future::ready(event)
    });
    let stream = futures::stream::iter(
        catchup
            .iter()
            .map(|item| Ok::<_, Infallible>(sse_event(item)))
            .collect::<Vec<_>>(),
    )
    .chain(live);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn stream_os_ws(
    ws: WebSocketUpgrade,
    State(app): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket(socket, app))
}

async fn websocket(ws: WebSocket, app: Arc<AppState>) {
    let (mut sender, mut receiver) = ws.split();
    let mut rx = app.kernel.transcript().subscribe();

    // Single select loop instead of spawned tasks so both halves shut down
    // together when either side closes.
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => {
                match received {
                    Ok(item) => {
                        let frame = json!({
                            "event": item.kind.stream_event(),
                            "data": item,
                        });
                        let text = serde_json::to_string(&frame)
                            .unwrap_or_else(|_| "{}".to_string());
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

async fn clear_assistant_memory(State(app): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    Ok(Json(app.kernel.clear_assistant_memory().await?))
}

async fn rover_control(
    State(app): State<Arc<AppState>>,
    Path(command): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(app.kernel.rover_control(&command).await?))
}
