use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use field_bus::RowChange;
use futures::Stream;
use lease_store::FloorLease;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::channel::{ConnectionState, Subscription};
use crate::coordinator::CoordinatorError;
use crate::identity::Actor;
use crate::lease::{ActiveLease, LeaseError};
use crate::metrics;
use crate::orchestrator::{SyncAck, SyncError};
use crate::queue::{
    EntityType, MutationAction, PendingMutation, QueueError, SyncReport, UnknownEntityType,
};
use crate::state::AppState;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Conflict(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", Some(msg))
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(msg)),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Unauthenticated => ApiError::Unauthorized,
            LeaseError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            LeaseError::Unavailable(_) => ApiError::Unavailable(err.to_string()),
            LeaseError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Queue(QueueError::Full { .. }) => ApiError::Unavailable(err.to_string()),
            SyncError::Queue(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Lease(err) => err.into(),
            CoordinatorError::Sync(err) => err.into(),
            CoordinatorError::Queue(err) => ApiError::Internal(err.to_string()),
            CoordinatorError::LeaseStore(err) => ApiError::Unavailable(err.to_string()),
            CoordinatorError::NoTeam => ApiError::BadRequest(err.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    connection: ConnectionState,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        connection: state.coordinator().connection_state(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}

#[derive(Deserialize)]
struct SessionRequest {
    actor_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Serialize)]
struct SessionResponse {
    actor: Option<Actor>,
}

async fn sign_in(
    State(state): State<AppState>,
    Json(body): Json<SessionRequest>,
) -> ApiResult<Json<SessionResponse>> {
    if body.actor_id.trim().is_empty() {
        return Err(ApiError::BadRequest("actor_id is required".into()));
    }
    let actor = Actor::new(body.actor_id.trim(), body.display_name);
    state.coordinator().sign_in(actor.clone());
    Ok(Json(SessionResponse { actor: Some(actor) }))
}

async fn sign_out(State(state): State<AppState>) -> ApiResult<Json<SessionResponse>> {
    let actor = state.coordinator().sign_out().await?;
    Ok(Json(SessionResponse { actor }))
}

async fn list_claims(
    State(state): State<AppState>,
    Path(building_id): Path<String>,
) -> ApiResult<Json<Vec<ActiveLease>>> {
    Ok(Json(state.coordinator().list_claims(&building_id).await?))
}

async fn claim(
    State(state): State<AppState>,
    Path((building_id, floor)): Path<(String, i32)>,
) -> ApiResult<(StatusCode, Json<FloorLease>)> {
    let lease = state.coordinator().claim_floor(&building_id, floor).await?;
    Ok((StatusCode::CREATED, Json(lease)))
}

async fn release(
    State(state): State<AppState>,
    Path((building_id, floor)): Path<(String, i32)>,
) -> ApiResult<StatusCode> {
    state.coordinator().release_floor(&building_id, floor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(state): State<AppState>,
    Path((building_id, floor)): Path<(String, i32)>,
) -> ApiResult<StatusCode> {
    state.coordinator().heartbeat_claim(&building_id, floor)?;
    Ok(StatusCode::ACCEPTED)
}

async fn complete(
    State(state): State<AppState>,
    Path((building_id, floor)): Path<(String, i32)>,
) -> ApiResult<StatusCode> {
    state.coordinator().complete_floor(&building_id, floor).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct ReclaimResponse {
    reclaimed: Option<FloorLease>,
}

async fn reclaim(
    State(state): State<AppState>,
    Path((building_id, floor)): Path<(String, i32)>,
) -> ApiResult<Json<ReclaimResponse>> {
    let reclaimed = state
        .coordinator()
        .reclaim_stale_floor(&building_id, floor)
        .await?;
    Ok(Json(ReclaimResponse { reclaimed }))
}

#[derive(Deserialize)]
struct HelpRequest {
    #[serde(default)]
    note: Option<String>,
}

async fn help(
    State(state): State<AppState>,
    Path((building_id, floor)): Path<(String, i32)>,
    body: Option<Json<HelpRequest>>,
) -> ApiResult<StatusCode> {
    let note = body.and_then(|Json(body)| body.note);
    state.coordinator().request_help(&building_id, floor, note)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct SyncRequest {
    action: MutationAction,
    #[serde(default)]
    payload: serde_json::Value,
}

async fn sync_entity(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Json(body): Json<SyncRequest>,
) -> ApiResult<(StatusCode, Json<SyncAck>)> {
    let entity_type: EntityType = entity_type
        .parse()
        .map_err(|err: UnknownEntityType| ApiError::BadRequest(err.to_string()))?;
    let coordinator = state.coordinator();
    let ack = match body.action {
        MutationAction::Create => {
            coordinator
                .sync_create(entity_type, &entity_id, body.payload)
                .await?
        }
        MutationAction::Update => {
            coordinator
                .sync_update(entity_type, &entity_id, body.payload)
                .await?
        }
        MutationAction::Delete => coordinator.sync_delete(entity_type, &entity_id).await?,
    };
    let status = if ack.queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ack)))
}

async fn drain(State(state): State<AppState>) -> Json<SyncReport> {
    Json(state.coordinator().drain_now().await)
}

async fn pending(State(state): State<AppState>) -> Json<Vec<PendingMutation>> {
    Json(state.coordinator().sync().queue().pending().await)
}

#[derive(Serialize)]
struct ConnectionResponse {
    state: ConnectionState,
}

async fn connection(State(state): State<AppState>) -> Json<ConnectionResponse> {
    Json(ConnectionResponse {
        state: state.coordinator().connection_state(),
    })
}

async fn stream_connection(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.coordinator().watch_connection())
        .map(|conn| Ok(Event::default().event("connection").data(conn.as_str())));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Drops the claim listener when the SSE client goes away.
struct ListenerGuard(Option<Subscription>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(sub) = self.0.take() {
            sub.unsubscribe();
        }
    }
}

async fn stream_claims(
    State(state): State<AppState>,
    Path(building_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<RowChange>();
    let sub = state
        .coordinator()
        .subscribe_to_claims(&building_id, move |change| {
            let _ = tx.send(change.clone());
        })
        .await;
    let stream = futures::stream::unfold(
        (rx, ListenerGuard(Some(sub))),
        |(mut rx, guard)| async move {
            let change = rx.recv().await?;
            let data = serde_json::to_string(&change).unwrap_or_else(|err| {
                warn!(error = %err, "claim event encode failed");
                "{}".into()
            });
            Some((Ok(Event::default().event("claim").data(data)), (rx, guard)))
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/session", put(sign_in).delete(sign_out))
        .route("/buildings/:building_id/claims", get(list_claims))
        .route("/buildings/:building_id/claims/stream", get(stream_claims))
        .route(
            "/buildings/:building_id/floors/:floor/claim",
            post(claim).delete(release),
        )
        .route(
            "/buildings/:building_id/floors/:floor/heartbeat",
            post(heartbeat),
        )
        .route(
            "/buildings/:building_id/floors/:floor/complete",
            post(complete),
        )
        .route(
            "/buildings/:building_id/floors/:floor/reclaim",
            post(reclaim),
        )
        .route("/buildings/:building_id/floors/:floor/help", post(help))
        .route("/sync/drain", post(drain))
        .route("/sync/pending", get(pending))
        .route("/sync/:entity_type/:entity_id", post(sync_entity))
        .route("/connection", get(connection))
        .route("/connection/stream", get(stream_connection))
        .with_state(state)
}
