//! API route handlers.
//!
//! All endpoints return JSON except the event stream, which is SSE.
//! State is shared via `Arc<ServerState>`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chain::{ChainDataProvider, ProviderHealth};
use crate::session::{SessionInfo, SessionManager};
use crate::types::{OutputRef, SessionId, SessionStatus, TraceError, TraceEvent};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ServerState {
    pub manager: Arc<SessionManager>,
    pub provider: Arc<dyn ChainDataProvider>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(manager: Arc<SessionManager>, provider: Arc<dyn ChainDataProvider>) -> Self {
        Self {
            manager,
            provider,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<ServerState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StartTraceRequest {
    /// Outpoint as `txid:vout`.
    pub root: String,
    #[serde(default)]
    pub depth_limit: Option<u32>,
    #[serde(default)]
    pub confidence_cutoff: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartTraceResponse {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub provider: ProviderHealth,
    pub active_sessions: usize,
    pub uptime_secs: i64,
}

/// Error body: `{"error": "..."}` with a status derived from the error.
pub struct ApiError(TraceError);

impl From<TraceError> for ApiError {
    fn from(e: TraceError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TraceError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            TraceError::SessionNotFound(_) | TraceError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            TraceError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TraceError::SessionCancelled | TraceError::InternalInvariant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse().map_err(ApiError)
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/traces
pub async fn start_trace(
    State(state): State<AppState>,
    Json(req): Json<StartTraceRequest>,
) -> Result<(StatusCode, Json<StartTraceResponse>), ApiError> {
    let root: OutputRef = req.root.parse()?;
    let session_id = state
        .manager
        .start(root, req.depth_limit, req.confidence_cutoff)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartTraceResponse {
            session_id,
            status: SessionStatus::Pending,
        }),
    ))
}

/// GET /api/traces
pub async fn list_traces(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.manager.list())
}

/// GET /api/traces/:id
pub async fn get_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.manager.info(id)?))
}

/// DELETE /api/traces/:id
pub async fn cancel_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.manager.cancel(id)?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/traces/:id/recent
pub async fn recent_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TraceEvent>>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.manager.recent_events(id)?))
}

/// GET /api/traces/:id/events
///
/// Live events from the moment of subscription. Each SSE message carries
/// the payload kind as its event name and the sequence number as its id.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_id(&id)?;
    let events = state.manager.events(id)?;

    let stream = events.filter_map(|event| async move {
        match Event::default()
            .event(event.payload.kind())
            .id(event.seq.to_string())
            .json_data(&event)
        {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!(session = %event.session_id, seq = event.seq, error = %e, "Failed to encode event");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let provider = state.provider.health().await;
    let status = if provider.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            provider,
            active_sessions: state.manager.active_count(),
            uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_defaults() {
        let req: StartTraceRequest =
            serde_json::from_str(r#"{"root":"aa:0"}"#).unwrap();
        assert!(req.depth_limit.is_none());
        assert!(req.confidence_cutoff.is_none());
    }

    #[test]
    fn test_api_error_status_mapping() {
        let resp = ApiError(TraceError::InvalidParameter("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = ApiError(TraceError::SessionNotFound(SessionId::new())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError(TraceError::InternalInvariant("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_health_response_flattens_provider() {
        let resp = HealthResponse {
            provider: ProviderHealth {
                provider: "electrs".into(),
                healthy: true,
                detail: "127.0.0.1:50001".into(),
            },
            active_sessions: 2,
            uptime_secs: 60,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["provider"], "electrs");
        assert_eq!(json["active_sessions"], 2);
    }
}
