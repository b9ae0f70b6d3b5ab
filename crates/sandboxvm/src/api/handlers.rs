//! API request handlers.

use std::net::{IpAddr, SocketAddr};

use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts, Path, State, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::session::{ExecutionResult, SessionView};

/// The anonymous caller a request is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl FromRequestParts<AppState> for ClientIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.trust_forwarded_for {
            let forwarded = parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return Ok(Self(ip.to_string()));
            }
        }

        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| Self(addr.ip().to_string()))
            .ok_or_else(|| ApiError::Internal("peer address unavailable".to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub reused: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendRequest {
    pub delta_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendResponse {
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
    pub capacity: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.sessions.stats();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: stats.active,
        capacity: stats.capacity,
    })
}

/// Start a session, or return the caller's live one.
pub async fn start_session(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let outcome = state.sessions.start_detached(&identity).await?;

    let status = if outcome.reused {
        StatusCode::OK
    } else {
        info!(session_id = %outcome.session.session_id, owner = %identity, "Started session");
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(StartResponse {
            session_id: outcome.session.session_id,
            expires_at: outcome.session.expires_at,
            reused: outcome.reused,
        }),
    ))
}

/// Stop a session. Idempotent.
pub async fn stop_session(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.sessions.stop_detached(&identity, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_status(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    Ok(Json(state.sessions.status(&identity, &session_id)?))
}

pub async fn execute(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    Path(session_id): Path<String>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<Json<ExecutionResult>> {
    let Json(request) = payload?;
    let result = state
        .sessions
        .execute(&identity, &session_id, &request.command)
        .await?;
    Ok(Json(result))
}

pub async fn extend(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    Path(session_id): Path<String>,
    payload: Result<Json<ExtendRequest>, JsonRejection>,
) -> ApiResult<Json<ExtendResponse>> {
    let Json(request) = payload?;
    let expires_at = state
        .sessions
        .extend(&identity, &session_id, request.delta_seconds)
        .await?;
    Ok(Json(ExtendResponse { expires_at }))
}
