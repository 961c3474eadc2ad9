//! Admin HTTP API.
//!
//! A small operator surface: health checks, read-only server inspection,
//! and the planner pause switch.
//!
//! # Routes
//!
//! - `GET /health` - Liveness
//! - `GET /ready` - Readiness (the store answers)
//! - `GET /v1/servers` - List servers, optionally `?state=running`
//! - `GET /v1/servers/:name` - Get one server
//! - `GET /v1/pause` - Whether planning is paused
//! - `POST /v1/pause` - Pause planning
//! - `POST /v1/resume` - Resume planning

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fleetscale_core::{ProviderKind, ServerName};
use fleetscale_store::{Server, ServerState, Store, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::error::EngineError;

/// Build the admin router.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/servers", get(list_servers))
        .route("/v1/servers/:name", get(get_server))
        .route("/v1/pause", get(pause_status).post(pause))
        .route("/v1/resume", post(resume))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(engine)
}

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The engine cannot serve the request right now.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(StoreError::NotFound(what)) => Self::NotFound(what),
            EngineError::Config(message) => Self::BadRequest(message),
            EngineError::Interrupted => Self::Unavailable(err.to_string()),
            other => {
                tracing::error!(error = %other, "Admin request failed");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        EngineError::from(err).into()
    }
}

/// A server as shown to operators. Secrets and keys are left out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerView {
    /// Server name.
    pub name: ServerName,
    /// Provider-assigned machine id.
    pub id: Option<String>,
    /// Hosting backend.
    pub provider: ProviderKind,
    /// Concurrent builds.
    pub capacity: u32,
    /// Public address.
    pub address: Option<String>,
    /// Region.
    pub region: Option<String>,
    /// Boot image.
    pub image: Option<String>,
    /// Machine size.
    pub size: Option<String>,
    /// Lifecycle state.
    pub state: ServerState,
    /// Last recorded failure.
    pub error: Option<String>,
    /// When the record was created.
    pub created: DateTime<Utc>,
    /// When the record last changed.
    pub updated: DateTime<Utc>,
    /// When the machine was provisioned.
    pub started: Option<DateTime<Utc>>,
    /// When the machine was torn down.
    pub stopped: Option<DateTime<Utc>>,
    /// When a build was last seen on the machine.
    pub last_busy: Option<DateTime<Utc>>,
}

impl From<Server> for ServerView {
    fn from(server: Server) -> Self {
        Self {
            name: server.name,
            id: server.id,
            provider: server.provider,
            capacity: server.capacity,
            address: server.address,
            region: server.region,
            image: server.image,
            size: server.size,
            state: server.state,
            error: server.error,
            created: server.created,
            updated: server.updated,
            started: server.started,
            stopped: server.stopped,
            last_busy: server.last_busy,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
}

/// Pause switch state.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PauseResponse {
    /// Whether planning is paused.
    pub paused: bool,
}

/// Query parameters for listing servers.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Only list servers in this state.
    pub state: Option<String>,
}

async fn health() -> impl IntoResponse {
    Json(StatusResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ready(State(engine): State<Arc<Engine>>) -> Result<impl IntoResponse, ApiError> {
    if engine.cancel_token().is_cancelled() {
        return Err(ApiError::Unavailable("shutting down".into()));
    }
    engine
        .store()
        .list_state(ServerState::Running)
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    Ok(Json(StatusResponse {
        status: "ready",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_servers(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let servers = match query.state.as_deref() {
        Some(raw) => {
            let state = raw.parse::<ServerState>().map_err(ApiError::BadRequest)?;
            engine.store().list_state(state)?
        }
        None => engine.store().list()?,
    };

    let views: Vec<ServerView> = servers.into_iter().map(ServerView::from).collect();
    Ok(Json(views))
}

async fn get_server(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let name = ServerName::parse(&name).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let server = engine
        .store()
        .find(&name)?
        .ok_or_else(|| ApiError::NotFound(format!("server {name}")))?;

    Ok(Json(ServerView::from(server)))
}

async fn pause_status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(PauseResponse {
        paused: engine.paused(),
    })
}

async fn pause(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.pause();
    Json(PauseResponse { paused: true })
}

async fn resume(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.resume();
    Json(PauseResponse { paused: false })
}
