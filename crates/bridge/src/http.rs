//! Read-only management HTTP surface: status, metrics, source lifecycle,
//! and sink diagnostic probes. Consumed by the management plane; carries
//! no authentication of its own.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::{Bridge, Error as BridgeError};

/// Errors raised while standing up the management HTTP server.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured bind address could not be parsed.
    #[error("invalid management bind address `{address}`: {message}")]
    InvalidBindAddress {
        /// The address that failed to parse.
        address: String,
        /// The parse error message.
        message: String,
    },

    /// The TCP listener could not be bound.
    #[error("failed to bind management server on `{address}`: {message}")]
    BindFailed {
        /// The address we attempted to bind.
        address: String,
        /// The bind error message.
        message: String,
    },

    /// The server stopped with an I/O error.
    #[error("management server error: {0}")]
    Serve(#[source] std::io::Error),
}

type AppState = Arc<Bridge>;

/// Serves the management API on `bind_address` until `shutdown` resolves.
pub async fn serve(bridge: Arc<Bridge>, bind_address: &str, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<(), Error> {
    let addr: SocketAddr = bind_address.parse().map_err(|e| Error::InvalidBindAddress {
        address: bind_address.to_string(),
        message: format!("{e}"),
    })?;

    let listener = TcpListener::bind(&addr).await.map_err(|e| Error::BindFailed {
        address: addr.to_string(),
        message: format!("{e}"),
    })?;

    tracing::info!(%addr, "management HTTP server listening");

    let app = Router::new()
        .route("/api/status", get(status))
        .route("/api/metrics", get(metrics))
        .route("/api/sources", post(add_source))
        .route("/api/sources/from-td", post(add_source_from_td))
        .route("/api/sources/{name}/start", post(start_source))
        .route("/api/sources/{name}/stop", post(stop_source))
        .route("/api/sources/{name}", delete(remove_source))
        .route("/api/sink/test_auth", post(test_sink_auth))
        .route("/api/sink/test_ingest", post(test_sink_ingest))
        .with_state(bridge);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.map_err(Error::Serve)
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            BridgeError::UnknownSource(_) => StatusCode::NOT_FOUND,
            BridgeError::DuplicateSource(_) => StatusCode::CONFLICT,
            BridgeError::InvalidSource(_, _) | BridgeError::Wot(_) => StatusCode::BAD_REQUEST,
            BridgeError::Queue(_) | BridgeError::SpoolKey(_) | BridgeError::Sink(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn status(State(bridge): State<AppState>) -> impl IntoResponse {
    Json(bridge.status().await)
}

async fn metrics(State(bridge): State<AppState>) -> impl IntoResponse {
    Json(bridge.metrics().await)
}

async fn add_source(State(bridge): State<AppState>, Json(definition): Json<config::SourceConfig>) -> Result<StatusCode, BridgeError> {
    bridge.add_source(definition).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
struct FromTdRequest {
    name: String,
    thing_description: String,
}

async fn add_source_from_td(State(bridge): State<AppState>, Json(request): Json<FromTdRequest>) -> Result<impl IntoResponse, BridgeError> {
    let thing = bridge.add_source_from_td(request.name, request.thing_description).await?;
    Ok((StatusCode::CREATED, Json(thing)))
}

async fn start_source(State(bridge): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, BridgeError> {
    bridge.start_source(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_source(State(bridge): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, BridgeError> {
    bridge.stop_source(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_source(State(bridge): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, BridgeError> {
    bridge.remove_source(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_sink_auth(State(bridge): State<AppState>) -> Result<StatusCode, BridgeError> {
    bridge.test_sink_auth().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_sink_ingest(State(bridge): State<AppState>) -> Result<impl IntoResponse, BridgeError> {
    let outcome = bridge.test_sink_ingest().await?;
    Ok(Json(TestIngestResponse {
        accepted: outcome.accepted,
        transient_failure: outcome.transient_failure,
    }))
}

#[derive(Serialize)]
struct TestIngestResponse {
    accepted: usize,
    transient_failure: bool,
}
