//! Standalone HTTP admission service.
//!
//! Collaborators in other processes call `POST /v1/check/{bucket}` once per
//! inbound request and proceed only on 200.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{debug, error, info, instrument};

use super::{Gate, GateDecision};
use crate::error::{BucketgateError, Result};

#[derive(Debug, Serialize)]
struct CheckResponse {
    allowed: bool,
    bucket: String,
    tokens_remaining: u64,
}

/// HTTP server exposing the gate.
pub struct GateServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The gate instance
    gate: Arc<Gate>,
}

impl GateServer {
    pub fn new(addr: SocketAddr, gate: Arc<Gate>) -> Self {
        Self { addr, gate }
    }

    /// Routes served by the admission service.
    pub fn router(gate: Arc<Gate>) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/v1/check/:bucket", post(check_bucket))
            .with_state(gate)
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            default_bucket = %self.gate.resolver().default_bucket(),
            "Starting admission gate server"
        );

        axum::serve(listener, Self::router(self.gate))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "Admission gate server failed");
                BucketgateError::Io(e)
            })
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[instrument(skip(gate))]
async fn check_bucket(State(gate): State<Arc<Gate>>, Path(bucket): Path<String>) -> Response {
    match gate.admit_bucket(&bucket).await {
        GateDecision::Continue {
            bucket,
            tokens_remaining,
        } => Json(CheckResponse {
            allowed: true,
            bucket,
            tokens_remaining,
        })
        .into_response(),
        GateDecision::Reject(backpressure) => {
            debug!(bucket = %backpressure.bucket, "Check denied");
            backpressure.into_response()
        }
    }
}
