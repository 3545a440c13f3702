//! Axum middleware running the gate before downstream handlers.
//!
//! ```ignore
//! use axum::{middleware, routing::post, Router};
//!
//! let app = Router::new()
//!     .route("/guests", post(create_guest))
//!     .layer(middleware::from_fn_with_state(gate, gate_middleware));
//! ```

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::{Gate, GateDecision};

/// Reject over-limit requests with 429 before any handler runs.
pub async fn gate_middleware(
    State(gate): State<Arc<Gate>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();

    match gate.admit_path(&path).await {
        GateDecision::Continue { .. } => next.run(request).await,
        GateDecision::Reject(backpressure) => {
            let client = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(|value| value.trim().to_string());

            warn!(
                path = %path,
                bucket = %backpressure.bucket,
                client_ip = client.as_deref().unwrap_or("unknown"),
                "Request rejected by rate limiter"
            );
            backpressure.into_response()
        }
    }
}
