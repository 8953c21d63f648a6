//! facegrid-gateway — synchronous HTTP front door for the facegrid pipeline.
//!
//! A request uploads an image, enqueues a job, and blocks until the
//! matching result shows up in the [`CorrelationTable`] or the wait window
//! elapses. The [`ResponseDrainer`] fills the table from the response
//! queue in the background.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/` | Multipart upload (`inputFile`), answers `job_id:label` |
//! | GET | `/healthz` | Liveness, reports unclaimed results |
//!
//! # Status codes for `POST /`
//!
//! | Status | When |
//! |---|---|
//! | 200 | result arrived, body `job_id:label` |
//! | 400 | missing field, empty filename, or unusable filename |
//! | 500 | blob upload or enqueue failed |
//! | 504 | no result within the wait window |

pub mod correlation;
pub mod drainer;
pub mod handlers;

pub use correlation::CorrelationTable;
pub use drainer::{DrainStats, ResponseDrainer};

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};

use facegrid_core::config::GatewayConfig;
use facegrid_core::{BlobStore, QueueService};

/// Shared state for gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    /// Where uploads are stored, keyed by filename.
    pub inputs: Arc<dyn BlobStore>,
    pub requests: Arc<dyn QueueService>,
    pub results: Arc<CorrelationTable>,
    pub settings: Arc<GatewayConfig>,
}

/// Build the gateway router.
pub fn build_router(state: GatewayState) -> Router {
    let body_limit = state.settings.max_upload_bytes;

    Router::new()
        .route("/", post(handlers::submit))
        .route("/healthz", get(handlers::healthz))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
