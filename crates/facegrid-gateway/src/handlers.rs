//! Gateway HTTP handlers.
//!
//! Bodies are short plain-text messages; internal error detail only goes
//! to the log.

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{error, info, warn};

use facegrid_core::{RESPONSE_SEPARATOR, RequestMessage, ResponseMessage, job_id_from_filename};

use crate::GatewayState;

/// Header carrying the number of unclaimed results on `/healthz`.
pub const PENDING_RESULTS_HEADER: &str = "x-pending-results";

struct Upload {
    filename: Option<String>,
    data: Bytes,
}

/// Find the upload field and read it fully. Other fields are skipped.
async fn read_upload(
    multipart: &mut Multipart,
    field_name: &str,
) -> Result<Option<Upload>, MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(field_name) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let data = field.bytes().await?;
        return Ok(Some(Upload { filename, data }));
    }
    Ok(None)
}

fn reply(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

/// POST /
pub async fn submit(State(state): State<GatewayState>, mut multipart: Multipart) -> Response {
    let field_name = state.settings.upload_field.as_str();

    let upload = match read_upload(&mut multipart, field_name).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            warn!(field = %field_name, "request missing upload field");
            return reply(StatusCode::BAD_REQUEST, format!("Missing {field_name}"));
        }
        Err(e) => {
            warn!(error = %e, "unreadable multipart body");
            return reply(StatusCode::BAD_REQUEST, "Malformed upload");
        }
    };

    let Some(filename) = upload.filename.filter(|name| !name.is_empty()) else {
        warn!("uploaded file has no filename");
        return reply(StatusCode::BAD_REQUEST, "Empty filename");
    };

    let job_id = job_id_from_filename(&filename);
    if job_id.contains(RESPONSE_SEPARATOR) {
        // The response `job_id:label` would split in the wrong place.
        warn!(%filename, "filename stem contains the response separator");
        return reply(
            StatusCode::BAD_REQUEST,
            format!("Filename must not contain '{RESPONSE_SEPARATOR}'"),
        );
    }

    let started = Instant::now();
    info!(%job_id, %filename, bytes = upload.data.len(), "upload received");

    if let Err(e) = state.inputs.put(&filename, upload.data).await {
        error!(%job_id, error = %e, "blob upload failed");
        return reply(StatusCode::INTERNAL_SERVER_ERROR, "Failed to upload file");
    }

    let request = RequestMessage::new(filename);
    if let Err(e) = state.requests.send(request.body()).await {
        // The uploaded blob stays behind; nothing cleans it up.
        error!(%job_id, queue = %state.requests.name(), error = %e, "enqueue failed");
        return reply(StatusCode::INTERNAL_SERVER_ERROR, "Failed to enqueue job");
    }

    let settings = &state.settings;
    match state
        .results
        .wait_for(&job_id, settings.poll_interval, settings.result_wait)
        .await
    {
        Some(label) => {
            let response = ResponseMessage::new(job_id, label);
            info!(
                job_id = %response.job_id,
                label = %response.label,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "returning result"
            );
            reply(StatusCode::OK, response.body())
        }
        None => {
            error!(
                %job_id,
                wait_secs = settings.result_wait.as_secs(),
                "timed out waiting for result"
            );
            reply(
                StatusCode::GATEWAY_TIMEOUT,
                "Timeout waiting for recognition result",
            )
        }
    }
}

/// GET /healthz
pub async fn healthz(State(state): State<GatewayState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(PENDING_RESULTS_HEADER, state.results.len().to_string())],
        "ok",
    )
}
