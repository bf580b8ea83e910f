//! HTTP endpoint handler functions.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::DetectError;
use crate::labels::{class_labels, DefectClass};
use crate::preview::{self, ImageSummary};

use super::logging::RecordEvent;
use super::types::*;
use super::ServerState;

/// Multipart field carrying a single upload.
const FILE_FIELD: &str = "file";
/// Multipart field carrying batch uploads.
const FILES_FIELD: &str = "files";

/// HTTP status for each error kind.
pub fn status_for(err: &DetectError) -> StatusCode {
    if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

// ---------------------------------------------------------------------------
// Upload extraction
// ---------------------------------------------------------------------------

struct Upload {
    filename: String,
    bytes: Bytes,
}

/// Collect every file part whose field name is in `fields`.
async fn read_uploads(
    multipart: Result<Multipart, MultipartRejection>,
    fields: &[&str],
) -> Result<Vec<Upload>, DetectError> {
    let mut multipart = multipart.map_err(|e| {
        debug!(error = %e, "request is not a multipart upload");
        DetectError::no_file()
    })?;

    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DetectError::MalformedUpload(e.to_string()))?
    {
        let is_file_field = field.name().map(|n| fields.contains(&n)).unwrap_or(false);
        if !is_file_field {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| DetectError::MalformedUpload(e.to_string()))?;
        uploads.push(Upload { filename, bytes });
    }
    Ok(uploads)
}

// ---------------------------------------------------------------------------
// Shared detection logic
// ---------------------------------------------------------------------------

/// Decode the upload (advisory) and refresh the stored preview.
async fn summarize_upload(state: &Arc<ServerState>, bytes: Bytes) -> Option<ImageSummary> {
    let state = Arc::clone(state);
    let outcome = tokio::task::spawn_blocking(move || {
        let (img, summary) = preview::inspect(&bytes)?;
        if state.previews.is_enabled() {
            if let Err(e) = state.previews.save_latest(&img) {
                warn!(error = %e, "failed to save preview");
            }
        }
        Ok::<_, eyre::Report>(summary)
    })
    .await;

    match outcome {
        Ok(Ok(summary)) => Some(summary),
        Ok(Err(e)) => {
            debug!(error = %e, "upload did not decode as an image; classifying anyway");
            None
        }
        Err(e) => {
            warn!(error = %e, "image inspection task failed");
            None
        }
    }
}

async fn detect_upload(
    state: &Arc<ServerState>,
    upload: Upload,
    endpoint: &str,
) -> Result<DetectionData, DetectError> {
    let input = crate::upload::classification_input(&upload.filename, &upload.bytes)?;
    let summary = summarize_upload(state, upload.bytes).await;

    let rng = state.sources.create();
    let result = state
        .detector
        .detect_guarded(input, rng, Some(state.shutdown.subscribe()))
        .await?;

    state.usage.record(&RecordEvent {
        endpoint,
        filename: &result.input.filename,
        class: result.predicted,
        confidence: result.confidence,
        processing_time_ms: (result.processing_seconds * 1000.0) as u64,
    });

    Ok(DetectionData::new(&result, summary.as_ref()))
}

fn rate_limited_message(state: &ServerState) -> String {
    format!(
        "Rate limit exceeded. Maximum {} requests per minute.",
        state.config.rate_limit_rpm
    )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn detect_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    multipart: Result<Multipart, MultipartRejection>,
) -> impl IntoResponse {
    state.usage.ep_detect.fetch_add(1, Ordering::Relaxed);

    if super::middleware::is_rate_limited(&state.config, &state.rate_limiters, addr.ip()).await {
        state.usage.record_error("detect", "rate_limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(DetectResponse::failure(rate_limited_message(&state))),
        );
    }

    let outcome = match read_uploads(multipart, &[FILE_FIELD]).await {
        Ok(uploads) => match uploads.into_iter().next() {
            Some(upload) => detect_upload(&state, upload, "detect").await,
            None => Err(DetectError::no_file()),
        },
        Err(e) => Err(e),
    };

    match outcome {
        Ok(data) => (StatusCode::OK, Json(DetectResponse::ok(data))),
        Err(e) => {
            state.usage.record_error("detect", e.kind());
            (status_for(&e), Json(DetectResponse::failure(e.to_string())))
        }
    }
}

pub async fn batch_detect_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    multipart: Result<Multipart, MultipartRejection>,
) -> impl IntoResponse {
    state.usage.ep_batch_detect.fetch_add(1, Ordering::Relaxed);

    let failure = |status: StatusCode, error: String| {
        (
            status,
            Json(BatchResponse {
                success: false,
                error: Some(error),
                total: 0,
                results: Vec::new(),
            }),
        )
    };

    if super::middleware::is_rate_limited(&state.config, &state.rate_limiters, addr.ip()).await {
        state.usage.record_error("batch_detect", "rate_limited");
        return failure(StatusCode::TOO_MANY_REQUESTS, rate_limited_message(&state));
    }

    let uploads = match read_uploads(multipart, &[FILES_FIELD, FILE_FIELD]).await {
        Ok(u) if u.is_empty() => {
            state.usage.record_error("batch_detect", "input_missing");
            return failure(StatusCode::BAD_REQUEST, DetectError::no_file().to_string());
        }
        Ok(u) => u,
        Err(e) => {
            state.usage.record_error("batch_detect", e.kind());
            return failure(status_for(&e), e.to_string());
        }
    };

    if uploads.len() > state.config.max_batch_files {
        state.usage.record_error("batch_detect", "too_many_files");
        return failure(
            StatusCode::BAD_REQUEST,
            format!(
                "Too many files: {} (maximum {} per batch)",
                uploads.len(),
                state.config.max_batch_files
            ),
        );
    }

    let total = uploads.len();
    let mut results: Vec<BatchItem> = uploads
        .iter()
        .map(|u| BatchItem {
            filename: u.filename.clone(),
            success: false,
            error: Some("detection task aborted".to_string()),
            data: None,
        })
        .collect();

    let mut tasks = JoinSet::new();
    for (idx, upload) in uploads.into_iter().enumerate() {
        let state = Arc::clone(&state);
        tasks.spawn(async move { (idx, detect_upload(&state, upload, "batch_detect").await) });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, Ok(data))) => {
                results[idx].success = true;
                results[idx].error = None;
                results[idx].data = Some(data);
            }
            Ok((idx, Err(e))) => {
                state.usage.record_error("batch_detect", e.kind());
                results[idx].error = Some(e.to_string());
            }
            Err(e) => {
                state.usage.record_error("batch_detect", "processing_failure");
                warn!(error = %e, "batch detection task failed");
            }
        }
    }

    (
        StatusCode::OK,
        Json(BatchResponse {
            success: true,
            error: None,
            total,
            results,
        }),
    )
}

pub async fn preview_handler(
    State(state): State<Arc<ServerState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> impl IntoResponse {
    state.usage.ep_preview.fetch_add(1, Ordering::Relaxed);

    let failure = |err: DetectError| {
        (
            status_for(&err),
            Json(PreviewResponse {
                success: false,
                error: Some(err.to_string()),
                data: None,
            }),
        )
    };

    let upload = match read_uploads(multipart, &[FILE_FIELD]).await {
        Ok(uploads) => match uploads.into_iter().next() {
            Some(u) => u,
            None => return failure(DetectError::no_file()),
        },
        Err(e) => return failure(e),
    };
    if let Err(e) = crate::upload::validate_filename(&upload.filename) {
        return failure(e);
    }

    let bytes = upload.bytes;
    let rendered = tokio::task::spawn_blocking(move || {
        let (img, summary) = preview::inspect(&bytes)?;
        let url = preview::thumbnail_data_url(&img)?;
        Ok::<_, eyre::Report>((summary, url))
    })
    .await;

    match rendered {
        Ok(Ok((summary, url))) => (
            StatusCode::OK,
            Json(PreviewResponse {
                success: true,
                error: None,
                data: Some(PreviewData {
                    filename: upload.filename,
                    width: summary.width,
                    height: summary.height,
                    format: summary.format,
                    preview: url,
                }),
            }),
        ),
        Ok(Err(e)) => failure(DetectError::UnsupportedFormat(format!("{:#}", e))),
        Err(e) => failure(DetectError::ProcessingFailure(e.to_string())),
    }
}

pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: format!("{} (simulation)", env!("CARGO_PKG_VERSION")),
        message: "Service running; detections are simulated".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

pub async fn stats_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.usage.ep_stats.fetch_add(1, Ordering::Relaxed);

    let classifications = DefectClass::ALL
        .iter()
        .map(|c| (c.as_str().to_string(), state.usage.class_count(*c)))
        .collect();
    let latency = state.detector.latency();

    Json(StatsResponse {
        success: true,
        data: StatsData {
            total_requests: state.usage.total_requests.load(Ordering::Relaxed),
            total_errors: state.usage.total_errors.load(Ordering::Relaxed),
            system_status: "running".to_string(),
            model_type: "simulation".to_string(),
            accuracy: "N/A (simulation mode)".to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            classifications,
            endpoints: EndpointStats {
                detect: state.usage.ep_detect.load(Ordering::Relaxed),
                batch_detect: state.usage.ep_batch_detect.load(Ordering::Relaxed),
                preview: state.usage.ep_preview.load(Ordering::Relaxed),
                stats: state.usage.ep_stats.load(Ordering::Relaxed),
            },
            simulation: SimulationStats {
                min_latency_secs: latency.min_secs(),
                max_latency_secs: latency.max_secs(),
                seed_policy: state.config.detector.seed_policy.to_string(),
            },
        },
    })
}

pub async fn labels_handler() -> impl IntoResponse {
    Json(LabelsResponse {
        success: true,
        labels: class_labels(),
    })
}
