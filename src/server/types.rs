//! Request/response types and configuration for the defectsim server.

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::detect::{DetectionResult, DetectorConfig};
use crate::labels::ClassLabel;
use crate::preview::ImageSummary;
use crate::scores::ProbabilityVector;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (defaults to 127.0.0.1:5000; use 0.0.0.0 to expose externally)
    pub bind_addr: SocketAddr,
    /// Rate limit in requests per minute per IP (0 = no limit)
    pub rate_limit_rpm: u32,
    /// Path for JSONL access log
    pub access_log_path: String,
    /// Maximum access log file size in bytes before rotation (0 = no limit)
    pub max_access_log_bytes: u64,
    /// Directory for preview thumbnails and the metrics snapshot.
    pub upload_dir: PathBuf,
    /// Largest accepted request body in bytes.
    pub max_upload_bytes: usize,
    /// Maximum number of files in one batch request.
    pub max_batch_files: usize,
    /// Latency range and seeding for the simulator.
    pub detector: DetectorConfig,
}

/// Default upload directory, relative to the working directory.
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            rate_limit_rpm: 60,
            access_log_path: "defectsim-access.jsonl".to_string(),
            max_access_log_bytes: 50 * 1024 * 1024, // 50 MB
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            max_upload_bytes: crate::upload::MAX_CONTENT_LENGTH,
            max_batch_files: 20,
            detector: DetectorConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection responses
// ---------------------------------------------------------------------------

/// Echo of the upload plus whatever the decoder could tell us.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub filename: String,
    /// Size of the byte sample that was read (at most 1 KiB).
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Detection payload as the web UI consumes it.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionData {
    pub defect_type: String,
    pub confidence: f64,
    pub all_probabilities: ProbabilityVector,
    /// Seconds, rounded to milliseconds.
    pub processing_time: f64,
    pub timestamp: String,
    pub image_info: ImageInfo,
    /// Normalized entropy of `all_probabilities` (0 = certain, 1 = uniform).
    pub entropy: f64,
    pub uncertain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_keyword: Option<String>,
}

impl DetectionData {
    pub fn new(result: &DetectionResult, image: Option<&ImageSummary>) -> Self {
        Self {
            defect_type: result.predicted.as_str().to_string(),
            confidence: result.confidence,
            all_probabilities: result.probabilities,
            processing_time: (result.processing_seconds * 1000.0).round() / 1000.0,
            timestamp: result.timestamp.clone(),
            image_info: ImageInfo {
                filename: result.input.filename.clone(),
                size: result.input.byte_length,
                width: image.map(|i| i.width),
                height: image.map(|i| i.height),
                format: image.and_then(|i| i.format.clone()),
            },
            entropy: result.probabilities.entropy(),
            uncertain: result.probabilities.is_uncertain(),
            matched_keyword: result.matched_keyword.map(str::to_string),
        }
    }
}

/// Response for `/api/detect`.
#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DetectionData>,
}

impl DetectResponse {
    pub fn ok(data: DetectionData) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

/// One entry of a batch response.
#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Option<DetectionData>,
}

/// Response for `/api/batch/detect`.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total: usize,
    pub results: Vec<BatchItem>,
}

/// Payload for `/api/preview`.
#[derive(Debug, Serialize)]
pub struct PreviewData {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// `data:image/jpeg;base64,...` thumbnail.
    pub preview: String,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PreviewData>,
}

// ---------------------------------------------------------------------------
// Service responses
// ---------------------------------------------------------------------------

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub message: String,
    pub uptime_seconds: u64,
}

/// Stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub success: bool,
    pub data: StatsData,
}

#[derive(Debug, Serialize)]
pub struct StatsData {
    pub total_requests: u64,
    pub total_errors: u64,
    pub system_status: String,
    pub model_type: String,
    pub accuracy: String,
    pub uptime_seconds: u64,
    /// Predictions per label name.
    pub classifications: BTreeMap<String, u64>,
    pub endpoints: EndpointStats,
    pub simulation: SimulationStats,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub detect: u64,
    pub batch_detect: u64,
    pub preview: u64,
    pub stats: u64,
}

#[derive(Debug, Serialize)]
pub struct SimulationStats {
    pub min_latency_secs: f64,
    pub max_latency_secs: f64,
    pub seed_policy: String,
}

/// Response for `/api/labels`.
#[derive(Debug, Serialize)]
pub struct LabelsResponse {
    pub success: bool,
    pub labels: Vec<ClassLabel>,
}
