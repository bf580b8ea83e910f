//! Result assembly and simulated inference latency.

use std::time::{Duration, Instant};

use eyre::{bail, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::DetectError;
use crate::labels::DefectClass;
use crate::random::{RandomSource, SeedPolicy};
use crate::resolver::Resolution;
use crate::scores::ProbabilityVector;

/// What the simulator sees of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationInput {
    pub filename: String,
    pub byte_length: usize,
}

/// Uniform range, in seconds, for the simulated inference delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyRange {
    min_secs: f64,
    max_secs: f64,
}

impl LatencyRange {
    /// Range used by the upload endpoint.
    pub const DEFAULT: LatencyRange = LatencyRange {
        min_secs: 0.5,
        max_secs: 2.0,
    };

    /// Shorter profile of the standalone model simulation.
    pub const MODEL_PROFILE: LatencyRange = LatencyRange {
        min_secs: 0.3,
        max_secs: 1.2,
    };

    pub const NONE: LatencyRange = LatencyRange {
        min_secs: 0.0,
        max_secs: 0.0,
    };

    pub fn new(min_secs: f64, max_secs: f64) -> Result<Self> {
        if !min_secs.is_finite() || !max_secs.is_finite() {
            bail!("latency bounds must be finite (got {}..{})", min_secs, max_secs);
        }
        if min_secs < 0.0 {
            bail!("minimum latency must be >= 0 (got {})", min_secs);
        }
        if min_secs > max_secs {
            bail!(
                "minimum latency {} exceeds maximum latency {}",
                min_secs,
                max_secs
            );
        }
        Ok(Self { min_secs, max_secs })
    }

    pub fn min_secs(&self) -> f64 {
        self.min_secs
    }

    pub fn max_secs(&self) -> f64 {
        self.max_secs
    }

    fn draw(&self, rng: &mut dyn RandomSource) -> Duration {
        Duration::from_secs_f64(rng.uniform_f64(self.min_secs, self.max_secs))
    }
}

impl Default for LatencyRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Simulator settings shared by the server and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DetectorConfig {
    pub latency: LatencyRange,
    pub seed_policy: SeedPolicy,
}

/// One simulated classification.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub predicted: DefectClass,
    /// Always `probabilities.get(predicted)`.
    pub confidence: f64,
    pub probabilities: ProbabilityVector,
    /// Wall-clock time around the whole simulation, sleep included.
    pub processing_seconds: f64,
    /// RFC 3339 completion time.
    pub timestamp: String,
    pub input: ClassificationInput,
    /// Filename keyword that decided the class, if any.
    pub matched_keyword: Option<&'static str>,
}

/// Runs resolve, simulated latency and synthesis for one upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detector {
    latency: LatencyRange,
}

impl Detector {
    pub fn new(latency: LatencyRange) -> Self {
        Self { latency }
    }

    pub fn latency(&self) -> LatencyRange {
        self.latency
    }

    /// Simulate one detection.
    ///
    /// If `shutdown` flips to `true` during the delay the call is abandoned
    /// with an error.
    pub async fn detect(
        &self,
        input: &ClassificationInput,
        rng: &mut dyn RandomSource,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<DetectionResult> {
        let start = Instant::now();

        let delay = self.latency.draw(rng);
        match shutdown {
            Some(mut rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    Ok(_) = rx.wait_for(|stop| *stop) => bail!("server is shutting down"),
                }
            }
            None => tokio::time::sleep(delay).await,
        }

        let (resolution, probabilities) = crate::simulate(&input.filename, rng)?;
        let predicted = resolution.class();
        let confidence = probabilities.get(predicted);

        let result = DetectionResult {
            predicted,
            confidence,
            probabilities,
            processing_seconds: start.elapsed().as_secs_f64(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            input: input.clone(),
            matched_keyword: match resolution {
                Resolution::Keyword { keyword, .. } => Some(keyword),
                Resolution::Random(_) => None,
            },
        };

        info!(
            filename = %input.filename,
            defect_type = %predicted,
            confidence = format_args!("{:.1}%", confidence * 100.0),
            processing_seconds = result.processing_seconds,
            "detection complete"
        );

        Ok(result)
    }

    /// [`Detector::detect`] behind a fault boundary.
    ///
    /// Runs the simulation on its own task so that errors and panics alike
    /// come back as [`DetectError::ProcessingFailure`].
    pub async fn detect_guarded(
        &self,
        input: ClassificationInput,
        mut rng: Box<dyn RandomSource>,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> std::result::Result<DetectionResult, DetectError> {
        let detector = *self;
        let filename = input.filename.clone();
        let task = tokio::spawn(async move { detector.detect(&input, rng.as_mut(), shutdown).await });

        match task.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                warn!(filename = %filename, error = %e, "detection failed");
                Err(e.into())
            }
            Err(e) => {
                warn!(filename = %filename, error = %e, "detection task aborted");
                Err(DetectError::ProcessingFailure(format!(
                    "detection task aborted: {}",
                    e
                )))
            }
        }
    }
}
