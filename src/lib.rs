//! defectsim: a simulated steel surface defect classifier.
//!
//! Accepts image uploads and returns a plausible-looking classification over
//! six NEU surface defect classes:
//! - **Crazing**, **Inclusion**, **Patches**, **Pitted**, **Rolled-in Scale**, **Scratches**
//!
//! No pixels are analysed. The predicted class comes from filename keywords
//! (falling back to a uniform draw), and the confidence distribution is a
//! Dirichlet sample boosted towards that class. A random delay stands in for
//! inference time. This is demo and teaching material, not an inspector.
//!
//! Uses structured logging via [`tracing`]. Set the `RUST_LOG` environment
//! variable to control log verbosity (e.g., `RUST_LOG=defectsim=debug`).

pub mod detect;
pub mod error;
pub mod labels;
pub mod preview;
pub mod random;
pub mod resolver;
pub mod scores;
pub mod server;
pub mod ui;
pub mod upload;

use eyre::Result;

use crate::random::RandomSource;
use crate::resolver::Resolution;
use crate::scores::ProbabilityVector;

pub use crate::detect::{ClassificationInput, DetectionResult, Detector, DetectorConfig, LatencyRange};
pub use crate::error::DetectError;
pub use crate::labels::{DefectClass, NUM_CLASSES};

/// Resolve a class from `filename` and synthesize its probability vector.
///
/// This is the simulation without the latency or timing around it.
pub fn simulate(filename: &str, rng: &mut dyn RandomSource) -> Result<(Resolution, ProbabilityVector)> {
    let resolution = resolver::resolve(filename, rng);
    let probabilities = ProbabilityVector::synthesize(resolution.class(), rng)?;

    tracing::debug!(
        filename,
        class = %resolution.class(),
        keyword_match = resolution.is_keyword(),
        argmax = %probabilities.argmax(),
        entropy = probabilities.entropy(),
        "simulate: resolved class and synthesized probabilities"
    );

    Ok((resolution, probabilities))
}
