//! ProbabilityVector: synthesized per-class confidence distribution.

use eyre::{ensure, Result};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::labels::{DefectClass, NUM_CLASSES};
use crate::random::RandomSource;

/// Dirichlet concentration for every class. Values below 1 favour a few
/// dominant components and several near-zero ones.
pub const DIRICHLET_ALPHA: f64 = 0.5;

/// Multiplier applied to the target component before renormalizing.
pub const TARGET_BOOST: f64 = 2.0;

/// Normalized entropy above which a distribution is reported as uncertain.
pub const ENTROPY_UNCERTAIN_THRESHOLD: f64 = 0.85;

/// Probabilities for each defect class, index-aligned with [`DefectClass::ALL`].
///
/// Serializes as a `{label name: probability}` map in label order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityVector([f64; NUM_CLASSES]);

impl ProbabilityVector {
    /// Synthesize a vector skewed towards `target`.
    ///
    /// Draws Dirichlet(0.5, ..), doubles the target component and renormalizes.
    /// The target is the argmax more often than any other class but is not
    /// forced to be: a draw that put most mass elsewhere still wins after
    /// the boost.
    pub fn synthesize(target: DefectClass, rng: &mut dyn RandomSource) -> Result<Self> {
        let mut probs = rng.sample_dirichlet(&[DIRICHLET_ALPHA; NUM_CLASSES])?;
        ensure!(
            probs.len() == NUM_CLASSES,
            "expected {} Dirichlet components, got {}",
            NUM_CLASSES,
            probs.len()
        );

        probs[target.index()] *= TARGET_BOOST;
        Self::from_weights(&probs)
    }

    /// Normalize non-negative weights into a distribution.
    pub fn from_weights(weights: &[f64]) -> Result<Self> {
        ensure!(
            weights.len() == NUM_CLASSES,
            "expected {} weights, got {}",
            NUM_CLASSES,
            weights.len()
        );
        ensure!(
            weights.iter().all(|w| w.is_finite() && *w >= 0.0),
            "weights must be finite and non-negative: {:?}",
            weights
        );
        let total: f64 = weights.iter().sum();
        ensure!(total > 0.0, "weights sum to zero");

        let mut out = [0.0; NUM_CLASSES];
        for (o, w) in out.iter_mut().zip(weights) {
            *o = w / total;
        }
        Ok(Self(out))
    }

    pub fn get(&self, class: DefectClass) -> f64 {
        self.0[class.index()]
    }

    pub fn to_array(&self) -> [f64; NUM_CLASSES] {
        self.0
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Class with the highest probability (lowest index on ties).
    pub fn argmax(&self) -> DefectClass {
        let mut best = 0;
        for (i, &p) in self.0.iter().enumerate() {
            if p > self.0[best] {
                best = i;
            }
        }
        DefectClass::ALL[best]
    }

    /// Shannon entropy normalized to [0, 1].
    ///
    /// - 0.0 = all mass on one class
    /// - 1.0 = uniform across all six classes
    pub fn entropy(&self) -> f64 {
        let max_entropy = (NUM_CLASSES as f64).ln();
        let mut h = 0.0;
        for &p in &self.0 {
            if p > 1e-15 {
                h -= p * p.ln();
            }
        }
        h / max_entropy
    }

    pub fn is_uncertain(&self) -> bool {
        self.entropy() > ENTROPY_UNCERTAIN_THRESHOLD
    }

    /// `(class, probability)` pairs in label order.
    pub fn iter(&self) -> impl Iterator<Item = (DefectClass, f64)> + '_ {
        DefectClass::ALL.iter().copied().zip(self.0.iter().copied())
    }
}

impl Serialize for ProbabilityVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(NUM_CLASSES))?;
        for (class, p) in self.iter() {
            map.serialize_entry(class.as_str(), &p)?;
        }
        map.end()
    }
}
