//! Injectable randomness for the simulator.
//!
//! The resolver, the synthesizer and the latency draw all take a
//! [`RandomSource`] instead of touching a process-wide generator. Each request
//! gets its own source from a [`SourceFactory`], so nothing is reseeded
//! concurrently and tests can swap in a fixed seed or a scripted source.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, eyre, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma};

/// Modulus applied to wall-clock seconds under [`SeedPolicy::Clock`].
pub const CLOCK_SEED_MODULUS: u64 = 10_000;

/// Source of the random draws the simulator needs.
pub trait RandomSource: Send {
    /// Draw one sample from a Dirichlet distribution with the given
    /// concentration parameters. The result has the same length as
    /// `concentrations` and sums to 1.
    fn sample_dirichlet(&mut self, concentrations: &[f64]) -> Result<Vec<f64>>;

    /// Uniform integer in `low..=high`.
    fn uniform_int(&mut self, low: usize, high: usize) -> usize;

    /// Uniform float in `low..=high`.
    fn uniform_f64(&mut self, low: f64, high: f64) -> f64;
}

/// How request-scoped generators are seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedPolicy {
    /// Fresh OS entropy for every request.
    #[default]
    Entropy,
    /// Reseed from `unix_seconds % 10000` before every Dirichlet draw.
    /// Requests within the same second produce the same probabilities.
    Clock,
    /// Deterministic: request `n` is seeded with `seed + n`.
    Fixed(u64),
}

impl FromStr for SeedPolicy {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let lowered = s.to_ascii_lowercase();
        match lowered.as_str() {
            "entropy" | "random" => return Ok(Self::Entropy),
            "clock" | "time" => return Ok(Self::Clock),
            _ => {}
        }
        let raw = lowered.strip_prefix("fixed:").unwrap_or(lowered.as_str());
        raw.parse::<u64>()
            .map(Self::Fixed)
            .map_err(|_| eyre!("invalid seed policy '{}': expected entropy, clock, or fixed:<u64>", s))
    }
}

impl std::fmt::Display for SeedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entropy => f.write_str("entropy"),
            Self::Clock => f.write_str("clock"),
            Self::Fixed(seed) => write!(f, "fixed:{seed}"),
        }
    }
}

fn clock_seed() -> u64 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs % CLOCK_SEED_MODULUS
}

/// [`RandomSource`] backed by a seedable [`StdRng`].
pub struct SeededSource {
    rng: StdRng,
    /// When set, the generator is reseeded from this before every Dirichlet draw.
    reseed_from: Option<fn() -> u64>,
}

impl SeededSource {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            reseed_from: None,
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            reseed_from: None,
        }
    }

    pub fn from_clock() -> Self {
        Self::reseeding_from(clock_seed)
    }

    /// Like [`SeededSource::from_clock`], with the seed read from `seed_fn`.
    pub fn reseeding_from(seed_fn: fn() -> u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed_fn()),
            reseed_from: Some(seed_fn),
        }
    }
}

impl RandomSource for SeededSource {
    fn sample_dirichlet(&mut self, concentrations: &[f64]) -> Result<Vec<f64>> {
        if concentrations.is_empty() {
            bail!("Dirichlet needs at least one concentration parameter");
        }
        if let Some(seed_fn) = self.reseed_from {
            self.rng = StdRng::seed_from_u64(seed_fn());
        }

        // Normalized independent Gamma(alpha_i, 1) draws are Dirichlet(alpha).
        let mut draws = Vec::with_capacity(concentrations.len());
        for &alpha in concentrations {
            let gamma = Gamma::new(alpha, 1.0)
                .map_err(|e| eyre!("invalid concentration {}: {}", alpha, e))?;
            draws.push(gamma.sample(&mut self.rng));
        }

        let total: f64 = draws.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            bail!("degenerate Dirichlet draw (sum = {})", total);
        }
        for d in &mut draws {
            *d /= total;
        }
        Ok(draws)
    }

    fn uniform_int(&mut self, low: usize, high: usize) -> usize {
        if low >= high {
            return low;
        }
        self.rng.random_range(low..=high)
    }

    fn uniform_f64(&mut self, low: f64, high: f64) -> f64 {
        if low >= high {
            return low;
        }
        self.rng.random_range(low..=high)
    }
}

/// Hands out one [`RandomSource`] per request.
pub trait SourceFactory: Send + Sync {
    fn create(&self) -> Box<dyn RandomSource>;
}

impl<F> SourceFactory for F
where
    F: Fn() -> Box<dyn RandomSource> + Send + Sync,
{
    fn create(&self) -> Box<dyn RandomSource> {
        self()
    }
}

/// Factory that seeds each source according to a [`SeedPolicy`].
pub struct PolicySourceFactory {
    policy: SeedPolicy,
    issued: AtomicU64,
}

impl PolicySourceFactory {
    pub fn new(policy: SeedPolicy) -> Self {
        Self {
            policy,
            issued: AtomicU64::new(0),
        }
    }
}

impl SourceFactory for PolicySourceFactory {
    fn create(&self) -> Box<dyn RandomSource> {
        match self.policy {
            SeedPolicy::Entropy => Box::new(SeededSource::from_entropy()),
            SeedPolicy::Clock => Box::new(SeededSource::from_clock()),
            SeedPolicy::Fixed(seed) => {
                let n = self.issued.fetch_add(1, Ordering::Relaxed);
                Box::new(SeededSource::from_seed(seed.wrapping_add(n)))
            }
        }
    }
}
