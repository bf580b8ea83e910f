//! Filename keyword heuristics for picking a "plausible" defect class.
//!
//! Keyword sets are checked in priority order and the first set with any
//! substring hit wins. `"line"` appears in both the crazing and the
//! scratches set; crazing is checked first, so the scratches entry never
//! fires. The order is kept exactly as shipped.

use tracing::{debug, warn};

use crate::labels::{DefectClass, NUM_CLASSES};
use crate::random::RandomSource;

/// Keyword sets in match priority order.
pub static KEYWORD_SETS: [(DefectClass, &[&str]); NUM_CLASSES] = [
    (DefectClass::Crazing, &["crack", "裂纹", "line"]),
    (DefectClass::Inclusion, &["inclusion", "夹杂", "spot"]),
    (DefectClass::Patches, &["patch", "斑块", "blob"]),
    (DefectClass::Pitted, &["pit", "点蚀", "hole"]),
    (DefectClass::RolledInScale, &["scale", "氧化", "flake"]),
    (DefectClass::Scratches, &["scratch", "划痕", "line"]),
];

/// How a class was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A keyword in the filename matched.
    Keyword {
        class: DefectClass,
        keyword: &'static str,
    },
    /// No keyword matched; the class was drawn uniformly at random.
    Random(DefectClass),
}

impl Resolution {
    pub fn class(&self) -> DefectClass {
        match *self {
            Self::Keyword { class, .. } => class,
            Self::Random(class) => class,
        }
    }

    pub fn is_keyword(&self) -> bool {
        matches!(self, Self::Keyword { .. })
    }
}

/// First keyword hit for `filename`, without touching any randomness.
pub fn keyword_match(filename: &str) -> Option<(DefectClass, &'static str)> {
    let lowered = filename.to_lowercase();
    KEYWORD_SETS.iter().find_map(|(class, keywords)| {
        keywords
            .iter()
            .find(|kw| lowered.contains(*kw))
            .map(|kw| (*class, *kw))
    })
}

/// Resolve a filename to a class, falling back to a uniform draw.
pub fn resolve(filename: &str, rng: &mut dyn RandomSource) -> Resolution {
    match keyword_match(filename) {
        Some((class, keyword)) => {
            debug!(filename, keyword, class = %class, "resolver: keyword match");
            Resolution::Keyword { class, keyword }
        }
        None => {
            let idx = rng.uniform_int(0, NUM_CLASSES - 1);
            if idx >= NUM_CLASSES {
                warn!(idx, "random source returned an index outside 0..={}; wrapping", NUM_CLASSES - 1);
            }
            let class = DefectClass::ALL[idx % NUM_CLASSES];
            debug!(filename, class = %class, "resolver: no keyword, random class");
            Resolution::Random(class)
        }
    }
}

/// Index-only form of [`resolve`].
pub fn resolve_index(filename: &str, rng: &mut dyn RandomSource) -> usize {
    resolve(filename, rng).class().index()
}
