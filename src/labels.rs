//! The fixed defect label set.
//!
//! This is the only definition of the six classes. Route handlers, the CLI,
//! the usage counters and the probability vector all index into it, so the
//! names and ordering cannot drift apart.

use serde::{Deserialize, Serialize};

/// Number of defect classes the simulator can predict.
pub const NUM_CLASSES: usize = 6;

/// Surface defect category (NEU steel surface defect classes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectClass {
    Crazing,
    Inclusion,
    Patches,
    Pitted,
    RolledInScale,
    Scratches,
}

impl DefectClass {
    /// All classes in index order.
    pub const ALL: [DefectClass; NUM_CLASSES] = [
        Self::Crazing,
        Self::Inclusion,
        Self::Patches,
        Self::Pitted,
        Self::RolledInScale,
        Self::Scratches,
    ];

    pub fn index(&self) -> usize {
        match self {
            Self::Crazing => 0,
            Self::Inclusion => 1,
            Self::Patches => 2,
            Self::Pitted => 3,
            Self::RolledInScale => 4,
            Self::Scratches => 5,
        }
    }

    /// Display name shown to users, English with the Chinese term.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crazing => "Crazing (裂纹)",
            Self::Inclusion => "Inclusion (夹杂)",
            Self::Patches => "Patches (斑块)",
            Self::Pitted => "Pitted (点蚀)",
            Self::RolledInScale => "Rolled-in Scale (轧制氧化皮)",
            Self::Scratches => "Scratches (划痕)",
        }
    }

    /// English part of the display name.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Crazing => "Crazing",
            Self::Inclusion => "Inclusion",
            Self::Patches => "Patches",
            Self::Pitted => "Pitted",
            Self::RolledInScale => "Rolled-in Scale",
            Self::Scratches => "Scratches",
        }
    }
}

impl std::fmt::Display for DefectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A label as exposed over the API: `{index, name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassLabel {
    pub index: usize,
    pub name: String,
}

impl From<DefectClass> for ClassLabel {
    fn from(class: DefectClass) -> Self {
        Self {
            index: class.index(),
            name: class.as_str().to_string(),
        }
    }
}

/// The full label list in index order.
pub fn class_labels() -> Vec<ClassLabel> {
    DefectClass::ALL.iter().copied().map(ClassLabel::from).collect()
}
