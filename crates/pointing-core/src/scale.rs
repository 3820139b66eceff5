// Voting scales: the selectable card values for a session.

use serde::{Deserialize, Serialize};

/// The reserved "unsure / skip" card present on every predefined scale.
pub const UNSURE: &str = "?";

/// The set of values a participant may vote with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingScale {
    pub name: String,
    pub values: Vec<String>,
}

impl VotingScale {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        VotingScale {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Returns `true` if `value` is one of this scale's cards.
    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

// ---------------------------------------------------------------------------
// Predefined scales
// ---------------------------------------------------------------------------

/// A compile-time scale definition.
pub struct ScalePreset {
    pub name: &'static str,
    pub values: &'static [&'static str],
}

impl ScalePreset {
    pub fn to_scale(&self) -> VotingScale {
        VotingScale::new(self.name, self.values)
    }
}

pub const FIBONACCI: ScalePreset = ScalePreset {
    name: "Fibonacci",
    values: &["1", "2", "3", "5", "8", "13", "21", UNSURE],
};

pub const MODIFIED_FIBONACCI: ScalePreset = ScalePreset {
    name: "Modified Fibonacci",
    values: &["0", "1", "2", "3", "5", "8", "13", "20", "40", "100", UNSURE],
};

pub const T_SHIRT_SIZES: ScalePreset = ScalePreset {
    name: "T-Shirt Sizes",
    values: &["XS", "S", "M", "L", "XL", "XXL", UNSURE],
};

pub const POWERS_OF_TWO: ScalePreset = ScalePreset {
    name: "Powers of 2",
    values: &["1", "2", "4", "8", "16", "32", UNSURE],
};

/// All predefined scales, in the order they are offered to a moderator.
pub const PRESETS: [&ScalePreset; 4] = [
    &FIBONACCI,
    &MODIFIED_FIBONACCI,
    &T_SHIRT_SIZES,
    &POWERS_OF_TWO,
];

/// Materialize every predefined scale.
pub fn predefined() -> Vec<VotingScale> {
    PRESETS.iter().map(|p| p.to_scale()).collect()
}

/// Look up a predefined scale by name, ignoring ASCII case.
pub fn find(name: &str) -> Option<VotingScale> {
    let name = name.trim();
    PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .map(|p| p.to_scale())
}

impl Default for VotingScale {
    fn default() -> Self {
        FIBONACCI.to_scale()
    }
}
