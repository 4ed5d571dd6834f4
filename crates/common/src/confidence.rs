// The confidence ladder reported by callers of multi-step tools.
//
// One enum is used everywhere a confidence value crosses a boundary (wire
// params, workflow state, gate evaluation) so schema and validation agree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered from least to most certain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Exploring,
    Low,
    Medium,
    High,
    VeryHigh,
    AlmostCertain,
    Certain,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown confidence `{0}` (expected one of: exploring, low, medium, high, very_high, almost_certain, certain)")]
pub struct ConfidenceParseError(pub String);

impl Confidence {
    pub const ALL: [Confidence; 7] = [
        Self::Exploring,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::VeryHigh,
        Self::AlmostCertain,
        Self::Certain,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exploring => "exploring",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very_high",
            Self::AlmostCertain => "almost_certain",
            Self::Certain => "certain",
        }
    }

    /// Levels at which a finished workflow may skip expert analysis.
    pub const fn permits_expert_skip(self) -> bool {
        matches!(self, Self::AlmostCertain | Self::Certain)
    }
}

impl FromStr for Confidence {
    type Err = ConfidenceParseError;

    /// Accepts exactly the wire names, like `Deserialize`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == value)
            .ok_or_else(|| ConfidenceParseError(value.to_string()))
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
