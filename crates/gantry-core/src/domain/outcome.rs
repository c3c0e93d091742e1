//! Stage and build outcomes with worst-outcome-wins ordering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome of a single stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Skipped,
    Unstable,
    Failed,
}

impl StageOutcome {
    /// Rank used for aggregation. Skipped ranks below success so it never
    /// wins against a stage that actually ran.
    fn rank(self) -> u8 {
        match self {
            StageOutcome::Skipped => 0,
            StageOutcome::Success => 1,
            StageOutcome::Unstable => 2,
            StageOutcome::Failed => 3,
        }
    }

    /// The worse of two outcomes.
    pub fn worst(self, other: StageOutcome) -> StageOutcome {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn is_skipped(self) -> bool {
        self == StageOutcome::Skipped
    }

    pub fn is_failed(self) -> bool {
        self == StageOutcome::Failed
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Success => write!(f, "SUCCESS"),
            StageOutcome::Skipped => write!(f, "SKIPPED"),
            StageOutcome::Unstable => write!(f, "UNSTABLE"),
            StageOutcome::Failed => write!(f, "FAILED"),
        }
    }
}

/// Aggregate status of a whole run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    Unstable,
    Failed,
}

impl BuildOutcome {
    /// Fold stage outcomes: failed > unstable > success. Skipped outcomes do
    /// not contribute, so an empty or all-skipped run is a success.
    pub fn aggregate<I>(outcomes: I) -> BuildOutcome
    where
        I: IntoIterator<Item = StageOutcome>,
    {
        let worst = outcomes
            .into_iter()
            .fold(StageOutcome::Skipped, StageOutcome::worst);
        match worst {
            StageOutcome::Failed => BuildOutcome::Failed,
            StageOutcome::Unstable => BuildOutcome::Unstable,
            StageOutcome::Success | StageOutcome::Skipped => BuildOutcome::Success,
        }
    }
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildOutcome::Success => write!(f, "SUCCESS"),
            BuildOutcome::Unstable => write!(f, "UNSTABLE"),
            BuildOutcome::Failed => write!(f, "FAILED"),
        }
    }
}
