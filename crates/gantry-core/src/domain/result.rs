//! Stage results and the append-only run log.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::outcome::{BuildOutcome, StageOutcome};

/// Result of one finished stage. Parallel groups carry their children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Terminal outcome after gates were applied.
    pub outcome: StageOutcome,

    /// Wall-clock duration in milliseconds (0 for skipped stages).
    pub duration_ms: u64,

    /// Metrics captured by post-actions, e.g. `coverage` → 78.0.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,

    /// Body exit code, when the body was a process that exited.
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    /// Warnings and explanations attached while the stage ran.
    #[serde(default)]
    pub annotations: Vec<String>,

    /// Results of parallel children (empty for leaf stages).
    #[serde(default)]
    pub children: Vec<StageResult>,
}

impl StageResult {
    /// A stage whose precondition did not hold.
    pub fn skipped(stage_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            outcome: StageOutcome::Skipped,
            duration_ms: 0,
            metrics: BTreeMap::new(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            annotations: vec![reason.into()],
            children: Vec::new(),
        }
    }

    /// A leaf stage result with the given outcome and nothing captured yet.
    pub fn new(stage_name: impl Into<String>, outcome: StageOutcome, duration_ms: u64) -> Self {
        Self {
            stage_name: stage_name.into(),
            outcome,
            duration_ms,
            metrics: BTreeMap::new(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            annotations: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A parallel group result. Its outcome is the worst of its children.
    pub fn group(stage_name: impl Into<String>, children: Vec<StageResult>, duration_ms: u64) -> Self {
        let outcome = children
            .iter()
            .map(|c| c.outcome)
            .fold(StageOutcome::Skipped, StageOutcome::worst);
        Self {
            children,
            ..Self::new(stage_name, outcome, duration_ms)
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Depth-first search through this result and its children.
    pub fn find(&self, name: &str) -> Option<&StageResult> {
        if self.stage_name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}

/// Ordered, append-only log of finished stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunLog {
    entries: Vec<StageResult>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finished stage. Entries are never modified afterwards.
    pub fn append(&mut self, result: StageResult) {
        self.entries.push(result);
    }

    pub fn entries(&self) -> &[StageResult] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find a stage by name, including parallel children.
    pub fn find(&self, name: &str) -> Option<&StageResult> {
        self.entries.iter().find_map(|e| e.find(name))
    }

    /// Worst-outcome-wins aggregate over the top-level entries.
    pub fn outcome(&self) -> BuildOutcome {
        BuildOutcome::aggregate(self.entries.iter().map(|e| e.outcome))
    }

    pub fn into_entries(self) -> Vec<StageResult> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_carries_reason() {
        let r = StageResult::skipped("Deploy", "container-engine absent");
        assert_eq!(r.outcome, StageOutcome::Skipped);
        assert_eq!(r.duration_ms, 0);
        assert_eq!(r.annotations, vec!["container-engine absent".to_string()]);
    }

    #[test]
    fn test_group_outcome_is_worst_child() {
        let group = StageResult::group(
            "Quality",
            vec![
                StageResult::new("Lint", StageOutcome::Success, 10),
                StageResult::new("Security", StageOutcome::Failed, 20),
            ],
            20,
        );
        assert_eq!(group.outcome, StageOutcome::Failed);
        assert_eq!(group.children.len(), 2);
    }

    #[test]
    fn test_group_of_skipped_children_is_skipped() {
        let group = StageResult::group(
            "Images",
            vec![StageResult::skipped("Build", "no engine")],
            0,
        );
        assert_eq!(group.outcome, StageOutcome::Skipped);
    }

    #[test]
    fn test_run_log_find_descends_into_children() {
        let mut log = RunLog::new();
        log.append(StageResult::group(
            "Quality",
            vec![StageResult::new("Lint", StageOutcome::Success, 5)],
            5,
        ));
        assert_eq!(log.len(), 1);
        assert!(log.find("Lint").is_some());
        assert!(log.find("Missing").is_none());
    }

    #[test]
    fn test_run_log_outcome() {
        let mut log = RunLog::new();
        log.append(StageResult::new("Lint", StageOutcome::Success, 1));
        log.append(StageResult::new("Test", StageOutcome::Unstable, 1));
        log.append(StageResult::skipped("Deploy", "branch"));
        assert_eq!(log.outcome(), BuildOutcome::Unstable);
    }
}
