//! Structured lifecycle events for pipeline runs.
//!
//! Every event carries an `event` field (`run.started`, `stage.finished`,
//! ...) so JSON log consumers can filter on it. Stage events are emitted
//! inside the span returned by [`run_span`].

use tracing::{info, warn};

use crate::domain::outcome::{BuildOutcome, StageOutcome};

/// Run-scoped span. Async callers attach it with `Instrument::instrument`.
pub fn run_span(run_id: &str, branch: &str) -> tracing::Span {
    tracing::info_span!("gantry.run", run_id = %run_id, branch = %branch)
}

pub fn emit_run_started(run_id: &str, pipeline: &str, stage_count: usize) {
    info!(event = "run.started", run_id = %run_id, pipeline = %pipeline, stage_count);
}

pub fn emit_run_finished(run_id: &str, outcome: BuildOutcome, duration_ms: u64, timed_out: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        outcome = %outcome,
        duration_ms,
        timed_out,
    );
}

pub fn emit_capability_probed(name: &str, present: bool, version: Option<&str>) {
    info!(
        event = "capability.probed",
        capability = %name,
        present,
        version = version.unwrap_or("-"),
    );
}

pub fn emit_stage_started(stage: &str) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_skipped(stage: &str, reason: &str) {
    info!(event = "stage.skipped", stage = %stage, reason = %reason);
}

pub fn emit_stage_finished(stage: &str, outcome: StageOutcome, duration_ms: u64) {
    if outcome.is_failed() {
        warn!(event = "stage.finished", stage = %stage, outcome = %outcome, duration_ms);
    } else {
        info!(event = "stage.finished", stage = %stage, outcome = %outcome, duration_ms);
    }
}

pub fn emit_gate_evaluated(stage: &str, rules: usize, violations: usize) {
    info!(
        event = "gate.evaluated",
        stage = %stage,
        rules,
        violations,
        passed = violations == 0,
    );
}

pub fn emit_archive_completed(destination: &str, archived: usize, unmatched: usize) {
    info!(
        event = "archive.completed",
        destination = %destination,
        archived,
        unmatched,
    );
}

pub fn emit_health_attempt(url: &str, attempt: u32, healthy: bool, detail: &str) {
    info!(
        event = "health.attempt",
        url = %url,
        attempt,
        healthy,
        detail = %detail,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_stage_finished_carries_outcome() {
        emit_stage_finished("Test", StageOutcome::Unstable, 1200);
        assert!(logs_contain("stage.finished"));
        assert!(logs_contain("UNSTABLE"));
    }

    #[traced_test]
    #[test]
    fn test_run_events_inside_span() {
        let _guard = run_span("run-123", "feature/x").entered();
        emit_run_started("run-123", "etl-api", 7);
        emit_run_finished("run-123", BuildOutcome::Success, 42, false);
        assert!(logs_contain("run.started"));
        assert!(logs_contain("run.finished"));
        assert!(logs_contain("run-123"));
    }

    #[traced_test]
    #[test]
    fn test_capability_without_version() {
        emit_capability_probed("container-engine", false, None);
        assert!(logs_contain("capability.probed"));
        assert!(logs_contain("present=false"));
    }
}
