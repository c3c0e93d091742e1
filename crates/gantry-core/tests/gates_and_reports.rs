//! Coverage and severity reports flowing into gate verdicts.

use gantry_core::{
    evaluate_gates, read_coverage_percent, read_severity_report, GateRule, GateSeverity,
    ReportRead, StageOutcome,
};
use std::collections::BTreeMap;
use std::path::Path;

fn coverage_xml(line_rate: &str) -> String {
    format!(
        r#"<?xml version="1.0" ?>
<coverage version="7.4.0" lines-valid="200" line-rate="{line_rate}" branch-rate="0">
  <sources><source>/app</source></sources>
</coverage>"#
    )
}

/// Mirrors the pipeline's collect step: parsed value or 0 when unreadable.
fn coverage_metrics(path: &Path) -> BTreeMap<String, f64> {
    let value = read_coverage_percent(path).parsed().unwrap_or(0.0);
    BTreeMap::from([("coverage".to_string(), value)])
}

#[test]
fn coverage_082_passes_threshold_70() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coverage.xml");
    std::fs::write(&path, coverage_xml("0.82")).unwrap();

    let verdict = evaluate_gates(&[GateRule::at_least("coverage", 70.0)], &coverage_metrics(&path));
    assert!(verdict.passed());
    assert_eq!(verdict.apply(StageOutcome::Success), StageOutcome::Success);
}

#[test]
fn coverage_065_makes_stage_unstable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coverage.xml");
    std::fs::write(&path, coverage_xml("0.65")).unwrap();

    let verdict = evaluate_gates(&[GateRule::at_least("coverage", 70.0)], &coverage_metrics(&path));
    assert_eq!(verdict.apply(StageOutcome::Success), StageOutcome::Unstable);
}

#[test]
fn missing_or_corrupt_coverage_always_fails_gate() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.xml");
    let corrupt = dir.path().join("corrupt.xml");
    std::fs::write(&corrupt, "<coverage line-rate=").unwrap();

    assert_eq!(read_coverage_percent(&missing), ReportRead::Missing);
    assert!(matches!(
        read_coverage_percent(&corrupt),
        ReportRead::Malformed(_)
    ));

    for path in [&missing, &corrupt] {
        let verdict = evaluate_gates(&[GateRule::at_least("coverage", 1.0)], &coverage_metrics(path));
        assert!(!verdict.passed(), "gate should fail for {}", path.display());
    }
}

#[test]
fn severity_report_feeds_hard_gate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bandit.json");
    std::fs::write(
        &path,
        r#"{"results": [{"issue_severity": "HIGH"}, {"issue_severity": "LOW"}]}"#,
    )
    .unwrap();

    let counts = read_severity_report(&path).parsed().expect("parsed");
    let metrics: BTreeMap<String, f64> = counts.metrics("bandit").into_iter().collect();

    let rule = GateRule::at_most("bandit_high_count", 0.0).with_on_fail(GateSeverity::Failed);
    let verdict = evaluate_gates(&[rule], &metrics);
    assert_eq!(verdict.apply(StageOutcome::Success), StageOutcome::Failed);
}
