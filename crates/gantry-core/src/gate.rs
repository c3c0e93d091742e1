//! Metric gates that can downgrade a stage outcome.
//!
//! Evaluates a stage's captured metrics against a list of [`GateRule`]s to
//! produce a [`GateVerdict`]. A violated rule downgrades the stage to the
//! rule's `on_fail` outcome; it never upgrades one. Gates are fail-closed:
//! a metric the stage did not capture is evaluated as 0.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::outcome::StageOutcome;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// How a metric is compared against its threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// metric >= threshold
    Ge,
    /// metric > threshold
    Gt,
    /// metric <= threshold
    Le,
    /// metric < threshold
    Lt,
    /// metric == threshold
    Eq,
    /// metric != threshold
    Ne,
}

impl Comparison {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Ge => ">=",
            Comparison::Gt => ">",
            Comparison::Le => "<=",
            Comparison::Lt => "<",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }

    /// Compare at one-decimal resolution, so 69.96 satisfies `>= 70`.
    pub fn holds(self, actual: f64, threshold: f64) -> bool {
        let a = tenths(actual);
        let t = tenths(threshold);
        match self {
            Comparison::Ge => a >= t,
            Comparison::Gt => a > t,
            Comparison::Le => a <= t,
            Comparison::Lt => a < t,
            Comparison::Eq => a == t,
            Comparison::Ne => a != t,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Non-finite values collapse to 0 via the saturating cast.
fn tenths(value: f64) -> i64 {
    (value * 10.0).round() as i64
}

/// Outcome a violated gate imposes on its stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateSeverity {
    /// Soft gate: the stage becomes unstable.
    #[default]
    Unstable,
    /// Hard gate: the stage fails.
    Failed,
}

impl GateSeverity {
    pub fn outcome(self) -> StageOutcome {
        match self {
            GateSeverity::Unstable => StageOutcome::Unstable,
            GateSeverity::Failed => StageOutcome::Failed,
        }
    }
}

/// A threshold rule over one captured metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateRule {
    /// Metric name, e.g. "coverage" or "bandit_high_count".
    pub metric: String,

    pub comparison: Comparison,

    pub threshold: f64,

    /// Outcome applied to the stage when the rule is violated.
    #[serde(default)]
    pub on_fail: GateSeverity,

    /// Stop the pipeline after this stage when the rule is violated.
    #[serde(default)]
    pub abort_on_fail: bool,
}

impl GateRule {
    pub fn new(metric: impl Into<String>, comparison: Comparison, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            comparison,
            threshold,
            on_fail: GateSeverity::Unstable,
            abort_on_fail: false,
        }
    }

    /// `metric >= threshold`, the usual coverage gate.
    pub fn at_least(metric: impl Into<String>, threshold: f64) -> Self {
        Self::new(metric, Comparison::Ge, threshold)
    }

    /// `metric <= threshold`, the usual issue-count gate.
    pub fn at_most(metric: impl Into<String>, threshold: f64) -> Self {
        Self::new(metric, Comparison::Le, threshold)
    }

    pub fn with_on_fail(mut self, on_fail: GateSeverity) -> Self {
        self.on_fail = on_fail;
        self
    }

    pub fn aborting(mut self) -> Self {
        self.abort_on_fail = true;
        self
    }
}

impl fmt::Display for GateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.comparison, self.threshold)
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// A single violated gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateViolation {
    pub rule: GateRule,
    /// Value the rule was evaluated against (0 when the metric was absent).
    pub actual: f64,
    /// Whether the stage captured the metric at all.
    pub metric_present: bool,
    pub reason: String,
}

/// Outcome of evaluating every gate of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateVerdict {
    pub violations: Vec<GateViolation>,
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// The worst outcome demanded by any violation.
    pub fn downgrade(&self) -> Option<StageOutcome> {
        self.violations
            .iter()
            .map(|v| v.rule.on_fail.outcome())
            .reduce(StageOutcome::worst)
    }

    /// Whether any violated rule asks to stop the pipeline.
    pub fn abort(&self) -> bool {
        self.violations.iter().any(|v| v.rule.abort_on_fail)
    }

    /// Apply the verdict to a body outcome. Never improves an outcome.
    pub fn apply(&self, outcome: StageOutcome) -> StageOutcome {
        match self.downgrade() {
            Some(down) => outcome.worst(down),
            None => outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluate all rules against the captured metrics. Every rule is checked so
/// the verdict lists every violation.
pub fn evaluate_gates(rules: &[GateRule], metrics: &BTreeMap<String, f64>) -> GateVerdict {
    evaluate_gates_with_unread(rules, metrics, &[])
}

/// Like [`evaluate_gates`], with reports that could not be read. A rule on a
/// `<prefix>_*` metric of an unread report is violated whatever the metric
/// holds, so an unparseable report never passes as zero findings.
pub fn evaluate_gates_with_unread(
    rules: &[GateRule],
    metrics: &BTreeMap<String, f64>,
    unread_prefixes: &[String],
) -> GateVerdict {
    let violations = rules
        .iter()
        .filter_map(|rule| check_rule(rule, metrics, unread_source(&rule.metric, unread_prefixes)))
        .collect();
    GateVerdict { violations }
}

/// The unread report prefix `metric` belongs to, if any.
fn unread_source<'p>(metric: &str, prefixes: &'p [String]) -> Option<&'p str> {
    prefixes
        .iter()
        .map(String::as_str)
        .find(|prefix| {
            metric
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('_'))
        })
}

fn check_rule(
    rule: &GateRule,
    metrics: &BTreeMap<String, f64>,
    unread: Option<&str>,
) -> Option<GateViolation> {
    let captured = metrics.get(&rule.metric).copied();
    let actual = captured.unwrap_or(0.0);

    if unread.is_none() && rule.comparison.holds(actual, rule.threshold) {
        return None;
    }

    let reason = match (unread, captured) {
        (Some(prefix), _) => format!(
            "{} unavailable ({prefix} report unreadable) violates {} {}",
            rule.metric, rule.comparison, rule.threshold
        ),
        (None, Some(v)) => format!(
            "{} = {:.1} violates {} {}",
            rule.metric, v, rule.comparison, rule.threshold
        ),
        (None, None) => format!(
            "{} not captured (treated as 0) violates {} {}",
            rule.metric, rule.comparison, rule.threshold
        ),
    };

    Some(GateViolation {
        rule: rule.clone(),
        actual,
        metric_present: captured.is_some(),
        reason,
    })
}
