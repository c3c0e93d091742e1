//! Pipeline orchestration.
//!
//! A run probes capabilities once, walks the stages in declared order,
//! fans parallel groups out with `join_all`, applies gates, and archives
//! artifacts at the end whatever happened before. The run log lives outside
//! the timed stage loop so a whole-run timeout keeps every entry already
//! appended.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use gantry_core::{
    evaluate_gates_with_unread, obs, read_coverage_percent, read_severity_report, ArchiveReport,
    ArtifactArchiver, BranchContext, BuildOutcome, CapabilityFacts, GantryError, Result, RunLog,
    StageOutcome, StageResult,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::health::HealthPoller;
use crate::probe::{CapabilityCheck, CapabilityProber};
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::stage::{PostAction, StageBody, StageDefinition};

fn default_archive_dir() -> PathBuf {
    PathBuf::from("gantry-archive")
}

/// Run-level artifact archival.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Relative paths resolve against the workspace.
    #[serde(default = "default_archive_dir")]
    pub destination: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            destination: default_archive_dir(),
        }
    }
}

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub name: String,
    pub capabilities: Vec<CapabilityCheck>,
    pub stages: Vec<StageDefinition>,
    pub archive: ArchiveConfig,
    /// Whole-run limit. Expiry terminates the in-flight stage.
    pub run_timeout_secs: Option<u64>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Vec::new(),
            stages: Vec::new(),
            archive: ArchiveConfig::default(),
            run_timeout_secs: None,
        }
    }

    pub fn with_capability(mut self, check: CapabilityCheck) -> Self {
        self.capabilities.push(check);
        self
    }

    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_archive(mut self, patterns: &[&str]) -> Self {
        self.archive.patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_run_timeout(mut self, secs: u64) -> Self {
        self.run_timeout_secs = Some(secs);
        self
    }

    /// Every stage name in the tree, depth first.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().flat_map(|s| s.names()).collect()
    }

    /// Deterministic SHA-256 of the ordered stage tree names.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for name in self.stage_names() {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GantryError::InvalidConfig("pipeline name is empty".to_string()));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(GantryError::InvalidConfig(
                "run_timeout_secs must be positive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for name in self.stage_names() {
            if !seen.insert(name) {
                return Err(GantryError::InvalidConfig(format!(
                    "duplicate stage name '{name}'"
                )));
            }
        }
        let mut checks = HashSet::new();
        for check in &self.capabilities {
            if !checks.insert(check.name.as_str()) {
                return Err(GantryError::InvalidConfig(format!(
                    "duplicate capability check '{}'",
                    check.name
                )));
            }
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(())
    }
}

/// Everything a run produced. Serialises to JSON for `--report`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub pipeline_digest: String,
    pub context: BranchContext,
    pub facts: CapabilityFacts,
    pub stages: Vec<StageResult>,
    pub outcome: BuildOutcome,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub archive: Option<ArchiveReport>,
    pub archive_error: Option<String>,
}

impl PipelineReport {
    /// Find a stage result by name, including parallel children.
    pub fn find(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find_map(|s| s.find(name))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Per-run values shared by every stage.
struct RunEnv<'a> {
    facts: &'a CapabilityFacts,
    context: &'a BranchContext,
    archive_dir: PathBuf,
    finished: FinishedChildren,
}

/// Results of parallel children that already finished, keyed by the name of
/// their group. Lives outside every timed future, so a group cut short by a
/// timeout still reports the children that completed.
#[derive(Default)]
struct FinishedChildren(Mutex<HashMap<String, Vec<StageResult>>>);

impl FinishedChildren {
    fn record(&self, group: &str, result: &StageResult) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(group.to_string())
            .or_default()
            .push(result.clone());
    }

    fn take(&self, group: &str) -> Vec<StageResult> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(group)
            .unwrap_or_default()
    }
}

/// Mutable run state kept outside the timed stage loop.
#[derive(Default)]
struct Progress {
    log: RunLog,
    /// Index of the next top-level stage to run.
    next: usize,
    /// Start of the top-level stage currently running.
    in_flight: Option<Instant>,
    aborted_after: Option<String>,
}

/// Executes pipelines against a workspace.
pub struct PipelineRunner {
    runner: Arc<dyn CommandRunner>,
    health: HealthPoller,
    workspace: PathBuf,
}

impl PipelineRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            health: HealthPoller::new(),
            workspace: workspace.into(),
        }
    }

    pub fn with_health_poller(mut self, health: HealthPoller) -> Self {
        self.health = health;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Validate, probe, then run. A missing required capability returns an
    /// error before any stage executes.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        context: &BranchContext,
    ) -> Result<PipelineReport> {
        pipeline.validate()?;
        let facts = CapabilityProber::new(self.runner.clone())
            .probe_all(&pipeline.capabilities)
            .await?;
        Ok(self.run(pipeline, Arc::new(facts), context).await)
    }

    /// Run stages against already-probed facts.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        facts: Arc<CapabilityFacts>,
        context: &BranchContext,
    ) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let span = obs::run_span(&run_id.to_string(), &context.branch);
        self.run_inner(run_id, pipeline, facts, context)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        pipeline: &Pipeline,
        facts: Arc<CapabilityFacts>,
        context: &BranchContext,
    ) -> PipelineReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id_str = run_id.to_string();
        obs::emit_run_started(&run_id_str, &pipeline.name, pipeline.stages.len());

        let archive_dir = self.workspace.join(&pipeline.archive.destination);
        let env = RunEnv {
            facts: &facts,
            context,
            archive_dir: archive_dir.clone(),
            finished: FinishedChildren::default(),
        };
        let mut progress = Progress::default();

        let timed_out = match pipeline.run_timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                let stages = self.run_stages(pipeline, &env, &mut progress);
                let finished = tokio::time::timeout(limit, stages).await;
                match finished {
                    Ok(()) => false,
                    Err(_) => {
                        warn!(pipeline = %pipeline.name, timeout_secs = secs, "run timed out");
                        record_timeout(pipeline, &mut progress, &env.finished, secs);
                        true
                    }
                }
            }
            None => {
                self.run_stages(pipeline, &env, &mut progress).await;
                false
            }
        };

        let (archive, archive_error) =
            match ArtifactArchiver::new(&archive_dir).archive(&self.workspace, &pipeline.archive.patterns) {
                Ok(report) => {
                    obs::emit_archive_completed(
                        &report.destination.display().to_string(),
                        report.count(),
                        report.unmatched_patterns.len(),
                    );
                    (Some(report), None)
                }
                Err(e) => {
                    warn!(error = %e, "artifact archive failed");
                    (None, Some(e.to_string()))
                }
            };

        let outcome = if timed_out {
            BuildOutcome::Failed
        } else {
            progress.log.outcome()
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_run_finished(&run_id_str, outcome, duration_ms, timed_out);

        PipelineReport {
            run_id,
            pipeline: pipeline.name.clone(),
            pipeline_digest: pipeline.digest(),
            context: context.clone(),
            facts: (*facts).clone(),
            stages: progress.log.into_entries(),
            outcome,
            timed_out,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            archive,
            archive_error,
        }
    }

    async fn run_stages(&self, pipeline: &Pipeline, env: &RunEnv<'_>, progress: &mut Progress) {
        for (index, stage) in pipeline.stages.iter().enumerate() {
            progress.next = index;
            if let Some(after) = &progress.aborted_after {
                let reason = format!("not run: pipeline aborted after '{after}'");
                obs::emit_stage_skipped(&stage.name, &reason);
                progress.log.append(StageResult::skipped(&stage.name, reason));
                continue;
            }

            progress.in_flight = Some(Instant::now());
            let (result, abort) = self.run_stage(stage, env).await;
            progress.in_flight = None;

            if abort {
                warn!(stage = %stage.name, "stage requested pipeline abort");
                progress.aborted_after = Some(stage.name.clone());
            }
            progress.log.append(result);
        }
        progress.next = pipeline.stages.len();
    }

    /// Run one stage (leaf or group). The flag asks the pipeline to abort.
    fn run_stage<'a>(
        &'a self,
        stage: &'a StageDefinition,
        env: &'a RunEnv<'a>,
    ) -> BoxFuture<'a, (StageResult, bool)> {
        async move {
            if !stage.when.evaluate(env.facts, env.context) {
                let reason = format!("precondition not met: {}", stage.when.describe());
                obs::emit_stage_skipped(&stage.name, &reason);
                return (StageResult::skipped(&stage.name, reason), false);
            }

            obs::emit_stage_started(&stage.name);
            let start = Instant::now();

            let (mut result, mut abort) = if stage.is_group() {
                self.run_group(stage, env, start).await
            } else {
                (self.run_body(stage).await, false)
            };

            let mut unread = Vec::new();
            for action in &stage.post {
                self.run_post_action(stage, action, env, &mut result, &mut unread)
                    .await;
            }

            if !stage.gates.is_empty() {
                let verdict = evaluate_gates_with_unread(&stage.gates, &result.metrics, &unread);
                obs::emit_gate_evaluated(&stage.name, stage.gates.len(), verdict.violations.len());
                result
                    .annotations
                    .extend(verdict.violations.iter().map(|v| v.reason.clone()));
                result.outcome = verdict.apply(result.outcome);
                abort |= verdict.abort();
            }

            abort |= stage.abort_on_failure && result.outcome.is_failed();
            result.duration_ms = start.elapsed().as_millis() as u64;
            obs::emit_stage_finished(&stage.name, result.outcome, result.duration_ms);
            (result, abort)
        }
        .boxed()
    }

    /// Run a group's children concurrently. Each child reports into
    /// [`FinishedChildren`] as it ends, so a group timeout keeps them.
    async fn run_group(
        &self,
        stage: &StageDefinition,
        env: &RunEnv<'_>,
        start: Instant,
    ) -> (StageResult, bool) {
        let children = join_all(stage.parallel.iter().map(move |child| {
            self.run_stage(child, env)
                .inspect(move |out| env.finished.record(&stage.name, &out.0))
        }));

        let joined = match stage.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), children).await {
                Ok(children) => Ok(children),
                Err(_) => Err(secs),
            },
            None => Ok(children.await),
        };

        match joined {
            Ok(children) => {
                env.finished.take(&stage.name);
                let abort = children.iter().any(|(_, abort)| *abort);
                let results = children.into_iter().map(|(r, _)| r).collect();
                (StageResult::group(&stage.name, results, 0), abort)
            }
            Err(secs) => {
                warn!(stage = %stage.name, timeout_secs = secs, "parallel group timed out");
                let elapsed = start.elapsed().as_millis() as u64;
                let why = format!("stage timed out after {secs}s");
                (terminated(stage, &env.finished, &why, elapsed), false)
            }
        }
    }

    async fn run_body(&self, stage: &StageDefinition) -> StageResult {
        let mut result = StageResult::new(&stage.name, StageOutcome::Success, 0);
        let timeout = stage.timeout_secs.map(Duration::from_secs);

        let body = match &stage.body {
            Some(body) => body,
            None => return result,
        };

        if let StageBody::HealthCheck(check) = body {
            let poll = self.health.poll(check);
            let report = match timeout {
                Some(limit) => match tokio::time::timeout(limit, poll).await {
                    Ok(report) => report,
                    Err(_) => {
                        result.outcome = StageOutcome::Failed;
                        result
                            .annotations
                            .push(format!("health check timed out after {}s", limit.as_secs()));
                        return result;
                    }
                },
                None => poll.await,
            };
            result
                .metrics
                .insert("health_attempts".to_string(), report.attempts_made as f64);
            let summary = report.summary(&check.url);
            if !report.healthy {
                self.fail_or_tolerate(stage, &mut result, summary);
            } else {
                result.annotations.push(summary);
            }
            return result;
        }

        let invocation = match body.invocation(&stage.name) {
            Ok(Some(invocation)) => invocation,
            Ok(None) => return result,
            Err(e) => {
                result.outcome = StageOutcome::Failed;
                result.annotations.push(e.to_string());
                return result;
            }
        };

        match self.runner.run(&invocation, timeout).await {
            Ok(output) => self.apply_output(stage, &invocation, output, &mut result),
            Err(e) => self.fail_or_tolerate(stage, &mut result, e.to_string()),
        }
        result
    }

    fn apply_output(
        &self,
        stage: &StageDefinition,
        invocation: &Invocation,
        output: CommandOutput,
        result: &mut StageResult,
    ) {
        result.exit_code = output.exit_code;
        if output.timed_out {
            result.outcome = StageOutcome::Failed;
            result.annotations.push(format!(
                "'{invocation}' terminated: timed out after {}s",
                stage.timeout_secs.unwrap_or_default()
            ));
        } else if !output.succeeded() {
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            self.fail_or_tolerate(stage, result, format!("'{invocation}' exited with {code}"));
        }
        result.stdout = output.stdout;
        result.stderr = output.stderr;
    }

    /// Non-zero exits fail the stage unless it is best-effort.
    fn fail_or_tolerate(&self, stage: &StageDefinition, result: &mut StageResult, why: String) {
        if stage.best_effort {
            warn!(stage = %stage.name, reason = %why, "best-effort stage failure ignored");
            result.annotations.push(format!("warning: {why} (best effort)"));
        } else {
            result.outcome = StageOutcome::Failed;
            result.annotations.push(why);
        }
    }

    async fn run_post_action(
        &self,
        stage: &StageDefinition,
        action: &PostAction,
        env: &RunEnv<'_>,
        result: &mut StageResult,
        unread: &mut Vec<String>,
    ) {
        match action {
            PostAction::CollectCoverage { path, metric } => {
                let path = self.workspace.join(path);
                let read = read_coverage_percent(&path);
                if let Some(problem) = read.problem(&path) {
                    result.annotations.push(format!("{problem}; {metric} recorded as 0"));
                }
                result
                    .metrics
                    .insert(metric.clone(), read.parsed().unwrap_or(0.0));
            }
            PostAction::CollectSeverity { path, prefix } => {
                let path = self.workspace.join(path);
                let read = read_severity_report(&path);
                let parsed_metric = format!("{prefix}_report_parsed");
                if let Some(problem) = read.problem(&path) {
                    result.annotations.push(problem);
                }
                match read.parsed() {
                    Some(counts) => {
                        result.metrics.extend(counts.metrics(prefix));
                        result.metrics.insert(parsed_metric, 1.0);
                    }
                    None => {
                        result.metrics.insert(parsed_metric, 0.0);
                        unread.push(prefix.clone());
                    }
                }
            }
            PostAction::Archive { patterns } => {
                let dest = env.archive_dir.join("stages").join(slug(&stage.name));
                let archiver = ArtifactArchiver::new(dest).excluding(&env.archive_dir);
                match archiver.archive(&self.workspace, patterns) {
                    Ok(report) => {
                        info!(stage = %stage.name, archived = report.count(), "stage artifacts archived");
                        result
                            .annotations
                            .push(format!("archived {} artifact(s)", report.count()));
                    }
                    Err(e) => result.annotations.push(format!("stage archive failed: {e}")),
                }
            }
            PostAction::Shell { script } => {
                let invocation = Invocation::shell(script);
                let timeout = stage.timeout_secs.map(Duration::from_secs);
                let failure = match self.runner.run(&invocation, timeout).await {
                    Ok(output) if output.succeeded() => None,
                    Ok(output) if output.timed_out => Some("timed out".to_string()),
                    Ok(output) => Some(format!(
                        "exited with {}",
                        output
                            .exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "signal".to_string())
                    )),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(why) = failure {
                    warn!(stage = %stage.name, script = %script, reason = %why, "post-action failed");
                    result
                        .annotations
                        .push(format!("post-action '{script}' failed: {why}"));
                }
            }
        }
    }
}

/// Record the in-flight stage as terminated and the rest as not run.
fn record_timeout(
    pipeline: &Pipeline,
    progress: &mut Progress,
    finished: &FinishedChildren,
    secs: u64,
) {
    let mut remaining = pipeline.stages.iter().skip(progress.next);
    if let Some(started) = progress.in_flight.take() {
        if let Some(stage) = remaining.next() {
            let duration_ms = started.elapsed().as_millis() as u64;
            let why = format!("run timed out after {secs}s");
            let result = terminated(stage, finished, &why, duration_ms);
            obs::emit_stage_finished(&stage.name, result.outcome, duration_ms);
            progress.log.append(result);
        }
    }
    for stage in remaining {
        let reason = "not run: run timed out".to_string();
        obs::emit_stage_skipped(&stage.name, &reason);
        progress.log.append(StageResult::skipped(&stage.name, reason));
    }
}

/// Result for a stage whose future was dropped mid-flight. Children that
/// finished keep their results; anything still running is failed.
fn terminated(
    stage: &StageDefinition,
    finished: &FinishedChildren,
    why: &str,
    duration_ms: u64,
) -> StageResult {
    let mut result = if stage.is_group() {
        let mut done = finished.take(&stage.name);
        let children = stage
            .parallel
            .iter()
            .map(|child| match done.iter().position(|r| r.stage_name == child.name) {
                Some(i) => done.swap_remove(i),
                None => terminated(child, finished, why, duration_ms),
            })
            .collect();
        StageResult::group(&stage.name, children, duration_ms)
    } else {
        StageResult::new(&stage.name, StageOutcome::Failed, duration_ms)
    };
    result.outcome = StageOutcome::Failed;
    result.annotations.push(format!("terminated: {why}"));
    result
}

/// Directory-safe form of a stage name.
fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_stage() -> Pipeline {
        Pipeline::new("demo")
            .with_stage(StageDefinition::new("Environment", StageBody::Noop))
            .with_stage(StageDefinition::group(
                "Quality",
                vec![
                    StageDefinition::new("Lint", StageBody::command(["ruff", "check", "."])),
                    StageDefinition::new("Type check", StageBody::command(["mypy", "."])),
                ],
            ))
            .with_stage(StageDefinition::new("Test", StageBody::shell("pytest")))
    }

    #[test]
    fn test_digest_is_deterministic_and_order_sensitive() {
        let a = three_stage();
        assert_eq!(a.digest(), three_stage().digest());
        assert_eq!(a.digest().len(), 64);

        let mut b = three_stage();
        b.stages.reverse();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let pipeline = three_stage().with_stage(StageDefinition::new("Lint", StageBody::Noop));
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate stage name 'Lint'"));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Security scan"), "security-scan");
        assert_eq!(slug("Build/Push"), "build-push");
    }

    #[test]
    fn test_report_json_round_trips_stage_log() {
        let report = PipelineReport {
            run_id: Uuid::new_v4(),
            pipeline: "demo".to_string(),
            pipeline_digest: three_stage().digest(),
            context: BranchContext::new("main", "abc"),
            facts: CapabilityFacts::default(),
            stages: vec![StageResult::skipped("Deploy", "precondition not met")],
            outcome: BuildOutcome::Success,
            timed_out: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 3,
            archive: None,
            archive_error: None,
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"outcome\": \"success\""));
        let back: PipelineReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.find("Deploy").unwrap().outcome, StageOutcome::Skipped);
    }
}
