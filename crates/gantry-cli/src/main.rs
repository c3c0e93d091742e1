//! Gantry - declarative CI stage orchestrator CLI
//!
//! ## Commands
//!
//! - `run`: probe capabilities, run a pipeline file, archive artifacts
//! - `probe`: print capability facts for this host
//! - `gate`: evaluate a coverage report against a threshold
//! - `health`: poll an HTTP health endpoint
//! - `init`: write the built-in pipeline template
//! - `validate`: load and check a pipeline file
//!
//! Exit codes: 0 success (and unstable unless `--strict`), 2 unstable under
//! `--strict` or a failed coverage gate, 1 failed or fatal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gantry_ci::{
    ensure_required, CapabilityCheck, CapabilityProber, CommandRunner, HealthCheckConfig,
    HealthPoller, PipelineReport, PipelineRunner, ProcessRunner,
};
use gantry_core::{
    evaluate_gates, read_coverage_percent, BranchContext, BuildOutcome, CapabilityFacts,
    GateRule, StageResult,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Capability-aware CI stage orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "GANTRY_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe, run every stage, archive artifacts and report the outcome
    Run {
        /// Pipeline file
        #[arg(short, long, env = "GANTRY_CONFIG", default_value = "gantry.toml")]
        config: PathBuf,

        /// Branch being built (auto-detected from git if omitted)
        #[arg(long, env = "BRANCH_NAME")]
        branch: Option<String>,

        /// Revision being built (auto-detected from git if omitted)
        #[arg(long, env = "GIT_COMMIT")]
        revision: Option<String>,

        /// Workspace root (default: the file's `workspace`, else cwd)
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Write the JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Treat an unstable build as a non-zero exit
        #[arg(long)]
        strict: bool,
    },

    /// Print capability facts for this host
    Probe {
        /// Pipeline file whose checks to run (default: built-in checks)
        #[arg(short, long, env = "GANTRY_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Check a coverage XML report against a threshold
    Gate {
        /// Coverage report (Cobertura XML)
        #[arg(long)]
        coverage: PathBuf,

        /// Minimum line coverage in percent
        #[arg(long, default_value = "70")]
        threshold: f64,
    },

    /// Poll an HTTP health endpoint with fixed backoff
    Health {
        #[arg(long)]
        url: String,

        #[arg(long, default_value = "5")]
        attempts: u32,

        #[arg(long, default_value = "2000")]
        backoff_ms: u64,

        /// Accepted JSON `status` values (repeatable)
        #[arg(long = "accept")]
        accept_status: Vec<String>,
    },

    /// Write the built-in pipeline template as TOML
    Init {
        #[arg(short, long, default_value = "gantry.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Load and validate a pipeline file
    Validate {
        #[arg(short, long, env = "GANTRY_CONFIG", default_value = "gantry.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gantry_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            branch,
            revision,
            workspace,
            report,
            strict,
        } => {
            cmd_run(
                &config,
                branch.as_deref(),
                revision.as_deref(),
                workspace.as_deref(),
                report.as_deref(),
                strict,
            )
            .await
        }
        Commands::Probe { config } => cmd_probe(config.as_deref()).await,
        Commands::Gate {
            coverage,
            threshold,
        } => cmd_gate(&coverage, threshold),
        Commands::Health {
            url,
            attempts,
            backoff_ms,
            accept_status,
        } => cmd_health(&url, attempts, backoff_ms, accept_status).await,
        Commands::Init { output, force } => cmd_init(&output, force),
        Commands::Validate { config } => cmd_validate(&config),
    }
}

/// Exit status for a finished build.
fn exit_status(outcome: BuildOutcome, strict: bool) -> u8 {
    match outcome {
        BuildOutcome::Success => 0,
        BuildOutcome::Unstable if strict => 2,
        BuildOutcome::Unstable => 0,
        BuildOutcome::Failed => 1,
    }
}

/// Flag first, then the pipeline file's workspace, then cwd.
fn resolve_workspace(flag: Option<&Path>, from_file: Option<PathBuf>) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or(from_file)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn process_runner(workspace: &Path) -> Arc<dyn CommandRunner> {
    Arc::new(ProcessRunner::new(workspace))
}

async fn cmd_run(
    config_path: &Path,
    branch: Option<&str>,
    revision: Option<&str>,
    workspace: Option<&Path>,
    report_path: Option<&Path>,
    strict: bool,
) -> Result<ExitCode> {
    let config = gantry_ci::load(config_path)
        .with_context(|| format!("Failed to load pipeline {}", config_path.display()))?;
    let workspace = resolve_workspace(workspace, config.workspace);
    let context = BranchContext::detect(&workspace, branch, revision);

    println!("Pipeline:  {}", config.pipeline.name);
    println!("Workspace: {}", workspace.display());
    println!("Branch:    {} @ {}", context.branch, context.short_revision());
    println!();

    let runner = PipelineRunner::new(process_runner(&workspace), &workspace);
    let report = runner
        .execute(&config.pipeline, &context)
        .await
        .context("Pipeline aborted before any stage ran")?;

    print_facts(&report.facts);
    println!();
    print!("{}", render_summary(&report));

    if let Some(path) = report_path {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(path = %path.display(), "run report written");
    }

    Ok(ExitCode::from(exit_status(report.outcome, strict)))
}

fn print_facts(facts: &CapabilityFacts) {
    println!("Capabilities:");
    for fact in facts.iter() {
        let mark = if fact.present { "✓" } else { "✗" };
        println!(
            "  {} {} {}",
            mark,
            fact.name,
            fact.version.as_deref().unwrap_or("")
        );
        if let Some(detail) = &fact.detail {
            println!("      {}", detail);
        }
    }
}

/// Per-stage summary, children indented under their group.
fn render_summary(report: &PipelineReport) -> String {
    let mut out = String::new();
    out.push_str("Stages:\n");
    for stage in &report.stages {
        render_stage(&mut out, stage, 1);
    }
    out.push('\n');
    if let Some(archive) = &report.archive {
        out.push_str(&format!(
            "Archived {} artifact(s), {} bytes -> {}\n",
            archive.count(),
            archive.total_bytes(),
            archive.destination.display()
        ));
    }
    if let Some(err) = &report.archive_error {
        out.push_str(&format!("Archive failed: {err}\n"));
    }
    if report.timed_out {
        out.push_str("Run timed out\n");
    }
    out.push_str(&format!(
        "Result: {} ({}ms, run {})\n",
        report.outcome, report.duration_ms, report.run_id
    ));
    out
}

fn render_stage(out: &mut String, stage: &StageResult, depth: usize) {
    let indent = "  ".repeat(depth);
    let metrics: Vec<String> = stage
        .metrics
        .iter()
        .map(|(k, v)| format!("{k}={v:.1}"))
        .collect();
    out.push_str(&format!(
        "{indent}{:<9} {} ({}ms){}\n",
        stage.outcome.to_string(),
        stage.stage_name,
        stage.duration_ms,
        if metrics.is_empty() {
            String::new()
        } else {
            format!(" [{}]", metrics.join(", "))
        }
    ));
    for note in &stage.annotations {
        out.push_str(&format!("{indent}          - {note}\n"));
    }
    for child in &stage.children {
        render_stage(out, child, depth + 1);
    }
}

async fn cmd_probe(config_path: Option<&Path>) -> Result<ExitCode> {
    let checks = match config_path {
        Some(path) if path.exists() => {
            gantry_ci::load(path)
                .with_context(|| format!("Failed to load pipeline {}", path.display()))?
                .pipeline
                .capabilities
        }
        _ => CapabilityCheck::defaults(),
    };

    let prober = CapabilityProber::new(process_runner(Path::new(".")));
    let facts = prober.probe_facts(&checks).await;
    print_facts(&facts);

    match ensure_required(&checks, &facts) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            println!();
            println!("✗ {e}");
            Ok(ExitCode::from(1))
        }
    }
}

fn cmd_gate(coverage: &Path, threshold: f64) -> Result<ExitCode> {
    Ok(ExitCode::from(coverage_gate(coverage, threshold)))
}

/// Print the gate result; 0 when it holds, 2 (unstable) when it does not.
fn coverage_gate(coverage: &Path, threshold: f64) -> u8 {
    let read = read_coverage_percent(coverage);
    if let Some(problem) = read.problem(coverage) {
        println!("{problem}; coverage treated as 0");
    }
    let pct = read.parsed().unwrap_or(0.0);
    let metrics = [("coverage".to_string(), pct)].into_iter().collect();
    let verdict = evaluate_gates(&[GateRule::at_least("coverage", threshold)], &metrics);

    println!("Coverage: {pct:.1}% (threshold {threshold:.1}%)");
    if verdict.passed() {
        println!("Gate: ✓ PASSED");
        0
    } else {
        for violation in &verdict.violations {
            println!("  - {}", violation.reason);
        }
        println!("Gate: ✗ UNSTABLE");
        2
    }
}

async fn cmd_health(
    url: &str,
    attempts: u32,
    backoff_ms: u64,
    accept_status: Vec<String>,
) -> Result<ExitCode> {
    anyhow::ensure!(attempts >= 1, "--attempts must be at least 1");
    let mut config = HealthCheckConfig::new(url).with_attempts(attempts, backoff_ms);
    config.accept_status = accept_status;

    let report = HealthPoller::new().poll(&config).await;
    println!("{}", report.summary(url));
    Ok(if report.healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn cmd_init(output: &Path, force: bool) -> Result<ExitCode> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }
    let text = gantry_ci::to_toml(&gantry_ci::template()).context("Failed to render template")?;
    std::fs::write(output, text)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote pipeline template to {}", output.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_validate(config_path: &Path) -> Result<ExitCode> {
    let config = gantry_ci::load(config_path)
        .with_context(|| format!("Invalid pipeline {}", config_path.display()))?;
    let pipeline = &config.pipeline;
    println!("✓ {} is valid", config_path.display());
    println!("  Pipeline:     {}", pipeline.name);
    println!("  Stages:       {}", pipeline.stage_names().join(", "));
    println!("  Capabilities: {}", pipeline.capabilities.len());
    println!("  Digest:       {}", &pipeline.digest()[..12]);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::StageOutcome;

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(exit_status(BuildOutcome::Success, false), 0);
        assert_eq!(exit_status(BuildOutcome::Success, true), 0);
        assert_eq!(exit_status(BuildOutcome::Unstable, false), 0);
        assert_eq!(exit_status(BuildOutcome::Unstable, true), 2);
        assert_eq!(exit_status(BuildOutcome::Failed, false), 1);
    }

    #[test]
    fn test_resolve_workspace_precedence() {
        let flag = PathBuf::from("/flag");
        let file = PathBuf::from("/file");
        assert_eq!(resolve_workspace(Some(&flag), Some(file.clone())), flag);
        assert_eq!(resolve_workspace(None, Some(file.clone())), file);
        assert_eq!(resolve_workspace(None, None), PathBuf::from("."));
    }

    #[test]
    fn test_init_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.toml");
        cmd_init(&path, false).unwrap();
        assert!(cmd_init(&path, false).is_err());
        cmd_init(&path, true).unwrap();

        let config = gantry_ci::load(&path).unwrap();
        assert_eq!(config.pipeline, gantry_ci::template());
        assert!(cmd_validate(&path).is_ok());
    }

    #[test]
    fn test_gate_command_missing_report() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(coverage_gate(&dir.path().join("coverage.xml"), 70.0), 2);

        let path = dir.path().join("coverage.xml");
        std::fs::write(&path, r#"<coverage line-rate="0.8215">"#).unwrap();
        assert_eq!(coverage_gate(&path, 70.0), 0);
    }

    #[test]
    fn test_render_summary_nests_children() {
        let mut test = StageResult::new("Test", StageOutcome::Unstable, 1200);
        test.metrics.insert("coverage".to_string(), 65.0);
        test.annotations.push("coverage = 65.0 violates >= 70".to_string());
        let group = StageResult::group(
            "Quality",
            vec![StageResult::new("Lint", StageOutcome::Success, 10)],
            15,
        );
        let report = PipelineReport {
            run_id: uuid::Uuid::nil(),
            pipeline: "demo".to_string(),
            pipeline_digest: String::new(),
            context: BranchContext::new("main", "abc"),
            facts: CapabilityFacts::default(),
            stages: vec![group, test],
            outcome: BuildOutcome::Unstable,
            timed_out: false,
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            duration_ms: 1300,
            archive: None,
            archive_error: None,
        };

        let text = render_summary(&report);
        assert!(text.contains("  SUCCESS   Quality (15ms)"));
        assert!(text.contains("    SUCCESS   Lint (10ms)"));
        assert!(text.contains("UNSTABLE  Test (1200ms) [coverage=65.0]"));
        assert!(text.contains("- coverage = 65.0 violates >= 70"));
        assert!(text.contains("Result: UNSTABLE"));
    }
}
