//! TOML pipeline files and the built-in template.
//!
//! ```toml
//! [pipeline]
//! name = "python-service"
//! run_timeout_secs = 3600
//!
//! [[capabilities]]
//! name = "language-runtime"
//! required = true
//! strategies = [{ type = "version_probe", command = ["python3", "--version"] }]
//!
//! [[stages]]
//! name = "Test"
//! body = { type = "shell", script = "pytest --cov --cov-report=xml" }
//! post = [{ type = "collect_coverage", path = "coverage.xml" }]
//! gates = [{ metric = "coverage", comparison = "ge", threshold = 70.0 }]
//!
//! [archive]
//! patterns = ["reports/**", "coverage.xml"]
//! ```
//!
//! Omitting `[[capabilities]]` entirely selects the built-in checks.

use gantry_core::{
    Comparison, GantryError, GateRule, GateSeverity, Result, CONTAINER_ENGINE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::health::HealthCheckConfig;
use crate::pipeline::{ArchiveConfig, Pipeline};
use crate::probe::CapabilityCheck;
use crate::stage::{PostAction, Precondition, StageBody, StageDefinition};

#[derive(Debug, Serialize, Deserialize)]
struct PipelineSection {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workspace: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PipelineFile {
    pipeline: PipelineSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capabilities: Option<Vec<CapabilityCheck>>,
    #[serde(default)]
    stages: Vec<StageDefinition>,
    #[serde(default)]
    archive: ArchiveConfig,
}

/// A loaded, validated pipeline file.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub pipeline: Pipeline,
    /// Workspace named by the file, resolved against the file's directory.
    pub workspace: Option<PathBuf>,
}

/// Parse and validate pipeline TOML.
pub fn from_toml_str(text: &str) -> Result<PipelineConfig> {
    let file: PipelineFile =
        toml::from_str(text).map_err(|e| GantryError::InvalidConfig(e.to_string()))?;
    let pipeline = Pipeline {
        name: file.pipeline.name,
        capabilities: file.capabilities.unwrap_or_else(CapabilityCheck::defaults),
        stages: file.stages,
        archive: file.archive,
        run_timeout_secs: file.pipeline.run_timeout_secs,
    };
    pipeline.validate()?;
    Ok(PipelineConfig {
        pipeline,
        workspace: file.pipeline.workspace,
    })
}

/// Load a pipeline file from disk.
pub fn load(path: &Path) -> Result<PipelineConfig> {
    let text = std::fs::read_to_string(path)?;
    let mut config = from_toml_str(&text)
        .map_err(|e| GantryError::InvalidConfig(format!("{}: {e}", path.display())))?;
    if let Some(ws) = config.workspace.take() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.workspace = Some(base.join(ws));
    }
    debug!(
        path = %path.display(),
        stages = config.pipeline.stages.len(),
        "pipeline config loaded"
    );
    Ok(config)
}

/// Render a pipeline as TOML.
pub fn to_toml(pipeline: &Pipeline) -> Result<String> {
    let file = PipelineFile {
        pipeline: PipelineSection {
            name: pipeline.name.clone(),
            run_timeout_secs: pipeline.run_timeout_secs,
            workspace: None,
        },
        capabilities: Some(pipeline.capabilities.clone()),
        stages: pipeline.stages.clone(),
        archive: pipeline.archive.clone(),
    };
    toml::to_string_pretty(&file).map_err(|e| GantryError::InvalidConfig(e.to_string()))
}

/// Deploy-class stages run only on `main` with a container engine.
fn on_main_with_engine() -> Precondition {
    Precondition::all(vec![
        Precondition::branch("main"),
        Precondition::capability(CONTAINER_ENGINE),
    ])
}

/// The canonical lint / type-check / security / test / image / deploy
/// pipeline for a Python service.
pub fn template() -> Pipeline {
    let quality = StageDefinition::group(
        "Quality",
        vec![
            StageDefinition::new("Lint", StageBody::command(["ruff", "check", "."])),
            StageDefinition::new("Type check", StageBody::command(["mypy", "."])).as_best_effort(),
            StageDefinition::new(
                "Security scan",
                StageBody::shell("mkdir -p reports && bandit -r . -x ./tests -f json -o reports/bandit.json"),
            )
            .as_best_effort()
            .with_post(PostAction::severity("reports/bandit.json", "bandit"))
            .with_gate(GateRule::at_least("bandit_report_parsed", 1.0))
            .with_gate(GateRule::new("bandit_high_count", Comparison::Eq, 0.0)),
        ],
    );

    let test = StageDefinition::new(
        "Test",
        StageBody::shell(
            "mkdir -p reports && pytest --cov=. --cov-report=xml:coverage.xml --junitxml=reports/junit.xml",
        ),
    )
    .with_post(PostAction::coverage("coverage.xml"))
    .with_gate(GateRule::at_least("coverage", 70.0).with_on_fail(GateSeverity::Unstable));

    let health = HealthCheckConfig::new("http://localhost:8000/health").accepting(&["healthy", "degraded"]);

    Pipeline::new("python-service")
        .with_capability(CapabilityCheck::language_runtime())
        .with_capability(CapabilityCheck::container_engine())
        .with_capability(CapabilityCheck::package_index())
        .with_stage(StageDefinition::new("Environment", StageBody::Noop))
        .with_stage(quality)
        .with_stage(test)
        .with_stage(
            StageDefinition::new(
                "Build image",
                StageBody::ContainerBuild {
                    image: "etl-api".to_string(),
                    tag: "latest".to_string(),
                    context: ".".to_string(),
                    dockerfile: None,
                    engine: "docker".to_string(),
                },
            )
            .only_when(Precondition::capability(CONTAINER_ENGINE)),
        )
        .with_stage(
            StageDefinition::new(
                "Push image",
                StageBody::ContainerPush {
                    image: "etl-api".to_string(),
                    tag: "latest".to_string(),
                    engine: "docker".to_string(),
                },
            )
            .only_when(on_main_with_engine()),
        )
        .with_stage(
            StageDefinition::new(
                "Deploy staging",
                StageBody::command(["docker", "compose", "up", "-d"]),
            )
            .only_when(on_main_with_engine())
            .aborting_on_failure(),
        )
        .with_stage(
            StageDefinition::new("Health check", StageBody::HealthCheck(health))
                .only_when(on_main_with_engine()),
        )
        .with_archive(&["reports/**", "coverage.xml", "*.log"])
}
