//! Gantry Core Library
//!
//! Domain model and building blocks shared by the pipeline engine and CLI:
//! capability facts, stage outcomes and the run log, metric gates, report
//! readers, glob matching, artifact archival and tracing setup.

pub mod archive;
pub mod domain;
pub mod gate;
pub mod git;
pub mod glob;
pub mod obs;
pub mod reports;
pub mod telemetry;

pub use archive::{ArchiveReport, ArchivedArtifact, ArtifactArchiver, MANIFEST_FILE};
pub use domain::capability::{CONTAINER_ENGINE, LANGUAGE_RUNTIME, PACKAGE_INDEX};
pub use domain::{
    BranchContext, BuildOutcome, CapabilityFact, CapabilityFacts, GantryError, Result, RunLog,
    StageOutcome, StageResult,
};
pub use gate::{
    evaluate_gates, evaluate_gates_with_unread, Comparison, GateRule, GateSeverity, GateVerdict,
    GateViolation,
};
pub use git::{capture_branch_name, capture_head_sha, is_git_repo};
pub use glob::glob_match;
pub use obs::run_span;
pub use reports::{
    parse_coverage_xml, parse_severity_report, read_coverage_percent, read_severity_report,
    ReportRead, SeverityCounts,
};
pub use telemetry::init_tracing;

/// Gantry version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
