//! Gantry CI - pipeline stage orchestration
//!
//! Provides the engine that:
//! - Probes the host for capabilities (language runtime, container engine, package index)
//! - Runs preconditioned stages in order, fanning parallel groups out concurrently
//! - Collects report metrics and evaluates gates against them
//! - Polls health endpoints for deployment stages
//! - Archives artifacts once every stage has finished

pub mod config;
pub mod fakes;
pub mod health;
pub mod pipeline;
pub mod probe;
pub mod runner;
pub mod stage;

// Re-export key types
pub use config::{load, template, to_toml, PipelineConfig};
pub use health::{HealthCheckConfig, HealthPoller, HealthReport};
pub use pipeline::{ArchiveConfig, Pipeline, PipelineReport, PipelineRunner};
pub use probe::{ensure_required, CapabilityCheck, CapabilityProber, DetectionStrategy};
pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner};
pub use stage::{PostAction, Precondition, StageBody, StageDefinition};
