//! Stage definitions: preconditions, bodies, post-actions.
//!
//! Everything here is static configuration. Definitions are built once
//! (from TOML or the built-in template) and never change during a run.

use gantry_core::{glob_match, BranchContext, CapabilityFacts, GantryError, GateRule, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::health::HealthCheckConfig;
use crate::runner::Invocation;

fn is_false(value: &bool) -> bool {
    !*value
}

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

/// Declarative predicate deciding whether a stage runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Precondition {
    #[default]
    Always,
    /// Branch name matches a glob (`*` within a segment, `**` across).
    Branch { pattern: String },
    NotBranch { pattern: String },
    /// Named capability was detected.
    Capability { name: String },
    All { of: Vec<Precondition> },
    Any { of: Vec<Precondition> },
    Not { condition: Box<Precondition> },
}

impl Precondition {
    pub fn branch(pattern: impl Into<String>) -> Self {
        Precondition::Branch {
            pattern: pattern.into(),
        }
    }

    pub fn capability(name: impl Into<String>) -> Self {
        Precondition::Capability { name: name.into() }
    }

    pub fn all(of: Vec<Precondition>) -> Self {
        Precondition::All { of }
    }

    pub fn any(of: Vec<Precondition>) -> Self {
        Precondition::Any { of }
    }

    pub fn negate(condition: Precondition) -> Self {
        Precondition::Not {
            condition: Box::new(condition),
        }
    }

    pub fn evaluate(&self, facts: &CapabilityFacts, context: &BranchContext) -> bool {
        match self {
            Precondition::Always => true,
            Precondition::Branch { pattern } => glob_match(pattern, &context.branch),
            Precondition::NotBranch { pattern } => !glob_match(pattern, &context.branch),
            Precondition::Capability { name } => facts.is_present(name),
            Precondition::All { of } => of.iter().all(|p| p.evaluate(facts, context)),
            Precondition::Any { of } => of.iter().any(|p| p.evaluate(facts, context)),
            Precondition::Not { condition } => !condition.evaluate(facts, context),
        }
    }

    /// Human-readable form, used in skip annotations.
    pub fn describe(&self) -> String {
        match self {
            Precondition::Always => "always".to_string(),
            Precondition::Branch { pattern } => format!("branch matches '{pattern}'"),
            Precondition::NotBranch { pattern } => format!("branch does not match '{pattern}'"),
            Precondition::Capability { name } => format!("capability '{name}' present"),
            Precondition::All { of } => join_described(of, " and "),
            Precondition::Any { of } => join_described(of, " or "),
            Precondition::Not { condition } => format!("not ({})", condition.describe()),
        }
    }

    /// Capability names this predicate mentions anywhere.
    pub fn capabilities(&self) -> Vec<&str> {
        match self {
            Precondition::Capability { name } => vec![name.as_str()],
            Precondition::All { of } | Precondition::Any { of } => {
                of.iter().flat_map(|p| p.capabilities()).collect()
            }
            Precondition::Not { condition } => condition.capabilities(),
            _ => Vec::new(),
        }
    }
}

fn join_described(of: &[Precondition], sep: &str) -> String {
    let parts: Vec<String> = of.iter().map(|p| p.describe()).collect();
    format!("({})", parts.join(sep))
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

fn default_tag() -> String {
    "latest".to_string()
}

fn default_context() -> String {
    ".".to_string()
}

fn default_engine() -> String {
    "docker".to_string()
}

/// What a stage does once its precondition holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageBody {
    /// Does nothing and succeeds; used for bookkeeping stages.
    Noop,
    Command {
        argv: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Script run through `sh -c`.
    Shell {
        script: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    ContainerBuild {
        image: String,
        #[serde(default = "default_tag")]
        tag: String,
        #[serde(default = "default_context")]
        context: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dockerfile: Option<String>,
        #[serde(default = "default_engine")]
        engine: String,
    },
    ContainerPush {
        image: String,
        #[serde(default = "default_tag")]
        tag: String,
        #[serde(default = "default_engine")]
        engine: String,
    },
    HealthCheck(HealthCheckConfig),
}

impl StageBody {
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StageBody::Command {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn shell(script: impl Into<String>) -> Self {
        StageBody::Shell {
            script: script.into(),
            env: BTreeMap::new(),
        }
    }

    /// The process this body runs, if any. Noop and health checks run none.
    pub fn invocation(&self, stage: &str) -> Result<Option<Invocation>> {
        let invocation = match self {
            StageBody::Noop | StageBody::HealthCheck(_) => return Ok(None),
            StageBody::Command { argv, env, cwd } => Invocation::from_argv(argv)
                .ok_or_else(|| GantryError::EmptyCommand {
                    stage: stage.to_string(),
                })?
                .with_env(env.clone())
                .with_cwd(cwd.clone()),
            StageBody::Shell { script, env } => {
                if script.trim().is_empty() {
                    return Err(GantryError::EmptyCommand {
                        stage: stage.to_string(),
                    });
                }
                Invocation::shell(script).with_env(env.clone())
            }
            StageBody::ContainerBuild {
                image,
                tag,
                context,
                dockerfile,
                engine,
            } => {
                let mut args = vec!["build".to_string(), "-t".to_string(), format!("{image}:{tag}")];
                if let Some(file) = dockerfile {
                    args.push("-f".to_string());
                    args.push(file.clone());
                }
                args.push(context.clone());
                Invocation::new(engine.clone(), args)
            }
            StageBody::ContainerPush { image, tag, engine } => Invocation::new(
                engine.clone(),
                vec!["push".to_string(), format!("{image}:{tag}")],
            ),
        };
        Ok(Some(invocation))
    }
}

// ---------------------------------------------------------------------------
// Post-actions
// ---------------------------------------------------------------------------

fn default_coverage_metric() -> String {
    "coverage".to_string()
}

/// Work done after a started stage's body, whatever its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostAction {
    /// Read a coverage XML file into a percent metric.
    CollectCoverage {
        path: PathBuf,
        #[serde(default = "default_coverage_metric")]
        metric: String,
    },
    /// Read a severity JSON report into `<prefix>_*` count metrics.
    CollectSeverity { path: PathBuf, prefix: String },
    /// Copy matching files into the run's archive directory.
    Archive { patterns: Vec<String> },
    /// Publishing command. Failures only annotate the stage.
    Shell { script: String },
}

impl PostAction {
    pub fn coverage(path: impl Into<PathBuf>) -> Self {
        PostAction::CollectCoverage {
            path: path.into(),
            metric: default_coverage_metric(),
        }
    }

    pub fn severity(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        PostAction::CollectSeverity {
            path: path.into(),
            prefix: prefix.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage definition
// ---------------------------------------------------------------------------

/// A named stage. Either a leaf with a body or a parallel group of children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageDefinition {
    pub name: String,

    #[serde(default)]
    pub when: Precondition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<StageBody>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<PostAction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateRule>,

    /// Children run concurrently; the group takes their worst outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<StageDefinition>,

    /// On a group this bounds the whole fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// A non-zero exit becomes success with a warning annotation.
    #[serde(default, skip_serializing_if = "is_false")]
    pub best_effort: bool,

    /// Stop the pipeline when this stage ends failed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub abort_on_failure: bool,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, body: StageBody) -> Self {
        Self {
            name: name.into(),
            when: Precondition::Always,
            body: Some(body),
            post: Vec::new(),
            gates: Vec::new(),
            parallel: Vec::new(),
            timeout_secs: None,
            best_effort: false,
            abort_on_failure: false,
        }
    }

    pub fn group(name: impl Into<String>, children: Vec<StageDefinition>) -> Self {
        Self {
            body: None,
            parallel: children,
            ..Self::new(name, StageBody::Noop)
        }
    }

    pub fn only_when(mut self, when: Precondition) -> Self {
        self.when = when;
        self
    }

    pub fn with_post(mut self, action: PostAction) -> Self {
        self.post.push(action);
        self
    }

    pub fn with_gate(mut self, rule: GateRule) -> Self {
        self.gates.push(rule);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn as_best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn aborting_on_failure(mut self) -> Self {
        self.abort_on_failure = true;
        self
    }

    pub fn is_group(&self) -> bool {
        !self.parallel.is_empty()
    }

    /// This stage's name followed by its descendants', depth first.
    pub fn names(&self) -> Vec<&str> {
        let mut names = vec![self.name.as_str()];
        for child in &self.parallel {
            names.extend(child.names());
        }
        names
    }

    /// Check structural rules for this stage and its children.
    pub fn validate(&self) -> Result<()> {
        let invalid = |why: &str| -> Result<()> {
            Err(GantryError::InvalidConfig(format!("stage '{}': {why}", self.name)))
        };

        if self.name.trim().is_empty() {
            return Err(GantryError::InvalidConfig("stage with empty name".to_string()));
        }
        match (&self.body, self.is_group()) {
            (Some(_), true) => return invalid("has both a body and parallel children"),
            (None, false) => return invalid("has neither a body nor parallel children"),
            _ => {}
        }
        if self.is_group() && !self.gates.is_empty() {
            return invalid("gates belong on leaf stages, not parallel groups");
        }
        if self.timeout_secs == Some(0) {
            return invalid("timeout_secs must be positive");
        }
        if let Some(body) = &self.body {
            if let StageBody::HealthCheck(check) = body {
                if check.attempts == 0 {
                    return invalid("health check needs at least one attempt");
                }
            }
            body.invocation(&self.name)?;
        }
        for child in &self.parallel {
            child.validate()?;
        }
        Ok(())
    }
}
