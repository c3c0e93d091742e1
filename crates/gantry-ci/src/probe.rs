//! Capability probing.
//!
//! Each [`CapabilityCheck`] tries its detection strategies in order and the
//! first one that succeeds produces a present [`CapabilityFact`]. When every
//! strategy fails the fact is recorded as absent; probing itself never
//! errors. Only [`CapabilityProber::probe_all`] turns a missing *required*
//! capability into [`GantryError::MissingRequiredCapability`].

use gantry_core::{
    obs, CapabilityFact, CapabilityFacts, GantryError, Result, CONTAINER_ENGINE, LANGUAGE_RUNTIME,
    PACKAGE_INDEX,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::runner::{CommandRunner, Invocation};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

fn default_http_timeout_ms() -> u64 {
    5000
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)+").expect("valid regex"))
}

/// One way of detecting a capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// The first of these paths that exists.
    WellKnownPath { paths: Vec<PathBuf> },
    /// An executable named `program` in one of the `PATH` directories.
    PathLookup { program: String },
    /// Run `command`; exit 0 means present. The version is the first match
    /// of `version_pattern` (default: a dotted number) in stdout or stderr.
    VersionProbe {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_pattern: Option<String>,
    },
    /// GET `url`; any response below 500 means reachable.
    HttpReachable {
        url: String,
        #[serde(default = "default_http_timeout_ms")]
        timeout_ms: u64,
    },
}

impl DetectionStrategy {
    pub fn version_probe<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DetectionStrategy::VersionProbe {
            command: command.into_iter().map(Into::into).collect(),
            version_pattern: None,
        }
    }

    pub fn path_lookup(program: impl Into<String>) -> Self {
        DetectionStrategy::PathLookup {
            program: program.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DetectionStrategy::WellKnownPath { .. } => "well_known_path",
            DetectionStrategy::PathLookup { .. } => "path_lookup",
            DetectionStrategy::VersionProbe { .. } => "version_probe",
            DetectionStrategy::HttpReachable { .. } => "http_reachable",
        }
    }
}

/// A named capability and how to detect it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityCheck {
    pub name: String,

    /// A required capability that is absent aborts the run before any stage.
    #[serde(default)]
    pub required: bool,

    pub strategies: Vec<DetectionStrategy>,
}

impl CapabilityCheck {
    pub fn new(name: impl Into<String>, required: bool, strategies: Vec<DetectionStrategy>) -> Self {
        Self {
            name: name.into(),
            required,
            strategies,
        }
    }

    /// Python interpreter. Required.
    pub fn language_runtime() -> Self {
        Self::new(
            LANGUAGE_RUNTIME,
            true,
            vec![
                DetectionStrategy::version_probe(["python3", "--version"]),
                DetectionStrategy::version_probe(["python", "--version"]),
            ],
        )
    }

    /// Container engine with a reachable daemon. Optional.
    pub fn container_engine() -> Self {
        Self::new(
            CONTAINER_ENGINE,
            false,
            vec![
                DetectionStrategy::version_probe(["docker", "info", "--format", "{{.ServerVersion}}"]),
                DetectionStrategy::WellKnownPath {
                    paths: vec![
                        PathBuf::from("/var/run/docker.sock"),
                        PathBuf::from("/run/podman/podman.sock"),
                    ],
                },
                DetectionStrategy::path_lookup("docker"),
            ],
        )
    }

    /// Python package index reachability. Optional.
    pub fn package_index() -> Self {
        Self::new(
            PACKAGE_INDEX,
            false,
            vec![DetectionStrategy::HttpReachable {
                url: "https://pypi.org/simple/".to_string(),
                timeout_ms: default_http_timeout_ms(),
            }],
        )
    }

    pub fn defaults() -> Vec<CapabilityCheck> {
        vec![
            Self::language_runtime(),
            Self::container_engine(),
            Self::package_index(),
        ]
    }
}

/// Successful detection: version (if known) and what was found.
type Detected = (Option<String>, String);

/// Runs capability checks against the host.
pub struct CapabilityProber {
    runner: Arc<dyn CommandRunner>,
    http: reqwest::Client,
    probe_timeout: Duration,
}

impl CapabilityProber {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            http: reqwest::Client::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Time limit for each version probe command.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Detect one capability. Never fails; absence is a fact.
    pub async fn probe(&self, check: &CapabilityCheck) -> CapabilityFact {
        let mut failures = Vec::new();
        for strategy in &check.strategies {
            match self.attempt(strategy).await {
                Ok((version, found)) => {
                    debug!(capability = %check.name, strategy = strategy.label(), "capability detected");
                    return CapabilityFact::present(
                        &check.name,
                        version,
                        Some(format!("{}: {found}", strategy.label())),
                    );
                }
                Err(why) => failures.push(format!("{}: {why}", strategy.label())),
            }
        }
        let detail = if failures.is_empty() {
            "no detection strategies configured".to_string()
        } else {
            failures.join("; ")
        };
        CapabilityFact::absent(&check.name, Some(detail))
    }

    /// Probe every check without judging the results.
    pub async fn probe_facts(&self, checks: &[CapabilityCheck]) -> CapabilityFacts {
        let mut facts = Vec::with_capacity(checks.len());
        for check in checks {
            let fact = self.probe(check).await;
            obs::emit_capability_probed(&fact.name, fact.present, fact.version.as_deref());
            facts.push(fact);
        }
        CapabilityFacts::from_facts(facts)
    }

    /// Probe every check, then fail if a required capability is absent.
    pub async fn probe_all(&self, checks: &[CapabilityCheck]) -> Result<CapabilityFacts> {
        let facts = self.probe_facts(checks).await;
        ensure_required(checks, &facts)?;
        Ok(facts)
    }

    async fn attempt(&self, strategy: &DetectionStrategy) -> std::result::Result<Detected, String> {
        match strategy {
            DetectionStrategy::WellKnownPath { paths } => paths
                .iter()
                .find(|p| p.exists())
                .map(|p| (None, p.display().to_string()))
                .ok_or_else(|| "none of the well-known paths exist".to_string()),
            DetectionStrategy::PathLookup { program } => find_on_path(program)
                .map(|p| (None, p.display().to_string()))
                .ok_or_else(|| format!("'{program}' not found on PATH")),
            DetectionStrategy::VersionProbe {
                command,
                version_pattern,
            } => self.version_probe(command, version_pattern.as_deref()).await,
            DetectionStrategy::HttpReachable { url, timeout_ms } => {
                match self
                    .http
                    .get(url)
                    .timeout(Duration::from_millis(*timeout_ms))
                    .send()
                    .await
                {
                    Ok(response) if !response.status().is_server_error() => {
                        Ok((None, format!("{url} answered {}", response.status())))
                    }
                    Ok(response) => Err(format!("{url} answered {}", response.status())),
                    Err(e) => Err(e.to_string()),
                }
            }
        }
    }

    async fn version_probe(
        &self,
        command: &[String],
        pattern: Option<&str>,
    ) -> std::result::Result<Detected, String> {
        let invocation =
            Invocation::from_argv(command).ok_or_else(|| "empty probe command".to_string())?;
        let output = self
            .runner
            .run(&invocation, Some(self.probe_timeout))
            .await
            .map_err(|e| e.to_string())?;
        if output.timed_out {
            return Err(format!("'{invocation}' timed out"));
        }
        if !output.succeeded() {
            return Err(format!(
                "'{invocation}' exited with {}",
                output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "no code".to_string())
            ));
        }

        let custom;
        let re = match pattern {
            Some(p) => {
                custom = Regex::new(p).map_err(|e| format!("bad version pattern: {e}"))?;
                &custom
            }
            None => version_regex(),
        };
        let text = format!("{}\n{}", output.stdout, output.stderr);
        let version = re.captures(&text).and_then(|c| {
            c.get(1)
                .or_else(|| c.get(0))
                .map(|m| m.as_str().to_string())
        });
        Ok((version, invocation.to_string()))
    }
}

/// Fail on the first required check whose fact is absent.
pub fn ensure_required(checks: &[CapabilityCheck], facts: &CapabilityFacts) -> Result<()> {
    match checks
        .iter()
        .find(|c| c.required && !facts.is_present(&c.name))
    {
        Some(check) => Err(GantryError::MissingRequiredCapability {
            name: check.name.clone(),
        }),
        None => Ok(()),
    }
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedRunner;

    fn prober(runner: ScriptedRunner) -> CapabilityProber {
        CapabilityProber::new(Arc::new(runner))
    }

    #[tokio::test]
    async fn test_first_successful_strategy_wins() {
        let runner = ScriptedRunner::new()
            .fail("python3 --version", 127, "not found")
            .succeed("python --version", "Python 3.11.4");
        let fact = prober(runner)
            .probe(&CapabilityCheck::language_runtime())
            .await;
        assert!(fact.present);
        assert_eq!(fact.version.as_deref(), Some("3.11.4"));
        assert!(fact.detail.unwrap().contains("python --version"));
    }

    #[tokio::test]
    async fn test_no_strategy_succeeding_is_absent_not_error() {
        let check = CapabilityCheck::new(
            CONTAINER_ENGINE,
            false,
            vec![
                DetectionStrategy::version_probe(["docker", "info"]),
                DetectionStrategy::WellKnownPath {
                    paths: vec![PathBuf::from("/definitely/not/here.sock")],
                },
                DetectionStrategy::path_lookup("definitely-not-a-real-engine-xyz"),
            ],
        );
        let fact = prober(ScriptedRunner::new()).probe(&check).await;
        assert!(!fact.present);
        let detail = fact.detail.unwrap();
        assert!(detail.contains("version_probe"));
        assert!(detail.contains("path_lookup"));
    }

    #[tokio::test]
    async fn test_custom_version_pattern_capture_group() {
        let check = CapabilityCheck::new(
            "compose",
            false,
            vec![DetectionStrategy::VersionProbe {
                command: vec!["docker".into(), "compose".into(), "version".into()],
                version_pattern: Some(r"v(\d+\.\d+)".into()),
            }],
        );
        let runner = ScriptedRunner::new().succeed("docker compose version", "Docker Compose version v2.24.6");
        let fact = prober(runner).probe(&check).await;
        assert_eq!(fact.version.as_deref(), Some("2.24"));
    }

    #[tokio::test]
    async fn test_path_lookup_finds_sh() {
        let check = CapabilityCheck::new("shell", true, vec![DetectionStrategy::path_lookup("sh")]);
        let fact = prober(ScriptedRunner::new()).probe(&check).await;
        assert!(fact.present);
    }

    #[tokio::test]
    async fn test_missing_required_capability_is_fatal() {
        let checks = vec![
            CapabilityCheck::language_runtime(),
            CapabilityCheck::new(
                CONTAINER_ENGINE,
                false,
                vec![DetectionStrategy::version_probe(["docker", "info"])],
            ),
        ];
        let err = prober(ScriptedRunner::new())
            .probe_all(&checks)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GantryError::MissingRequiredCapability { ref name } if name == LANGUAGE_RUNTIME
        ));
    }

    #[tokio::test]
    async fn test_missing_optional_capability_is_recorded() {
        let checks = vec![
            CapabilityCheck::language_runtime(),
            CapabilityCheck::new(
                CONTAINER_ENGINE,
                false,
                vec![DetectionStrategy::version_probe(["docker", "info"])],
            ),
        ];
        let runner = ScriptedRunner::new().succeed("python3 --version", "Python 3.12.1");
        let facts = prober(runner).probe_all(&checks).await.unwrap();
        assert!(facts.is_present(LANGUAGE_RUNTIME));
        assert!(!facts.is_present(CONTAINER_ENGINE));
        assert_eq!(facts.len(), 2);
    }

    #[test]
    fn test_checks_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            capabilities: Vec<CapabilityCheck>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[capabilities]]
            name = "package-index"
            strategies = [{ type = "http_reachable", url = "https://pypi.org/simple/" }]
            "#,
        )
        .unwrap();
        assert!(!doc.capabilities[0].required);
        assert_eq!(doc.capabilities[0], CapabilityCheck::package_index());
    }
}
