//! Process execution for stage bodies and probes.

use async_trait::async_trait;
use gantry_core::{GantryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long to keep reading pipes after a timed-out child is killed.
const PIPE_GRACE: Duration = Duration::from_millis(100);

/// An opaque command invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory, relative paths resolve against the workspace.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Split an argv vector. `None` when it is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    /// Run `script` through the platform shell.
    pub fn shell(script: &str) -> Self {
        if cfg!(windows) {
            Self::new("cmd", vec!["/C".to_string(), script.to_string()])
        } else {
            Self::new("sh", vec!["-c".to_string(), script.to_string()])
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What a finished (or killed) process produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Executes invocations. The seam lets tests script process behaviour.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion or until `timeout` elapses. A timeout is reported
    /// through [`CommandOutput::timed_out`]; only failing to start the
    /// process is an error.
    async fn run(&self, invocation: &Invocation, timeout: Option<Duration>)
        -> Result<CommandOutput>;
}

/// Runs invocations as child processes of this one.
///
/// Children are spawned with `kill_on_drop`, so dropping an in-flight run
/// (stage timeout, whole-run timeout) terminates the process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    workspace: PathBuf,
}

impl ProcessRunner {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let start = Instant::now();
        let cwd = match &invocation.cwd {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        };

        debug!(command = %invocation, cwd = %cwd.display(), "spawning process");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GantryError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut readers = [
            drain(child.stdout.take(), stdout.clone()),
            drain(child.stderr.take(), stderr.clone()),
        ];

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status?),
                Err(_) => None,
            },
            None => Some(child.wait().await?),
        };

        let exit_code = match status {
            Some(status) => {
                for reader in &mut readers {
                    let _ = reader.await;
                }
                status.code()
            }
            None => {
                if let Err(e) = child.kill().await {
                    debug!(command = %invocation, error = %e, "kill after timeout failed");
                }
                // Grandchildren may hold the pipes open; take what arrived.
                let _ = tokio::time::timeout(
                    PIPE_GRACE,
                    futures::future::join_all(readers.iter_mut()),
                )
                .await;
                for reader in &readers {
                    reader.abort();
                }
                debug!(command = %invocation, "process killed after timeout");
                None
            }
        };

        Ok(CommandOutput {
            exit_code,
            stdout: captured(&stdout),
            stderr: captured(&stderr),
            duration_ms: start.elapsed().as_millis() as u64,
            timed_out: status.is_none(),
        })
    }
}

/// Copy a child pipe into `sink` as bytes arrive, so a killed process still
/// leaves behind what it printed.
fn drain<R>(pipe: Option<R>, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => lock(&sink).extend_from_slice(&buf[..n]),
            }
        }
    })
}

fn lock(sink: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    sink.lock().unwrap_or_else(PoisonError::into_inner)
}

fn captured(sink: &Mutex<Vec<u8>>) -> String {
    String::from_utf8_lossy(&lock(sink)).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(std::env::temp_dir())
    }

    #[test]
    fn test_from_argv_and_display() {
        let inv = Invocation::from_argv(&["ruff".to_string(), "check".to_string(), ".".to_string()])
            .expect("non-empty");
        assert_eq!(inv.program, "ruff");
        assert_eq!(inv.to_string(), "ruff check .");
        assert!(Invocation::from_argv(&[]).is_none());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let inv = Invocation::new("echo", vec!["hello".to_string()]);
        let out = runner().run(&inv, Some(Duration::from_secs(30))).await.unwrap();
        assert!(out.succeeded());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_shell() {
        let inv = Invocation::shell("echo oops >&2; exit 3");
        let out = runner().run(&inv, None).await.unwrap();
        assert!(!out.succeeded());
        assert_eq!(out.exit_code, Some(3));
        assert!(out.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_env_is_passed_through() {
        let env = BTreeMap::from([("GANTRY_TEST_VAR".to_string(), "42".to_string())]);
        let inv = Invocation::shell("echo $GANTRY_TEST_VAR").with_env(env);
        let out = runner().run(&inv, None).await.unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let inv = Invocation::new("sleep", vec!["5".to_string()]);
        let started = Instant::now();
        let out = runner()
            .run(&inv, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.succeeded());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let inv = Invocation::shell("echo collected 12 items; echo warming up >&2; sleep 5");
        let out = runner()
            .run(&inv, Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(out.stdout.contains("collected 12 items"));
        assert!(out.stderr.contains("warming up"));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let inv = Invocation::new("definitely-not-a-real-program-xyz", vec![]);
        let err = runner().run(&inv, None).await.unwrap_err();
        assert!(matches!(err, GantryError::Spawn { .. }));
    }
}
