//! Scripted command runner (testing only)
//!
//! [`ScriptedRunner`] answers invocations from a table of canned outputs so
//! pipelines and probes can be exercised without the real tools installed.
//! Lookup order: the full command line, the shell script for `sh -c`
//! invocations, then the bare program name. Unscripted invocations behave
//! like a program that is not installed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{GantryError, Result};

use crate::runner::{CommandOutput, CommandRunner, Invocation};

#[derive(Debug, Clone)]
enum Script {
    Output { output: CommandOutput, delay: Duration },
    NotInstalled,
}

/// In-memory [`CommandRunner`] driven by canned responses.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(self, key: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .expect("scripted runner lock poisoned")
            .insert(key.to_string(), script);
        self
    }

    /// Exit 0 with the given stdout.
    pub fn succeed(self, key: &str, stdout: &str) -> Self {
        self.respond(key, Some(0), stdout, "", Duration::ZERO)
    }

    /// Exit with `code` and the given stderr.
    pub fn fail(self, key: &str, code: i32, stderr: &str) -> Self {
        self.respond(key, Some(code), "", stderr, Duration::ZERO)
    }

    /// Full control over the canned response, including a delay before the
    /// process "exits".
    pub fn respond(
        self,
        key: &str,
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
        delay: Duration,
    ) -> Self {
        let output = CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration_ms: delay.as_millis() as u64,
            timed_out: false,
        };
        self.insert(key, Script::Output { output, delay })
    }

    /// Make the key behave like a program that cannot be spawned.
    pub fn not_installed(self, key: &str) -> Self {
        self.insert(key, Script::NotInstalled)
    }

    /// Command lines in the order they were started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("scripted runner lock poisoned").clone()
    }

    /// Command lines in the order they finished (timed-out runs excluded).
    pub fn completed(&self) -> Vec<String> {
        self.completed
            .lock()
            .expect("scripted runner lock poisoned")
            .clone()
    }

    fn lookup(&self, invocation: &Invocation) -> Option<Script> {
        let scripts = self.scripts.lock().expect("scripted runner lock poisoned");
        let line = invocation.to_string();
        if let Some(s) = scripts.get(&line) {
            return Some(s.clone());
        }
        if invocation.program == "sh" && invocation.args.first().map(String::as_str) == Some("-c")
        {
            if let Some(s) = invocation.args.get(1).and_then(|script| scripts.get(script)) {
                return Some(s.clone());
            }
        }
        scripts.get(&invocation.program).cloned()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let line = invocation.to_string();
        self.calls
            .lock()
            .expect("scripted runner lock poisoned")
            .push(line.clone());

        let (output, delay) = match self.lookup(invocation) {
            Some(Script::Output { output, delay }) => (output, delay),
            Some(Script::NotInstalled) | None => {
                return Err(GantryError::Spawn {
                    program: invocation.program.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
                })
            }
        };

        if let Some(limit) = timeout {
            if delay > limit {
                tokio::time::sleep(limit).await;
                return Ok(CommandOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: limit.as_millis() as u64,
                    timed_out: true,
                });
            }
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.completed
            .lock()
            .expect("scripted runner lock poisoned")
            .push(line);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_order() {
        let runner = ScriptedRunner::new()
            .succeed("docker --version", "Docker version 24.0.7")
            .fail("docker", 1, "daemon down")
            .succeed("pytest --cov", "ok");

        let version = runner
            .run(&Invocation::new("docker", vec!["--version".into()]), None)
            .await
            .unwrap();
        assert_eq!(version.exit_code, Some(0));

        let info = runner
            .run(&Invocation::new("docker", vec!["info".into()]), None)
            .await
            .unwrap();
        assert_eq!(info.exit_code, Some(1));

        let shell = runner.run(&Invocation::shell("pytest --cov"), None).await.unwrap();
        assert!(shell.succeeded());
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_unscripted_is_not_installed() {
        let runner = ScriptedRunner::new();
        let err = runner
            .run(&Invocation::new("python3", vec!["--version".into()]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_delay_beyond_timeout_times_out() {
        let runner = ScriptedRunner::new().respond(
            "slow",
            Some(0),
            "",
            "",
            Duration::from_secs(10),
        );
        let out = runner
            .run(&Invocation::new("slow", vec![]), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(runner.completed().is_empty());
    }
}
