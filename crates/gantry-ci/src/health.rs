//! HTTP health polling for deployment stages.
//!
//! The only automatic retry in a run: a fixed-backoff poll that stops at the
//! first healthy answer or when the attempt budget is spent.

use gantry_core::obs;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

fn default_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Where and how patiently to poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub url: String,

    /// Total attempts, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Fixed delay between attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Accepted values of the JSON body's `status` field. Empty means any 2xx
    /// response is healthy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accept_status: Vec<String>,
}

impl HealthCheckConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            timeout_ms: default_timeout_ms(),
            accept_status: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.attempts = attempts;
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn accepting(mut self, statuses: &[&str]) -> Self {
        self.accept_status = statuses.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Outcome of a poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    pub attempts_made: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub duration_ms: u64,
}

impl HealthReport {
    /// One-line summary for stage annotations and CLI output.
    pub fn summary(&self, url: &str) -> String {
        if self.healthy {
            return format!("{url} healthy after {} attempt(s)", self.attempts_made);
        }
        let mut line = format!("{url} unhealthy after {} attempt(s)", self.attempts_made);
        if let Some(code) = self.last_status_code {
            line.push_str(&format!(", last status {code}"));
        }
        if let Some(err) = &self.last_error {
            line.push_str(&format!(": {err}"));
        }
        line
    }
}

/// Polls health endpoints.
#[derive(Debug, Clone, Default)]
pub struct HealthPoller {
    client: reqwest::Client,
}

impl HealthPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Poll until healthy or the attempt budget is exhausted.
    pub async fn poll(&self, config: &HealthCheckConfig) -> HealthReport {
        let start = Instant::now();
        let mut report = HealthReport::default();

        for attempt in 1..=config.attempts {
            report.attempts_made = attempt;
            let (healthy, detail) = self.attempt(config, &mut report).await;
            obs::emit_health_attempt(&config.url, attempt, healthy, &detail);

            if healthy {
                report.healthy = true;
                report.last_error = None;
                break;
            }
            report.last_error = Some(detail);

            if attempt < config.attempts {
                debug!(url = %config.url, backoff_ms = config.backoff_ms, "health check retrying");
                tokio::time::sleep(Duration::from_millis(config.backoff_ms)).await;
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }

    async fn attempt(&self, config: &HealthCheckConfig, report: &mut HealthReport) -> (bool, String) {
        let response = match self
            .client
            .get(&config.url)
            .timeout(Duration::from_millis(config.timeout_ms))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                report.last_status_code = None;
                return (false, e.to_string());
            }
        };

        let status = response.status();
        report.last_status_code = Some(status.as_u16());
        if !status.is_success() {
            return (false, format!("status {status}"));
        }
        if config.accept_status.is_empty() {
            return (true, format!("status {status}"));
        }

        match response.json::<serde_json::Value>().await {
            Ok(body) => match body.get("status").and_then(|s| s.as_str()) {
                Some(s) if config.accept_status.iter().any(|a| a == s) => {
                    (true, format!("status {status}, body status '{s}'"))
                }
                Some(s) => (false, format!("body status '{s}' not accepted")),
                None => (false, "body has no 'status' field".to_string()),
            },
            Err(e) => (false, format!("body is not JSON: {e}")),
        }
    }
}
