//! Readers for report files produced by external scanners.
//!
//! Two formats are understood:
//! - Cobertura-style coverage XML: the root `<coverage>` element's
//!   `line-rate` attribute, a fraction in `[0, 1]`.
//! - Severity JSON: a list of findings, either top-level or under a
//!   `results` key, each with a `severity` or `issue_severity` field.
//!
//! Reading never fails the caller. A missing or malformed file is reported as
//! [`ReportRead::Missing`] or [`ReportRead::Malformed`] and the caller records
//! the conservative metric value.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Outcome of reading one report file.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportRead<T> {
    Parsed(T),
    Missing,
    Malformed(String),
}

impl<T> ReportRead<T> {
    pub fn parsed(self) -> Option<T> {
        match self {
            ReportRead::Parsed(v) => Some(v),
            _ => None,
        }
    }

    /// Human-readable reason when nothing was parsed.
    pub fn problem(&self, path: &Path) -> Option<String> {
        match self {
            ReportRead::Parsed(_) => None,
            ReportRead::Missing => Some(format!("report {} not found", path.display())),
            ReportRead::Malformed(why) => {
                Some(format!("report {} malformed: {}", path.display(), why))
            }
        }
    }
}

fn read_report<T>(path: &Path, parse: impl Fn(&str) -> Result<T, String>) -> ReportRead<T> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "report file missing");
            return ReportRead::Missing;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "report file unreadable");
            return ReportRead::Malformed(e.to_string());
        }
    };
    match parse(&text) {
        Ok(v) => ReportRead::Parsed(v),
        Err(why) => {
            warn!(path = %path.display(), reason = %why, "report file malformed");
            ReportRead::Malformed(why)
        }
    }
}

// ---------------------------------------------------------------------------
// Coverage XML
// ---------------------------------------------------------------------------

fn coverage_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<coverage\b[^>]*>").expect("valid regex"))
}

fn line_rate_attr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\bline-rate\s*=\s*["']([^"']*)["']"#).expect("valid regex")
    })
}

/// Parse coverage XML and return line coverage in percent.
pub fn parse_coverage_xml(text: &str) -> Result<f64, String> {
    let tag = coverage_tag()
        .find(text)
        .ok_or_else(|| "no <coverage> element".to_string())?;
    let raw = line_rate_attr()
        .captures(tag.as_str())
        .and_then(|c| c.get(1))
        .ok_or_else(|| "<coverage> has no line-rate attribute".to_string())?
        .as_str();
    let rate: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("line-rate '{raw}' is not a number"))?;
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        return Err(format!("line-rate {rate} outside [0, 1]"));
    }
    Ok(rate * 100.0)
}

/// Read a coverage report file. Value is in percent.
pub fn read_coverage_percent(path: &Path) -> ReportRead<f64> {
    let read = read_report(path, parse_coverage_xml);
    if let ReportRead::Parsed(pct) = &read {
        debug!(path = %path.display(), coverage = pct, "coverage report parsed");
    }
    read
}

// ---------------------------------------------------------------------------
// Severity JSON
// ---------------------------------------------------------------------------

/// Finding counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    /// `high` and `critical` findings.
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    /// Findings with a missing or unrecognised severity.
    pub other: u64,
}

impl SeverityCounts {
    pub fn total(&self) -> u64 {
        self.high + self.medium + self.low + self.other
    }

    /// Metric entries named `<prefix>_high_count` and friends.
    pub fn metrics(&self, prefix: &str) -> Vec<(String, f64)> {
        vec![
            (format!("{prefix}_high_count"), self.high as f64),
            (format!("{prefix}_medium_count"), self.medium as f64),
            (format!("{prefix}_low_count"), self.low as f64),
            (format!("{prefix}_total_count"), self.total() as f64),
        ]
    }
}

/// Parse a severity report.
pub fn parse_severity_report(text: &str) -> Result<SeverityCounts, String> {
    let doc: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let findings = match &doc {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("results") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err("'results' is not a list".to_string()),
            None => return Err("object has no 'results' list".to_string()),
        },
        _ => return Err("expected a list of findings".to_string()),
    };

    let mut counts = SeverityCounts::default();
    for finding in findings {
        let severity = finding
            .get("severity")
            .or_else(|| finding.get("issue_severity"))
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase);
        match severity.as_deref() {
            Some("high") | Some("critical") => counts.high += 1,
            Some("medium") | Some("moderate") => counts.medium += 1,
            Some("low") => counts.low += 1,
            _ => counts.other += 1,
        }
    }
    Ok(counts)
}

/// Read a severity report file.
pub fn read_severity_report(path: &Path) -> ReportRead<SeverityCounts> {
    read_report(path, parse_severity_report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COBERTURA: &str = r#"<?xml version="1.0" ?>
<coverage version="7.4.0" timestamp="1700000000" lines-valid="100" lines-covered="82" line-rate="0.82" branch-rate="0" complexity="0">
    <packages>
        <package name="etl" line-rate="0.5" branch-rate="0" complexity="0"/>
    </packages>
</coverage>"#;

    #[test]
    fn test_parse_coverage_reads_root_line_rate() {
        let pct = parse_coverage_xml(COBERTURA).unwrap();
        assert!((pct - 82.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_coverage_ignores_nested_line_rates() {
        let xml = r#"<coverage branch-rate="0"><package line-rate="0.9"/></coverage>"#;
        assert!(parse_coverage_xml(xml).is_err());
    }

    #[test]
    fn test_parse_coverage_rejects_out_of_range() {
        assert!(parse_coverage_xml(r#"<coverage line-rate="1.5">"#).is_err());
        assert!(parse_coverage_xml(r#"<coverage line-rate="abc">"#).is_err());
        assert!(parse_coverage_xml("not xml at all").is_err());
    }

    #[test]
    fn test_read_coverage_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coverage.xml");
        let read = read_coverage_percent(&path);
        assert_eq!(read, ReportRead::Missing);
        assert!(read.problem(&path).unwrap().contains("not found"));
    }

    #[test]
    fn test_parse_bandit_style_results() {
        let json = r#"{"results": [
            {"issue_severity": "HIGH"},
            {"issue_severity": "MEDIUM"},
            {"issue_severity": "LOW"},
            {"issue_severity": "LOW"}
        ]}"#;
        let counts = parse_severity_report(json).unwrap();
        assert_eq!(counts.high, 1);
        assert_eq!(counts.medium, 1);
        assert_eq!(counts.low, 2);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_parse_top_level_list_with_severity_field() {
        let json = r#"[{"severity": "critical"}, {"severity": "info"}, {"id": 3}]"#;
        let counts = parse_severity_report(json).unwrap();
        assert_eq!(counts.high, 1);
        assert_eq!(counts.other, 2);
    }

    #[test]
    fn test_parse_severity_rejects_malformed() {
        assert!(parse_severity_report("{").is_err());
        assert!(parse_severity_report(r#"{"errors": []}"#).is_err());
        assert!(parse_severity_report("42").is_err());
    }

    #[test]
    fn test_severity_metric_names() {
        let counts = SeverityCounts {
            high: 2,
            medium: 0,
            low: 1,
            other: 0,
        };
        let metrics = counts.metrics("bandit");
        assert!(metrics.contains(&("bandit_high_count".to_string(), 2.0)));
        assert!(metrics.contains(&("bandit_total_count".to_string(), 3.0)));
    }
}
