/// Scan Result Types
///
/// `ScanResult` is the record produced by one engine run and stored in the
/// result cache. `Finding` is the normalized form of a single engine event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a finding, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// This severity and every level above it, in ascending order.
    pub fn and_above(self) -> Vec<Severity> {
        Self::ALL.into_iter().filter(|s| *s >= self).collect()
    }

    /// Parse an engine-reported severity. Values outside the fixed set
    /// (`unknown`, empty) are reported as `info`.
    pub fn from_engine(value: &str) -> Severity {
        value.parse().unwrap_or(Severity::Info)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!(
                "invalid severity '{}' (expected one of info, low, medium, high, critical)",
                other
            )),
        }
    }
}

/// One reported result unit produced by the scan engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub template_id: String,
    pub name: String,
    pub severity: Severity,
    pub description: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_at: Option<String>,
}

/// Result of a scan against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub target: String,
    pub scan_time: DateTime<Utc>,
    pub findings: Vec<Finding>,
}

impl ScanResult {
    pub fn new(target: impl Into<String>, findings: Vec<Finding>) -> Self {
        Self {
            target: target.into(),
            scan_time: Utc::now(),
            findings,
        }
    }
}
