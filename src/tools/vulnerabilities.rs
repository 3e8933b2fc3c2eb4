/// Vulnerability Report Resource
///
/// `vulnerabilities` summarizes every scan held in the result cache,
/// including entries whose TTL has passed, newest first.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::core::error::ToolError;
use crate::core::protocol::{Annotations, Resource, ResourceContents, Role};
use crate::core::registry::CapabilityRegistry;
use crate::scanner::{ScanResult, ScannerService};
use crate::tools::scan::{FindingSummary, format_time};

pub const VULNERABILITIES_URI: &str = "vulnerabilities";

/// Findings shown per scan in the report.
const SAMPLE_FINDINGS: usize = 5;

#[derive(Debug, Serialize)]
struct ScanSummary {
    target: String,
    scan_time: String,
    findings: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sample_findings: Vec<FindingSummary>,
}

#[derive(Debug, Serialize)]
struct VulnerabilityReport {
    timestamp: String,
    recent_scans: Vec<ScanSummary>,
    total_scans: usize,
}

/// Register the vulnerability report resource.
pub fn register(registry: &CapabilityRegistry, scanner: Arc<ScannerService>) {
    let resource = Resource {
        uri: VULNERABILITIES_URI.to_string(),
        name: "Recent Vulnerability Reports".to_string(),
        description: Some("Summary of cached Nuclei scan results".to_string()),
        mime_type: Some("application/json".to_string()),
        annotations: Some(Annotations {
            audience: vec![Role::User, Role::Assistant],
            priority: None,
        }),
    };

    registry.register_resource(resource, move |uri: String| {
        let scanner = scanner.clone();
        async move { read_report(&scanner, uri) }
    });
}

fn read_report(scanner: &ScannerService, uri: String) -> Result<Vec<ResourceContents>, ToolError> {
    let report = build_report(scanner.cached_results());
    Ok(vec![ResourceContents {
        uri,
        mime_type: Some("application/json".to_string()),
        text: serde_json::to_string(&report)?,
    }])
}

fn build_report(mut results: Vec<ScanResult>) -> VulnerabilityReport {
    results.sort_by(|a, b| b.scan_time.cmp(&a.scan_time));

    let recent_scans: Vec<ScanSummary> = results
        .iter()
        .map(|result| ScanSummary {
            target: result.target.clone(),
            scan_time: format_time(&result.scan_time),
            findings: result.findings.len(),
            sample_findings: result
                .findings
                .iter()
                .take(SAMPLE_FINDINGS)
                .map(FindingSummary::from)
                .collect(),
        })
        .collect();

    VulnerabilityReport {
        timestamp: format_time(&Utc::now()),
        total_scans: recent_scans.len(),
        recent_scans,
    }
}
