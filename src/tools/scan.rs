/// Scan Tools
///
/// - `nuclei_scan`: filtered scan returning a human-readable report
/// - `basic_scan`: single built-in template, JSON summary

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use crate::core::error::ToolError;
use crate::core::protocol::{CallToolResult, Tool};
use crate::core::registry::{CapabilityRegistry, ToolContext};
use crate::scanner::{Finding, ScanResult, ScannerService, Severity};
use crate::tools::{parse_arguments, require_non_empty};

const DEFAULT_PROTOCOLS: &str = "http,https";

/// Compact finding representation used in JSON reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FindingSummary {
    pub name: String,
    pub severity: Severity,
    pub description: String,
    pub url: String,
}

impl From<&Finding> for FindingSummary {
    fn from(finding: &Finding) -> Self {
        Self {
            name: finding.name.clone(),
            severity: finding.severity,
            description: finding.description.clone(),
            url: finding.host.clone(),
        }
    }
}

/// RFC 3339 timestamp with second precision.
pub fn format_time(time: &chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Deserialize)]
struct NucleiScanArgs {
    target: Option<String>,
    severity: Option<String>,
    protocols: Option<String>,
    #[serde(default)]
    thread_safe: bool,
    template_ids: Option<String>,
    template_id: Option<String>,
}

/// Validated nuclei_scan request.
#[derive(Debug, PartialEq)]
struct ScanRequest {
    target: String,
    severity: Severity,
    protocols: String,
    thread_safe: bool,
    template_ids: Vec<String>,
}

impl TryFrom<NucleiScanArgs> for ScanRequest {
    type Error = ToolError;

    fn try_from(args: NucleiScanArgs) -> Result<Self, Self::Error> {
        let target = require_non_empty(args.target, "target")?;

        let severity = match args.severity.as_deref().map(str::trim) {
            None | Some("") => Severity::Info,
            Some(s) => s.parse().map_err(ToolError::InvalidArguments)?,
        };

        let protocols = match args.protocols {
            Some(p) if !p.trim().is_empty() => p,
            _ => DEFAULT_PROTOCOLS.to_string(),
        };

        let mut template_ids: Vec<String> = args
            .template_ids
            .iter()
            .flat_map(|ids| ids.split(','))
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if let Some(id) = args.template_id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
            template_ids.push(id);
        }

        Ok(Self {
            target,
            severity,
            protocols,
            thread_safe: args.thread_safe,
            template_ids,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BasicScanArgs {
    target: Option<String>,
}

/// Register the scan tools.
pub fn register(registry: &CapabilityRegistry, scanner: Arc<ScannerService>) {
    let nuclei_scan = Tool::new(
        "nuclei_scan",
        "Performs a Nuclei vulnerability scan on a target",
        json!({
            "type": "object",
            "properties": {
                "target": {
                    "type": "string",
                    "description": "Target URL or IP to scan"
                },
                "severity": {
                    "type": "string",
                    "description": "Minimum severity level (info, low, medium, high, critical)",
                    "default": "info"
                },
                "protocols": {
                    "type": "string",
                    "description": "Protocols to scan (comma-separated: http,https,tcp,etc)",
                    "default": DEFAULT_PROTOCOLS
                },
                "thread_safe": {
                    "type": "boolean",
                    "description": "Use thread-safe engine for scanning"
                },
                "template_ids": {
                    "type": "string",
                    "description": "Comma-separated template IDs to run (e.g. \"self-signed-ssl,nameserver-fingerprint\")"
                },
                "template_id": {
                    "type": "string",
                    "description": "Single template ID to run (alternative to template_ids)"
                }
            },
            "required": ["target"]
        }),
    );
    let service = scanner.clone();
    registry.register_tool(nuclei_scan, move |args: Value, ctx: ToolContext| {
        let service = service.clone();
        async move { handle_nuclei_scan(&service, args, ctx).await }
    });

    let basic_scan = Tool::new(
        "basic_scan",
        "Performs a basic Nuclei vulnerability scan on a target without requiring template IDs",
        json!({
            "type": "object",
            "properties": {
                "target": {
                    "type": "string",
                    "description": "Target URL or IP to scan"
                }
            },
            "required": ["target"]
        }),
    );
    registry.register_tool(basic_scan, move |args: Value, _ctx: ToolContext| {
        let service = scanner.clone();
        async move { handle_basic_scan(&service, args).await }
    });
}

async fn handle_nuclei_scan(
    scanner: &ScannerService,
    args: Value,
    ctx: ToolContext,
) -> Result<CallToolResult, ToolError> {
    let request = ScanRequest::try_from(parse_arguments::<NucleiScanArgs>(args)?)?;
    info!(
        scan_target = %request.target,
        severity = %request.severity,
        protocols = %request.protocols,
        thread_safe = request.thread_safe,
        "nuclei_scan requested"
    );

    let result = if request.thread_safe {
        scanner
            .thread_safe_scan(
                ctx.cancel,
                &request.target,
                request.severity,
                &request.protocols,
                &request.template_ids,
            )
            .await?
    } else {
        scanner
            .scan(&request.target, request.severity, &request.protocols, &request.template_ids)
            .await?
    };

    Ok(CallToolResult::text(render_report(&request.target, &result)))
}

/// Human-readable findings report.
fn render_report(target: &str, result: &ScanResult) -> String {
    if result.findings.is_empty() {
        return format!("No vulnerabilities found for target: {}", target);
    }

    let mut text = format!("Found {} vulnerabilities for target: {}\n\n", result.findings.len(), target);
    for (i, finding) in result.findings.iter().enumerate() {
        // Writing to a String cannot fail.
        let _ = write!(
            text,
            "Finding #{}:\n- Name: {}\n- Severity: {}\n- Description: {}\n- URL: {}\n\n",
            i + 1,
            finding.name,
            finding.severity,
            finding.description,
            finding.host
        );
    }
    text
}

#[derive(Debug, Serialize)]
struct BasicScanReport {
    target: String,
    scan_time: String,
    findings_count: usize,
    findings: Vec<FindingSummary>,
}

async fn handle_basic_scan(scanner: &ScannerService, args: Value) -> Result<CallToolResult, ToolError> {
    let args: BasicScanArgs = parse_arguments(args)?;
    let target = require_non_empty(args.target, "target")?;

    let result = scanner.basic_scan(&target).await?;
    let report = BasicScanReport {
        target: result.target.clone(),
        scan_time: format_time(&result.scan_time),
        findings_count: result.findings.len(),
        findings: result.findings.iter().map(FindingSummary::from).collect(),
    };
    Ok(CallToolResult::text(serde_json::to_string(&report)?))
}
