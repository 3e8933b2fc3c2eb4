/// Nuclei Engine
///
/// `ScanEngine` implementation that drives the `nuclei` command line scanner
/// as a child process. Every `execute` spawns one process with JSONL output
/// enabled and turns each result line into a `Finding`. Separate executions
/// share nothing but the options, so one engine can serve concurrent scans.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::EngineError;
use crate::core::utils::NucleiConfig;
use crate::scanner::engine::{EngineFactory, FilterCriteria, FindingSink, ScanEngine};
use crate::scanner::types::{Finding, Severity};

/// Bytes of stderr kept for error reports.
const STDERR_TAIL_BYTES: usize = 2048;

/// Process-level options passed to every nuclei invocation.
#[derive(Debug, Clone)]
pub struct NucleiOptions {
    pub binary: PathBuf,
    pub timeout: Duration,
    pub rate_limit: u32,
    pub bulk_size: u32,
    pub template_threads: u32,
    pub headless: bool,
    pub show_browser: bool,
    pub system_resolvers: bool,
}

impl Default for NucleiOptions {
    fn default() -> Self {
        Self::from(&NucleiConfig::default())
    }
}

impl From<&NucleiConfig> for NucleiOptions {
    fn from(config: &NucleiConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: config.timeout,
            rate_limit: config.rate_limit,
            bulk_size: config.bulk_size,
            template_threads: config.template_threads,
            headless: config.headless,
            show_browser: config.show_browser,
            system_resolvers: config.system_resolvers,
        }
    }
}

impl NucleiOptions {
    /// Command line arguments for scanning `target` with `criteria`.
    pub fn build_args(&self, target: &str, criteria: &FilterCriteria) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-target".into(),
            target.into(),
            "-jsonl".into(),
            "-silent".into(),
            "-no-color".into(),
            "-disable-update-check".into(),
            "-rate-limit".into(),
            self.rate_limit.to_string(),
            "-bulk-size".into(),
            self.bulk_size.to_string(),
            "-concurrency".into(),
            self.template_threads.to_string(),
            "-timeout".into(),
            self.timeout.as_secs().max(1).to_string(),
        ];

        if let Some(severity) = criteria.severity {
            let levels: Vec<&str> = severity.and_above().into_iter().map(Severity::as_str).collect();
            args.push("-severity".into());
            args.push(levels.join(","));
        }
        if !criteria.protocols.is_empty() {
            args.push("-type".into());
            args.push(criteria.protocols.join(","));
        }
        if !criteria.template_ids.is_empty() {
            args.push("-id".into());
            args.push(criteria.template_ids.join(","));
        }
        for path in &criteria.template_paths {
            args.push("-t".into());
            args.push(path.display().to_string());
        }

        if self.headless {
            args.push("-headless".into());
        }
        if self.show_browser {
            args.push("-show-browser".into());
        }
        if self.system_resolvers {
            args.push("-system-resolvers".into());
        }

        args
    }
}

/// Result event as printed by `nuclei -jsonl`. Only the fields we keep.
#[derive(Debug, Deserialize)]
struct ResultEvent {
    #[serde(rename = "template-id")]
    template_id: String,
    #[serde(default)]
    info: EventInfo,
    #[serde(default)]
    host: String,
    #[serde(rename = "matched-at", default)]
    matched_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EventInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    description: String,
}

/// Parse one JSONL output line. Returns `None` for anything that is not a
/// result event.
pub fn parse_result_line(line: &str) -> Option<Finding> {
    let event: ResultEvent = serde_json::from_str(line.trim()).ok()?;
    Some(Finding {
        template_id: event.template_id,
        name: event.info.name,
        severity: Severity::from_engine(&event.info.severity),
        description: event.info.description.trim().to_string(),
        host: event.host,
        matched_at: event.matched_at,
    })
}

/// Keep the last `STDERR_TAIL_BYTES` of a stream.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!("failed to read nuclei stderr: {}", e);
    }
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

/// Engine backed by the nuclei binary.
#[derive(Debug)]
pub struct NucleiEngine {
    options: Arc<NucleiOptions>,
    closed: AtomicBool,
}

impl NucleiEngine {
    pub fn new(options: Arc<NucleiOptions>) -> Self {
        Self {
            options,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ScanEngine for NucleiEngine {
    async fn execute(
        &self,
        target: &str,
        criteria: &FilterCriteria,
        sink: FindingSink,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }

        let args = self.options.build_args(target, criteria);
        debug!(binary = %self.options.binary.display(), ?args, "spawning nuclei");

        let mut child = Command::new(&self.options.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Setup(format!("failed to start {}: {}", self.options.binary.display(), e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Setup("nuclei stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Setup("nuclei stderr was not captured".into()))?;
        let stderr_tail = tokio::spawn(read_tail(stderr));

        // Owns the child; dropping it on cancellation kills the process.
        let run = async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_result_line(&line) {
                    Some(finding) => {
                        sink.emit(finding);
                    }
                    None => debug!(line = %line, "ignoring non-result nuclei output"),
                }
            }
            child.wait().await
        };

        let status = tokio::select! {
            status = run => status?,
            _ = cancel.cancelled() => {
                warn!(scan_target = target, "nuclei run cancelled");
                stderr_tail.abort();
                return Err(EngineError::Cancelled);
            }
        };

        let stderr = stderr_tail.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else if stderr.is_empty() {
            Err(EngineError::Execution(format!("nuclei exited with {}", status)))
        } else {
            Err(EngineError::Execution(format!("nuclei exited with {}: {}", status, stderr)))
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Creates `NucleiEngine` instances sharing one set of options.
#[derive(Debug, Clone)]
pub struct NucleiEngineFactory {
    options: Arc<NucleiOptions>,
}

impl NucleiEngineFactory {
    pub fn new(options: NucleiOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }
}

impl EngineFactory for NucleiEngineFactory {
    fn create(&self) -> Result<Box<dyn ScanEngine>, EngineError> {
        Ok(Box::new(NucleiEngine::new(self.options.clone())))
    }
}
