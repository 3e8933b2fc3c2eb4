/// Scan Engine Boundary
///
/// The scanner itself is an external collaborator. The orchestrator only sees
/// these traits:
/// - `EngineFactory` builds engine instances
/// - `ScanEngine` runs a scan for one target and reports findings through a
///   `FindingSink`, then must be closed by whoever created it
///
/// `FilterCriteria` carries the template selection handed to the engine.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::EngineError;
use crate::scanner::types::{Finding, Severity};

/// Template selection for one engine run. Empty fields mean "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    /// Minimum severity; the engine runs templates at this level and above.
    pub severity: Option<Severity>,
    /// Protocol types to run (for example `http`, `dns`, `tcp`).
    pub protocols: Vec<String>,
    /// Template IDs to run.
    pub template_ids: Vec<String>,
    /// Template files or directories to load instead of the default set.
    pub template_paths: Vec<PathBuf>,
}

impl FilterCriteria {
    /// Build criteria from raw request inputs.
    ///
    /// `protocols` is a comma-separated list. `https` is dropped because the
    /// `http` protocol type already covers it.
    pub fn from_inputs(severity: Option<Severity>, protocols: &str, template_ids: &[String]) -> Self {
        let protocols = protocols
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case("https"))
            .map(str::to_string)
            .collect();

        Self {
            severity,
            protocols,
            template_ids: template_ids.to_vec(),
            template_paths: Vec::new(),
        }
    }

    /// Criteria that run exactly the given template files.
    pub fn from_templates(paths: Vec<PathBuf>) -> Self {
        Self {
            template_paths: paths,
            ..Self::default()
        }
    }
}

/// Destination for findings reported by an engine.
///
/// Clonable and usable from any thread; the engine may emit concurrently
/// from its own worker threads.
#[derive(Debug, Clone)]
pub struct FindingSink {
    tx: mpsc::UnboundedSender<Finding>,
}

impl FindingSink {
    /// Create a sink together with the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Finding>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report one finding. Returns false if the receiving side is gone.
    pub fn emit(&self, finding: Finding) -> bool {
        self.tx.send(finding).is_ok()
    }
}

/// A scan engine instance.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Run the engine against `target`, emitting every finding into `sink`
    /// before returning. Implementations that support it stop early and
    /// return `EngineError::Cancelled` when `cancel` fires.
    async fn execute(
        &self,
        target: &str,
        criteria: &FilterCriteria,
        sink: FindingSink,
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;

    /// Release the engine. Later `execute` calls fail with `EngineError::Closed`.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds engine instances.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn ScanEngine>, EngineError>;
}
