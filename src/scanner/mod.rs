/// Scanning Module
///
/// - types.rs: scan results and findings
/// - cache.rs: TTL cache of scan results
/// - engine.rs: scan engine traits and the finding sink
/// - nuclei.rs: engine backed by the nuclei binary
/// - service.rs: orchestrator tying cache and engine together
/// - templates.rs: directory of user-supplied templates

pub mod cache;
pub mod engine;
pub mod nuclei;
pub mod service;
pub mod templates;
pub mod types;

pub use cache::ResultCache;
pub use engine::{EngineFactory, FilterCriteria, FindingSink, ScanEngine};
pub use nuclei::{NucleiEngine, NucleiEngineFactory, NucleiOptions};
pub use service::ScannerService;
pub use templates::TemplateStore;
pub use types::{Finding, ScanResult, Severity};
