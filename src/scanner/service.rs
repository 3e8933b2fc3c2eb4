/// Scan Orchestrator
///
/// `ScannerService` sits between the tool handlers and the scan engine:
/// - Computes the cache key for a request and answers from the result cache
/// - Runs at most one engine execution per key at a time; concurrent callers
///   for the same key wait and then pick up the cached result
/// - Creates a fresh engine for every regular scan, or reuses one shared
///   engine for thread-safe scans
/// - Collects findings reported through a `FindingSink` while the engine runs
///
/// Failed scans are never cached.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{EngineError, ScanError};
use crate::scanner::cache::ResultCache;
use crate::scanner::engine::{EngineFactory, FilterCriteria, FindingSink, ScanEngine};
use crate::scanner::types::{Finding, ScanResult, Severity};

/// File name of the template used by `basic_scan`.
pub const BASIC_TEMPLATE_FILE: &str = "basic-test.yaml";

const BASIC_TEMPLATE: &str = r#"id: basic-test
info:
  name: Basic Test Template
  author: MCP
  severity: info
  description: Basic test template for nuclei

requests:
  - method: GET
    path:
      - "{{BaseURL}}"
    matchers:
      - type: status
        status:
          - 200
"#;

type Gate = Arc<AsyncMutex<()>>;

/// Holds a key's in-flight gate; the map entry goes away with its last holder.
struct InFlight<'a> {
    gates: &'a Mutex<HashMap<String, Gate>>,
    key: String,
    gate: Gate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&self.gate) <= 2 {
            gates.remove(&self.key);
        }
    }
}

pub struct ScannerService {
    cache: Arc<ResultCache>,
    factory: Arc<dyn EngineFactory>,
    shared_engine: OnceCell<Box<dyn ScanEngine>>,
    in_flight: Mutex<HashMap<String, Gate>>,
    basic_templates_dir: PathBuf,
    cache_enabled: bool,
}

impl ScannerService {
    pub fn new(
        cache: Arc<ResultCache>,
        factory: Arc<dyn EngineFactory>,
        basic_templates_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            factory,
            shared_engine: OnceCell::new(),
            in_flight: Mutex::new(HashMap::new()),
            basic_templates_dir: basic_templates_dir.into(),
            cache_enabled: true,
        }
    }

    /// Skip cache lookups and stores; every call runs the engine.
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Cache key for a scan request.
    ///
    /// `target:severity:protocols`, followed by `:ids` when template IDs are
    /// given. IDs are trimmed, sorted and deduplicated, so their order does
    /// not matter.
    pub fn compute_cache_key(target: &str, severity: Severity, protocols: &str, template_ids: &[String]) -> String {
        let ids = canonical_ids(template_ids);
        if ids.is_empty() {
            format!("{}:{}:{}", target, severity, protocols)
        } else {
            format!("{}:{}:{}:{}", target, severity, protocols, ids.join(","))
        }
    }

    /// Scan `target` with a fresh single-shot engine.
    pub async fn scan(
        &self,
        target: &str,
        severity: Severity,
        protocols: &str,
        template_ids: &[String],
    ) -> Result<ScanResult, ScanError> {
        let key = Self::compute_cache_key(target, severity, protocols, template_ids);
        let criteria = FilterCriteria::from_inputs(Some(severity), protocols, &canonical_ids(template_ids));

        self.single_flight(key, None, || async {
            info!(scan_target = target, %severity, protocols, "starting scan");
            let findings = self.run_single_shot(target, &criteria).await?;
            Ok::<_, ScanError>(ScanResult::new(target, findings))
        })
        .await
    }

    /// Scan `target` on the shared engine, honoring `cancel`.
    pub async fn thread_safe_scan(
        &self,
        cancel: CancellationToken,
        target: &str,
        severity: Severity,
        protocols: &str,
        template_ids: &[String],
    ) -> Result<ScanResult, ScanError> {
        let key = Self::compute_cache_key(target, severity, protocols, template_ids);
        let criteria = FilterCriteria::from_inputs(Some(severity), protocols, &canonical_ids(template_ids));

        self.single_flight(key, Some(&cancel), || async {
            info!(scan_target = target, %severity, protocols, "starting thread-safe scan");
            let engine = self
                .shared_engine
                .get_or_try_init(|| async { self.factory.create() })
                .await?;
            let findings = collect_findings(engine.as_ref(), target, &criteria, cancel.clone()).await?;
            Ok::<_, ScanError>(ScanResult::new(target, findings))
        })
        .await
    }

    /// Run only the basic template against `target`.
    ///
    /// The template is written to the basic template directory if missing.
    pub async fn basic_scan(&self, target: &str) -> Result<ScanResult, ScanError> {
        let key = format!("basic:{}", target);

        self.single_flight(key, None, || async {
            let template = self.ensure_basic_template().await?;
            info!(scan_target = target, template = %template.display(), "starting basic scan");
            let criteria = FilterCriteria::from_templates(vec![template]);
            let findings = self.run_single_shot(target, &criteria).await?;
            Ok::<_, ScanError>(ScanResult::new(target, findings))
        })
        .await
    }

    /// Every cached result, expired or not.
    pub fn cached_results(&self) -> Vec<ScanResult> {
        self.cache.get_all()
    }

    /// Close the shared engine if one was created.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        match self.shared_engine.get() {
            Some(engine) => {
                debug!("closing shared scan engine");
                engine.close().await
            }
            None => Ok(()),
        }
    }

    /// Answer from the cache or run `scan` under the key's in-flight gate.
    ///
    /// With `cancel`, waiting for the gate ends early when it fires.
    async fn single_flight<F, Fut>(
        &self,
        key: String,
        cancel: Option<&CancellationToken>,
        scan: F,
    ) -> Result<ScanResult, ScanError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ScanResult, ScanError>>,
    {
        if let Some(hit) = self.cached(&key) {
            info!(key = %key, "returning cached scan result");
            return Ok(hit);
        }

        let in_flight = self.acquire(&key);
        let _permit = match cancel {
            Some(cancel) => tokio::select! {
                permit = in_flight.gate.lock() => permit,
                _ = cancel.cancelled() => {
                    debug!(key = %key, "cancelled while waiting for concurrent scan");
                    return Err(EngineError::Cancelled.into());
                }
            },
            None => in_flight.gate.lock().await,
        };

        // Another caller may have finished the same scan while we waited.
        if let Some(hit) = self.cached(&key) {
            debug!(key = %key, "scan completed by concurrent caller");
            return Ok(hit);
        }

        let result = scan().await?;
        if self.cache_enabled {
            self.cache.set(key, result.clone());
        }
        Ok(result)
    }

    fn cached(&self, key: &str) -> Option<ScanResult> {
        if self.cache_enabled { self.cache.get(key) } else { None }
    }

    fn acquire(&self, key: &str) -> InFlight<'_> {
        let gate = self
            .in_flight
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        InFlight {
            gates: &self.in_flight,
            key: key.to_string(),
            gate,
        }
    }

    /// Create an engine, run it once, and always close it.
    async fn run_single_shot(&self, target: &str, criteria: &FilterCriteria) -> Result<Vec<Finding>, EngineError> {
        let engine = self.factory.create()?;
        let outcome = collect_findings(engine.as_ref(), target, criteria, CancellationToken::new()).await;
        if let Err(e) = engine.close().await {
            warn!(error = %e, "failed to close scan engine");
        }
        outcome
    }

    async fn ensure_basic_template(&self) -> Result<PathBuf, ScanError> {
        let path = self.basic_templates_dir.join(BASIC_TEMPLATE_FILE);
        let provision = |source| ScanError::Provision {
            path: path.clone(),
            source,
        };

        if tokio::fs::try_exists(&path).await.map_err(provision)? {
            return Ok(path);
        }

        info!(path = %path.display(), "creating basic template");
        tokio::fs::create_dir_all(&self.basic_templates_dir)
            .await
            .map_err(provision)?;
        tokio::fs::write(&path, BASIC_TEMPLATE).await.map_err(provision)?;
        Ok(path)
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    #[cfg(test)]
    fn basic_template_path(&self) -> PathBuf {
        self.basic_templates_dir.join(BASIC_TEMPLATE_FILE)
    }
}

fn canonical_ids(template_ids: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = template_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Run `engine` and gather its findings in arrival order.
async fn collect_findings(
    engine: &dyn ScanEngine,
    target: &str,
    criteria: &FilterCriteria,
    cancel: CancellationToken,
) -> Result<Vec<Finding>, EngineError> {
    let (sink, mut rx) = FindingSink::channel();
    let mut findings = Vec::new();

    let run = engine.execute(target, criteria, sink, cancel);
    tokio::pin!(run);

    let outcome = loop {
        tokio::select! {
            Some(finding) = rx.recv() => record(&mut findings, finding),
            outcome = &mut run => break outcome,
        }
    };

    // Emissions that raced with completion.
    while let Ok(finding) = rx.try_recv() {
        record(&mut findings, finding);
    }

    outcome.map(|()| findings)
}

fn record(findings: &mut Vec<Finding>, finding: Finding) {
    info!(
        name = %finding.name,
        severity = %finding.severity,
        host = %finding.host,
        "found vulnerability"
    );
    findings.push(finding);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Mode {
        Emit(usize),
        Fail,
        WaitForCancel,
    }

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        executed: AtomicUsize,
        closed: AtomicUsize,
    }

    struct StubEngine {
        mode: Mode,
        delay: Duration,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl ScanEngine for StubEngine {
        async fn execute(
            &self,
            target: &str,
            _criteria: &FilterCriteria,
            sink: FindingSink,
            cancel: CancellationToken,
        ) -> Result<(), EngineError> {
            self.counters.executed.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.mode {
                Mode::Emit(threads) => {
                    let handles: Vec<_> = (0..threads)
                        .map(|i| {
                            let sink = sink.clone();
                            let host = target.to_string();
                            std::thread::spawn(move || {
                                sink.emit(Finding {
                                    template_id: format!("template-{}", i),
                                    name: format!("Finding {}", i),
                                    severity: Severity::Medium,
                                    description: String::new(),
                                    host,
                                    matched_at: None,
                                });
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().map_err(|_| EngineError::Execution("emitter panicked".into()))?;
                    }
                    Ok(())
                }
                Mode::Fail => Err(EngineError::Execution("nuclei exited with status 1".into())),
                Mode::WaitForCancel => {
                    cancel.cancelled().await;
                    Err(EngineError::Cancelled)
                }
            }
        }

        async fn close(&self) -> Result<(), EngineError> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubFactory {
        mode: Mode,
        delay: Duration,
        counters: Arc<Counters>,
    }

    impl EngineFactory for StubFactory {
        fn create(&self) -> Result<Box<dyn ScanEngine>, EngineError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubEngine {
                mode: self.mode,
                delay: self.delay,
                counters: self.counters.clone(),
            }))
        }
    }

    fn service(mode: Mode, delay: Duration) -> (ScannerService, Arc<Counters>, tempfile::TempDir) {
        let counters = Arc::new(Counters::default());
        let factory = Arc::new(StubFactory {
            mode,
            delay,
            counters: counters.clone(),
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResultCache::new(Duration::from_secs(3600)));
        let service = ScannerService::new(cache, factory, dir.path().join("templates"));
        (service, counters, dir)
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(
            ScannerService::compute_cache_key("example.com", Severity::High, "http", &[]),
            "example.com:high:http"
        );
        let a = ScannerService::compute_cache_key(
            "example.com",
            Severity::Info,
            "http,https",
            &["b".to_string(), "a".to_string(), " a ".to_string()],
        );
        let b = ScannerService::compute_cache_key(
            "example.com",
            Severity::Info,
            "http,https",
            &["a".to_string(), "b".to_string()],
        );
        assert_eq!(a, b);
        assert_eq!(a, "example.com:info:http,https:a,b");
    }

    #[tokio::test]
    async fn test_scan_collects_findings_and_caches() {
        let (service, counters, _dir) = service(Mode::Emit(4), Duration::ZERO);

        let result = service.scan("example.com", Severity::Info, "http", &[]).await.unwrap();
        assert_eq!(result.target, "example.com");
        assert_eq!(result.findings.len(), 4);
        assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        let cached = service.scan("example.com", Severity::Info, "http", &[]).await.unwrap();
        assert_eq!(cached, result);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
        assert_eq!(service.cached_results().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_runs_engine() {
        let (service, counters, _dir) = service(Mode::Emit(1), Duration::ZERO);
        let service = service.with_cache_enabled(false);

        service.scan("example.com", Severity::Info, "http", &[]).await.unwrap();
        service.scan("example.com", Severity::Info, "http", &[]).await.unwrap();
        assert_eq!(counters.executed.load(Ordering::SeqCst), 2);
        assert!(service.cached_results().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_identical_scans_run_once() {
        let (service, counters, _dir) = service(Mode::Emit(2), Duration::from_millis(50));
        let service = Arc::new(service);

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.scan("example.com", Severity::High, "http", &[]).await })
            })
            .collect();
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.findings.len(), 2);
        }

        assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
        assert_eq!(service.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_scan_caches_nothing() {
        let (service, counters, _dir) = service(Mode::Fail, Duration::ZERO);

        let err = service.scan("example.com", Severity::Info, "http", &[]).await.unwrap_err();
        assert!(matches!(err, ScanError::Engine(EngineError::Execution(_))));
        assert!(err.to_string().contains("nuclei exited with status 1"));
        assert!(service.cached_results().is_empty());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        service.scan("example.com", Severity::Info, "http", &[]).await.unwrap_err();
        assert_eq!(counters.executed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_thread_safe_scan_reuses_shared_engine() {
        let (service, counters, _dir) = service(Mode::Emit(1), Duration::ZERO);

        service
            .thread_safe_scan(CancellationToken::new(), "a.example.com", Severity::Info, "http", &[])
            .await
            .unwrap();
        service
            .thread_safe_scan(CancellationToken::new(), "b.example.com", Severity::Info, "http", &[])
            .await
            .unwrap();
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.executed.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);

        service.shutdown().await.unwrap();
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_thread_safe_scan_cancellation() {
        let (service, _counters, _dir) = service(Mode::WaitForCancel, Duration::ZERO);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let err = service
            .thread_safe_scan(cancel, "example.com", Severity::Info, "http", &[])
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, ScanError::Engine(EngineError::Cancelled)));
        assert!(service.cached_results().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_thread_safe_scan_honors_its_own_cancellation() {
        let (service, counters, _dir) = service(Mode::WaitForCancel, Duration::ZERO);
        let service = Arc::new(service);
        let first_cancel = CancellationToken::new();

        let first = {
            let service = service.clone();
            let cancel = first_cancel.clone();
            tokio::spawn(async move {
                service
                    .thread_safe_scan(cancel, "example.com", Severity::Info, "http", &[])
                    .await
            })
        };
        while counters.executed.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Same key, so this caller queues behind the running scan.
        let second_cancel = CancellationToken::new();
        second_cancel.cancel();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            service.thread_safe_scan(second_cancel, "example.com", Severity::Info, "http", &[]),
        )
        .await
        .expect("waiting caller ignored its cancellation")
        .unwrap_err();
        assert!(matches!(err, ScanError::Engine(EngineError::Cancelled)));
        assert!(!first.is_finished());

        first_cancel.cancel();
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, ScanError::Engine(EngineError::Cancelled)));
        assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
        assert_eq!(service.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_basic_scan_provisions_template() {
        let (service, counters, _dir) = service(Mode::Emit(1), Duration::ZERO);
        let path = service.basic_template_path();
        assert!(!path.exists());

        let result = service.basic_scan("example.com").await.unwrap();
        assert_eq!(result.findings.len(), 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("id: basic-test"));

        service.basic_scan("example.com").await.unwrap();
        assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
        assert!(service.cache.get("basic:example.com").is_some());
    }

    #[tokio::test]
    async fn test_basic_scan_keeps_existing_template() {
        let (service, _counters, _dir) = service(Mode::Emit(0), Duration::ZERO);
        let path = service.basic_template_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "id: custom\n").unwrap();

        service.basic_scan("example.com").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "id: custom\n");
    }
}
