#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use scanward_core::JobId;
use scanward_core::error::{Result, ScanError};
use scanward_core::orchestration::{
    Finding, InMemoryScanPersistence, InProcEventBus, LocalPathResolver, Location,
    OrchestrationContext, OrchestratorConfig, ResourceProfile, ScanConfig, ScanOrchestrator,
    ScannerAdapter, ScannerRegistry, Severity, StaticResourceProbe, TargetResolver,
};
use tokio::sync::Semaphore;
use scanward_core::orchestration::cache::CacheBackend;
use scanward_core::orchestration::planner::FileRelevance;
use tempfile::TempDir;

/// Scripted adapter that counts how often it really ran.
pub struct MockAdapter {
    name: &'static str,
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
    available: bool,
    findings: usize,
    profile: Option<ResourceProfile>,
    relevance: Option<FileRelevance>,
}

impl MockAdapter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: false,
            available: true,
            findings: 1,
            profile: None,
            relevance: None,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Reports its tool as missing from the host.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn findings(mut self, count: usize) -> Self {
        self.findings = count;
        self
    }

    pub fn profile(mut self, profile: ResourceProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn relevance(mut self, relevance: FileRelevance) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScannerAdapter for MockAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn describe(&self) -> ResourceProfile {
        match &self.profile {
            Some(profile) => profile.clone(),
            None => scanward_core::orchestration::registry::seed_profile(self.name)
                .unwrap_or_else(ResourceProfile::fallback),
        }
    }

    fn relevance(&self) -> FileRelevance {
        match &self.relevance {
            Some(relevance) => relevance.clone(),
            None => scanward_core::orchestration::planner::default_relevance(self.name),
        }
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn scan(&self, _target: &Path, _config: &ScanConfig) -> Result<Vec<Finding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(ScanError::execution(self.name, "tool exited with status 2"));
        }
        Ok((0..self.findings)
            .map(|i| {
                Finding::new(
                    self.name,
                    Severity::High,
                    format!("{} finding {i}", self.name),
                    Location::file("src/app.py", Some(i as u32 + 1)),
                )
            })
            .collect())
    }
}

/// Local-path resolver that holds every resolution until [`open`](Self::open)
/// is called, and counts releases.
pub struct GatedResolver {
    gate: Semaphore,
    entered: AtomicUsize,
    releases: AtomicUsize,
    opened: AtomicBool,
}

impl GatedResolver {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            entered: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            opened: AtomicBool::new(false),
        }
    }

    pub fn open(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.gate.add_permits(1);
        }
    }

    /// Resolutions that reached the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetResolver for GatedResolver {
    async fn resolve(&self, job_id: JobId, target_ref: &str) -> Result<PathBuf> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| ScanError::target(target_ref, e.to_string()))?;
        LocalPathResolver.resolve(job_id, target_ref).await
    }

    async fn release(&self, _path: &Path) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs `git` in `repo`, `false` if git is missing or the command failed.
pub fn git(repo: &Path, args: &[&str]) -> bool {
    std::process::Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["-c", "user.name=scanward", "-c", "user.email=ci@scanward.invalid"])
        .args(args)
        .output()
        .is_ok_and(|out| out.status.success())
}

/// A running orchestrator over a throwaway target directory.
pub struct Harness {
    pub orchestrator: ScanOrchestrator,
    pub persistence: Arc<InMemoryScanPersistence>,
    pub events: Arc<InProcEventBus>,
    pub probe: Arc<StaticResourceProbe>,
    target: PathBuf,
    _owned_target: Option<TempDir>,
}

impl Harness {
    pub fn target_ref(&self) -> String {
        self.target.to_string_lossy().into_owned()
    }

    pub fn target_path(&self) -> PathBuf {
        self.target.clone()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.target.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(path, contents).expect("write target file");
    }

    pub async fn shutdown(self) {
        self.orchestrator.shutdown().await;
    }
}

pub struct HarnessBuilder {
    config: OrchestratorConfig,
    adapters: Vec<Arc<MockAdapter>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    resolver: Option<Arc<dyn TargetResolver>>,
    target: Option<PathBuf>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let mut config = OrchestratorConfig::default();
        config.scheduler.poll_interval_ms = 10;
        config.workers.resize_interval_ms = 50;
        config.resources.sample_interval_ms = 10;
        Self {
            config,
            adapters: Vec::new(),
            cache_backend: None,
            resolver: None,
            target: None,
        }
    }

    /// Scans an existing directory instead of a fresh temporary one.
    pub fn target(mut self, path: impl Into<PathBuf>) -> Self {
        self.target = Some(path.into());
        self
    }

    pub fn adapter(mut self, adapter: Arc<MockAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn start(self) -> Harness {
        let (target, owned_target) = match self.target {
            Some(path) => (path, None),
            None => {
                let dir = tempfile::tempdir().expect("target dir");
                std::fs::write(dir.path().join("app.py"), "print('hello')\n")
                    .expect("seed target");
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        let mut registry = ScannerRegistry::new(self.config.profiles.ema_alpha);
        for adapter in &self.adapters {
            registry.register(Arc::clone(adapter) as Arc<dyn ScannerAdapter>);
        }

        let persistence = Arc::new(InMemoryScanPersistence::new());
        let events = Arc::new(InProcEventBus::new(256));
        let probe = Arc::new(StaticResourceProbe::idle(8, 16_384));

        let mut builder = OrchestrationContext::builder(self.config)
            .registry(registry)
            .resolver(self.resolver.unwrap_or_else(|| Arc::new(LocalPathResolver)))
            .persistence(Arc::clone(&persistence) as _)
            .event_sink(Arc::clone(&events) as _)
            .resource_probe(Arc::clone(&probe) as _);
        if let Some(backend) = self.cache_backend {
            builder = builder.cache_backend(backend);
        }
        let ctx = builder.build().expect("context builds");

        Harness {
            orchestrator: ScanOrchestrator::start(ctx),
            persistence,
            events,
            probe,
            target,
            _owned_target: owned_target,
        }
    }
}

/// Polls `check` until it holds. Persistence and events trail the job
/// status slightly, so assertions on them go through here.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    within(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

/// Bounded wait so a broken state machine fails the test instead of hanging it.
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(20), future)
        .await
        .expect("operation finished in time")
}
