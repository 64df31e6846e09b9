//! Catalogue of scanner adapters, their resource profiles and learned
//! duration / success estimates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

use super::cache::CacheCategory;
use super::finding::Finding;
use super::job::ScannerSelection;
use super::planner::{FileRelevance, ProjectProfile, Recommendation, default_relevance};
use super::task::{PriorityClass, ResourceRequirement, ResourceType, ScanConfig};

/// Static description of what a scanner needs and how it is scheduled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Worker pool the scanner runs on.
    pub resource_type: ResourceType,
    /// Cores needed for admission.
    pub cpu_cores: f64,
    /// Memory needed for admission.
    pub memory_mb: u64,
    /// Base priority before hints and elevation.
    pub priority: PriorityClass,
    /// Seed for the duration estimate before any run has been observed.
    pub estimated_duration: Duration,
    /// TTL class of its results.
    pub cache_category: CacheCategory,
    /// Scanners in the same job that must finish before this one starts.
    #[serde(default)]
    pub run_after: Vec<String>,
}

impl ResourceProfile {
    /// A profile with a 60s estimate, generic cache category and no dependencies.
    pub fn new(
        resource_type: ResourceType,
        cpu_cores: f64,
        memory_mb: u64,
        priority: PriorityClass,
    ) -> Self {
        Self {
            resource_type,
            cpu_cores,
            memory_mb,
            priority,
            estimated_duration: Duration::from_secs(60),
            cache_category: CacheCategory::ScanResults,
            run_after: Vec::new(),
        }
    }

    /// Seeds the duration estimate.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    /// Sets the cache category.
    pub fn with_category(mut self, category: CacheCategory) -> Self {
        self.cache_category = category;
        self
    }

    /// Scanners that must finish first when selected in the same job.
    pub fn run_after<I, S>(mut self, scanners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_after = scanners.into_iter().map(Into::into).collect();
        self
    }

    /// CPU and memory needed for admission.
    pub fn requirement(&self) -> ResourceRequirement {
        ResourceRequirement::new(self.cpu_cores, self.memory_mb)
    }

    /// Profile used for scanners with no seed entry.
    pub fn fallback() -> Self {
        Self::new(ResourceType::CpuIntensive, 1.0, 256, PriorityClass::Medium)
    }
}

/// Built-in profiles for the well-known scanners.
pub fn seed_profile(scanner: &str) -> Option<ResourceProfile> {
    use PriorityClass::*;
    use ResourceType::*;

    let (resource_type, cpu, memory, priority, secs) = match scanner {
        "secret" => (IoIntensive, 1.0, 64, Critical, 20),
        "gitleaks" => (IoIntensive, 1.0, 128, High, 25),
        "dependency" => (NetworkIntensive, 1.0, 128, High, 30),
        "sast" => (CpuIntensive, 2.0, 256, High, 45),
        "semgrep" => (CpuIntensive, 2.0, 320, Medium, 55),
        "trivy" => (CpuIntensive, 2.0, 384, Medium, 60),
        "snyk" => (NetworkIntensive, 2.0, 512, Medium, 90),
        "safety" => (NetworkIntensive, 1.0, 96, Medium, 20),
        "npm_audit" => (NetworkIntensive, 1.0, 128, Medium, 35),
        "yarn_audit" => (NetworkIntensive, 1.0, 128, Medium, 40),
        _ => return None,
    };
    let category = match scanner {
        "dependency" | "safety" | "npm_audit" | "yarn_audit" => CacheCategory::DependencyAnalysis,
        _ => CacheCategory::ScanResults,
    };
    Some(
        ResourceProfile::new(resource_type, cpu, memory, priority)
            .with_duration(Duration::from_secs(secs))
            .with_category(category),
    )
}

/// A plug-in wrapper around one external security tool.
#[async_trait]
pub trait ScannerAdapter: Send + Sync {
    /// Registry key; also the cache key's scanner segment.
    fn name(&self) -> &str;

    /// Scheduling profile. Defaults to the built-in seed for the name.
    fn describe(&self) -> ResourceProfile {
        seed_profile(self.name()).unwrap_or_else(ResourceProfile::fallback)
    }

    /// Files whose change makes this scanner rerun.
    fn relevance(&self) -> FileRelevance {
        default_relevance(self.name())
    }

    /// Whether the underlying tool can run on this host.
    async fn is_available(&self) -> bool {
        true
    }

    /// Scans `target`; errors become a failed task, never a failed job.
    async fn scan(&self, target: &Path, config: &ScanConfig) -> Result<Vec<Finding>>;
}

/// Learned estimates for one scanner.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScannerStats {
    /// Moving average of observed run time.
    pub estimated_duration_secs: f64,
    /// Moving average of successful runs, 0 to 1.
    pub success_rate: f64,
    /// Runs folded in.
    pub samples: u64,
}

struct RegisteredScanner {
    adapter: Arc<dyn ScannerAdapter>,
    profile: ResourceProfile,
    relevance: FileRelevance,
}

/// Registered adapters plus named bundles.
pub struct ScannerRegistry {
    scanners: BTreeMap<String, RegisteredScanner>,
    bundles: HashMap<String, Vec<String>>,
    learned: RwLock<HashMap<String, ScannerStats>>,
    alpha: f64,
}

impl fmt::Debug for ScannerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerRegistry")
            .field("scanners", &self.scanners.keys().collect::<Vec<_>>())
            .field("bundles", &self.bundles.keys().collect::<Vec<_>>())
            .field("alpha", &self.alpha)
            .finish()
    }
}

/// Bundle name that selects every registered scanner.
pub const FULL_BUNDLE: &str = "full";

const RECOMMENDATION_OVERHEAD: Duration = Duration::from_secs(10);

impl Default for ScannerRegistry {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl ScannerRegistry {
    /// Empty registry with the `basic` and `advanced` bundles; `alpha` is the learning rate.
    pub fn new(alpha: f64) -> Self {
        let bundles = HashMap::from([
            (
                "basic".to_string(),
                vec!["sast".into(), "dependency".into(), "secret".into()],
            ),
            (
                "advanced".to_string(),
                vec!["snyk".into(), "trivy".into(), "semgrep".into()],
            ),
        ]);
        Self {
            scanners: BTreeMap::new(),
            bundles,
            learned: RwLock::new(HashMap::new()),
            alpha,
        }
    }

    /// Registers (or replaces) an adapter under its own name.
    pub fn register(&mut self, adapter: Arc<dyn ScannerAdapter>) -> &mut Self {
        let name = adapter.name().to_string();
        let profile = adapter.describe();
        let relevance = adapter.relevance();
        self.learned.write().insert(
            name.clone(),
            ScannerStats {
                estimated_duration_secs: profile.estimated_duration.as_secs_f64(),
                success_rate: 1.0,
                samples: 0,
            },
        );
        self.scanners.insert(
            name,
            RegisteredScanner {
                adapter,
                profile,
                relevance,
            },
        );
        self
    }

    /// Adds or replaces a named bundle.
    pub fn with_bundle<I, S>(&mut self, name: impl Into<String>, scanners: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bundles
            .insert(name.into(), scanners.into_iter().map(Into::into).collect());
        self
    }

    /// Applies the learning rate and extra bundles from configuration.
    pub fn configure(&mut self, alpha: f64, bundles: &HashMap<String, Vec<String>>) -> &mut Self {
        self.alpha = alpha;
        for (name, members) in bundles {
            self.bundles.insert(name.clone(), members.clone());
        }
        self
    }

    /// Registered scanner names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scanners.keys().map(String::as_str)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.scanners.contains_key(name)
    }

    /// The adapter registered under `name`.
    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ScannerAdapter>> {
        self.scanners.get(name).map(|s| s.adapter.clone())
    }

    /// File patterns of `name`.
    pub fn relevance(&self, name: &str) -> Option<&FileRelevance> {
        self.scanners.get(name).map(|s| &s.relevance)
    }

    /// Seed profile with the duration replaced by the learned estimate.
    pub fn profile(&self, name: &str) -> Option<ResourceProfile> {
        let mut profile = self.scanners.get(name)?.profile.clone();
        if let Some(stats) = self.learned.read().get(name) {
            profile.estimated_duration = Duration::from_secs_f64(stats.estimated_duration_secs);
        }
        Some(profile)
    }

    /// Learned run-time estimate.
    pub fn estimated_duration(&self, name: &str) -> Option<Duration> {
        self.learned
            .read()
            .get(name)
            .map(|s| Duration::from_secs_f64(s.estimated_duration_secs))
    }

    /// Learned estimates of `name`.
    pub fn stats(&self, name: &str) -> Option<ScannerStats> {
        self.learned.read().get(name).copied()
    }

    /// Resolves a selection to registered scanner names, de-duplicated and in
    /// selection order. Unknown names in an explicit list are dropped.
    ///
    /// [`ScannerSelection::Auto`] resolves against an empty project here; use
    /// [`resolve_for`](Self::resolve_for) with a detected profile instead.
    pub fn resolve(&self, selection: &ScannerSelection) -> Result<Vec<String>> {
        self.resolve_for(selection, &ProjectProfile::default())
    }

    /// Like [`resolve`](Self::resolve), with `project` driving automatic
    /// selection.
    pub fn resolve_for(
        &self,
        selection: &ScannerSelection,
        project: &ProjectProfile,
    ) -> Result<Vec<String>> {
        let requested: Vec<String> = match selection {
            ScannerSelection::Bundle(name) if name == FULL_BUNDLE => {
                self.scanners.keys().cloned().collect()
            }
            ScannerSelection::Bundle(name) => self
                .bundles
                .get(name)
                .cloned()
                .ok_or_else(|| ScanError::UnknownBundle(name.clone()))?,
            ScannerSelection::Explicit(names) => names.clone(),
            ScannerSelection::Auto => self.recommend(project).scanners(),
        };

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(requested.len());
        for name in requested {
            if !self.contains(&name) {
                tracing::warn!(scanner = %name, "requested scanner is not registered; skipping");
                continue;
            }
            if seen.insert(name.clone()) {
                resolved.push(name);
            }
        }
        Ok(resolved)
    }

    /// Folds an observed run into the moving averages.
    pub fn record_outcome(&self, name: &str, duration: Duration, success: bool) {
        let alpha = self.alpha;
        let mut learned = self.learned.write();
        let Some(stats) = learned.get_mut(name) else {
            return;
        };
        let observed = duration.as_secs_f64();
        stats.estimated_duration_secs =
            alpha * observed + (1.0 - alpha) * stats.estimated_duration_secs;
        let outcome = if success { 1.0 } else { 0.0 };
        stats.success_rate = alpha * outcome + (1.0 - alpha) * stats.success_rate;
        stats.samples += 1;
        tracing::trace!(
            scanner = name,
            duration_secs = stats.estimated_duration_secs,
            success_rate = stats.success_rate,
            "scanner profile updated"
        );
    }

    /// Scanners suggested for `project`, limited to registered ones. The
    /// estimate is the slowest suggestion plus a fixed setup overhead.
    pub fn recommend(&self, project: &ProjectProfile) -> Recommendation {
        let mut rec = Recommendation::for_project(project);
        rec.essential.retain(|name| self.contains(name));
        rec.recommended.retain(|name| self.contains(name));
        rec.estimated_duration = rec
            .scanners()
            .iter()
            .filter_map(|name| self.estimated_duration(name))
            .max()
            .map_or(Duration::ZERO, |slowest| slowest + RECOMMENDATION_OVERHEAD);
        rec
    }

    /// Which of `names` cannot run on this host right now.
    pub async fn unavailable(&self, names: &[String]) -> HashSet<String> {
        let mut missing = HashSet::new();
        for name in names {
            let Some(scanner) = self.scanners.get(name) else {
                continue;
            };
            if !scanner.adapter.is_available().await {
                tracing::warn!(scanner = %name, "scanner tool unavailable on this host");
                missing.insert(name.clone());
            }
        }
        missing
    }
}
