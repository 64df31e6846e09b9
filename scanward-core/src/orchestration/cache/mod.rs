//! Content-addressed scan result cache with in-flight deduplication.
//!
//! Entries are keyed by scanner, the trailing components of the target path
//! and the scan config. An entry is only served while the target's live
//! content checksum matches the stored one and its TTL has not lapsed; any
//! mismatch evicts it. A miss claims a pending marker so that concurrent
//! requests for the same key and checksum join one execution.

mod backend;
mod payload;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

pub use backend::{CacheBackend, CacheRoot, DiskCacheBackend, MemoryCacheBackend};

use crate::error::{Result, ScanError};

use self::payload::CachedPayload;
use super::checksum::{self, ContentChecksum};
use super::config::CacheConfig;
use super::finding::Finding;
use super::planner::FileRelevance;
use super::task::{ScanConfig, TaskFailure, TaskFailureKind};

/// Cache entry classes, each with its own TTL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheCategory {
    /// Findings of ordinary scanners.
    ScanResults,
    /// Recorded target checksums.
    ContentChecksum,
    /// Findings of dependency audits, which age faster.
    DependencyAnalysis,
}

impl CacheCategory {
    /// Leading segment of the textual key.
    pub fn prefix(self) -> &'static str {
        match self {
            CacheCategory::ScanResults => "scan",
            CacheCategory::ContentChecksum => "checksum",
            CacheCategory::DependencyAnalysis => "deps",
        }
    }

    const RESULT_CATEGORIES: [CacheCategory; 2] =
        [CacheCategory::ScanResults, CacheCategory::DependencyAnalysis];
}

/// Hierarchical cache key: `{category}:{target_tag}:{scanner}:{digest}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// TTL class.
    pub category: CacheCategory,
    /// Short hash of the target's trailing path components.
    pub target_tag: String,
    /// Scanner name.
    pub scanner: String,
    /// Hash of scanner, path hierarchy and scan config.
    pub digest: String,
}

impl CacheKey {
    /// Key for `scanner` over `target` with `config`.
    pub fn derive(
        category: CacheCategory,
        scanner: &str,
        target: &Path,
        config: &ScanConfig,
        path_components: usize,
    ) -> Self {
        let hierarchy = path_hierarchy(target, path_components);
        let material = serde_json::json!({
            "scanner": scanner,
            "path_hierarchy": hierarchy,
            "config": config.0,
        });
        let digest = hex::encode(Sha256::digest(material.to_string().as_bytes()));

        Self {
            category,
            target_tag: target_tag_for(&hierarchy),
            scanner: scanner.to_string(),
            digest: digest[..12].to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.category.prefix(),
            self.target_tag,
            self.scanner,
            self.digest
        )
    }
}

/// Last `n` normal components of `target`, joined with `/`.
pub fn path_hierarchy(target: &Path, n: usize) -> String {
    let parts: Vec<_> = target
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    let start = parts.len().saturating_sub(n);
    parts[start..].join("/")
}

fn target_tag_for(hierarchy: &str) -> String {
    let digest = hex::encode(Sha256::digest(hierarchy.as_bytes()));
    digest[..8].to_string()
}

/// A served cache entry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Key the entry was stored under.
    pub key: CacheKey,
    /// Target the findings were produced for.
    pub target: PathBuf,
    /// Content checksum at scan time.
    pub checksum: ContentChecksum,
    /// Write time.
    pub stored_at: DateTime<Utc>,
    /// Lifetime from `stored_at`.
    pub ttl: Duration,
    /// Cached scanner output.
    pub findings: Vec<Finding>,
}

impl CacheEntry {
    fn from_payload(key: CacheKey, payload: CachedPayload) -> Self {
        Self {
            key,
            target: payload.target,
            checksum: payload.checksum,
            stored_at: payload.stored_at,
            ttl: Duration::from_secs(payload.ttl_secs),
            findings: payload.findings,
        }
    }

    fn valid_for(&self, checksum: &ContentChecksum, now: DateTime<Utc>) -> bool {
        &self.checksum == checksum && now < expiry(self.stored_at, self.ttl)
    }
}

fn expiry(stored_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| stored_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Clone, Debug)]
struct IndexedEntry {
    target_tag: String,
    checksum: ContentChecksum,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

impl IndexedEntry {
    fn valid_for(&self, checksum: &ContentChecksum, now: DateTime<Utc>) -> bool {
        &self.checksum == checksum && now < expiry(self.stored_at, self.ttl)
    }
}

#[derive(Clone, Debug)]
struct ChecksumRecord {
    checksum: ContentChecksum,
    recorded_at: DateTime<Utc>,
}

/// Result shared by every participant of one in-flight execution.
pub type ClaimOutcome = std::result::Result<Vec<Finding>, TaskFailure>;

type OutcomeSlot = Option<Arc<ClaimOutcome>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct InflightKey {
    key: CacheKey,
    checksum: ContentChecksum,
}

#[derive(Default)]
struct CacheState {
    index: HashMap<CacheKey, IndexedEntry>,
    inflight: HashMap<InflightKey, watch::Sender<OutcomeSlot>>,
    checksums: HashMap<String, ChecksumRecord>,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    stores: AtomicU64,
    dedup_joins: AtomicU64,
    corruptions: AtomicU64,
}

/// Counter snapshot returned by [`CacheStore::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from a valid entry.
    pub hits: u64,
    /// Lookups that claimed an execution.
    pub misses: u64,
    /// Entries dropped for age, content drift or invalidation.
    pub evictions: u64,
    /// Results written.
    pub stores: u64,
    /// Lookups that joined an in-flight execution.
    pub dedup_joins: u64,
    /// Entries that failed to decode.
    pub corruptions: u64,
}

impl CacheStats {
    /// `hits / (hits + misses)`, zero before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Identifies what is being looked up or stored.
#[derive(Clone, Copy, Debug)]
pub struct CacheRequest<'a> {
    /// Scanner name.
    pub scanner: &'a str,
    /// Resolved target.
    pub target: &'a Path,
    /// Scanner options; part of the key.
    pub config: &'a ScanConfig,
    /// TTL class; defaults to scan results.
    pub category: CacheCategory,
    /// Files that feed the content checksum. `None` hashes the whole target.
    pub scope: Option<&'a FileRelevance>,
}

impl<'a> CacheRequest<'a> {
    /// A request for generic scan results over the whole target.
    pub fn new(scanner: &'a str, target: &'a Path, config: &'a ScanConfig) -> Self {
        Self {
            scanner,
            target,
            config,
            category: CacheCategory::ScanResults,
            scope: None,
        }
    }

    /// Stores results under this category and its TTL.
    pub fn category(mut self, category: CacheCategory) -> Self {
        self.category = category;
        self
    }

    /// Validates entries against a checksum of the files `relevance` matches
    /// instead of the whole target.
    pub fn scoped_to(mut self, relevance: &'a FileRelevance) -> Self {
        self.scope = Some(relevance);
        self
    }

    fn whole_target(&self) -> bool {
        self.scope.is_none_or(|scope| scope.any)
    }
}

/// Outcome of [`CacheStore::lookup`].
#[derive(Debug)]
pub enum CacheLookup {
    /// A valid entry for the live content.
    Hit(CacheEntry),
    /// Nothing usable; the caller now owns the execution for this key.
    Miss(CacheClaim),
    /// Another caller is already executing; wait on its result.
    InFlight(PendingExecution),
}

impl CacheLookup {
    /// Whether a valid entry was found.
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

struct CacheInner {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    state: Mutex<CacheState>,
    counters: CacheCounters,
}

/// Shared handle to the result cache.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (indexed, inflight) = self
            .inner
            .state
            .try_lock()
            .map(|s| (s.index.len(), s.inflight.len()))
            .unwrap_or_default();
        f.debug_struct("CacheStore")
            .field("backend", &self.inner.backend)
            .field("indexed", &indexed)
            .field("inflight", &inflight)
            .finish()
    }
}

impl CacheStore {
    /// Cache over an explicit backend.
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                backend,
                state: Mutex::new(CacheState::default()),
                counters: CacheCounters::default(),
            }),
        }
    }

    /// Disk-backed when `config.root` is set, in-memory otherwise.
    pub fn from_config(config: CacheConfig) -> Self {
        let backend: Arc<dyn CacheBackend> = match &config.root {
            Some(root) => Arc::new(DiskCacheBackend::new(CacheRoot::new(root.clone()))),
            None => Arc::new(MemoryCacheBackend::new()),
        };
        Self::new(config, backend)
    }

    /// Settings in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Key a request maps to.
    pub fn key_for(&self, request: &CacheRequest<'_>) -> CacheKey {
        CacheKey::derive(
            request.category,
            request.scanner,
            request.target,
            request.config,
            self.inner.config.path_components,
        )
    }

    /// Serves a valid entry, or claims / joins the execution for this key.
    pub async fn lookup(&self, request: &CacheRequest<'_>) -> CacheLookup {
        self.acquire(request, true).await
    }

    /// Like [`lookup`](Self::lookup) but never serves a stored entry. The
    /// caller still joins an in-flight execution if one exists.
    pub async fn refresh(&self, request: &CacheRequest<'_>) -> CacheLookup {
        self.acquire(request, false).await
    }

    /// Computes the live checksum and persists `findings` under it.
    pub async fn store(
        &self,
        request: &CacheRequest<'_>,
        findings: Vec<Finding>,
    ) -> Result<CacheEntry> {
        let key = self.key_for(request);
        let checksum = self.live_checksum(request, &key).await;
        self.persist(key, request.scanner, request.target, checksum, findings)
            .await
    }

    /// Removes every entry derived from `target`. Returns how many were
    /// dropped from the index or the backend.
    pub async fn invalidate_path(&self, target: &Path) -> Result<usize> {
        let hierarchy = path_hierarchy(target, self.inner.config.path_components);
        let tag = target_tag_for(&hierarchy);

        let mut keys: HashSet<String> = {
            let mut state = self.inner.state.lock();
            state.checksums.remove(&tag);
            let doomed: Vec<CacheKey> = state
                .index
                .iter()
                .filter(|(_, entry)| entry.target_tag == tag)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                state.index.remove(key);
            }
            doomed.iter().map(ToString::to_string).collect()
        };

        for category in CacheCategory::RESULT_CATEGORIES {
            let prefix = format!("{}:{}:", category.prefix(), tag);
            keys.extend(self.inner.backend.keys_with_prefix(&prefix).await?);
        }

        for key in &keys {
            if let Err(err) = self.inner.backend.remove(key).await {
                tracing::warn!(key = %key, error = %err, "failed to remove invalidated cache entry");
            }
        }

        let removed = keys.len();
        self.inner
            .counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(path = %target.display(), removed, "invalidated cached results");
        Ok(removed)
    }

    /// The most recent checksum observed for `target`, if still within the
    /// content-checksum TTL.
    pub fn last_checksum(&self, target: &Path) -> Option<ContentChecksum> {
        let hierarchy = path_hierarchy(target, self.inner.config.path_components);
        let tag = target_tag_for(&hierarchy);
        let ttl = self
            .inner
            .config
            .ttl
            .for_category(CacheCategory::ContentChecksum);
        let state = self.inner.state.lock();
        state
            .checksums
            .get(&tag)
            .filter(|record| Utc::now() < expiry(record.recorded_at, ttl))
            .map(|record| record.checksum.clone())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            dedup_joins: c.dedup_joins.load(Ordering::Relaxed),
            corruptions: c.corruptions.load(Ordering::Relaxed),
        }
    }

    /// Drops index entries and checksum records whose TTL has lapsed, and
    /// removes the matching backend entries. Returns how many result entries
    /// were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let checksum_ttl = self
            .inner
            .config
            .ttl
            .for_category(CacheCategory::ContentChecksum);
        let expired: Vec<CacheKey> = {
            let mut state = self.inner.state.lock();
            state
                .checksums
                .retain(|_, record| now < expiry(record.recorded_at, checksum_ttl));
            let expired: Vec<CacheKey> = state
                .index
                .iter()
                .filter(|(_, entry)| now >= expiry(entry.stored_at, entry.ttl))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.index.remove(key);
            }
            expired
        };

        for key in &expired {
            if let Err(err) = self.inner.backend.remove(&key.to_string()).await {
                tracing::warn!(key = %key, error = %err, "failed to remove expired cache entry");
            }
        }
        if !expired.is_empty() {
            self.inner
                .counters
                .evictions
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::debug!(removed = expired.len(), "swept expired cache entries");
        }
        expired.len()
    }

    /// Number of entries known to the in-memory index.
    pub fn indexed_count(&self) -> usize {
        self.inner.state.lock().index.len()
    }

    /// Executions currently claimed and not yet settled.
    pub fn inflight_count(&self) -> usize {
        self.inner.state.lock().inflight.len()
    }

    async fn acquire(&self, request: &CacheRequest<'_>, serve_cached: bool) -> CacheLookup {
        let key = self.key_for(request);
        let checksum = self.live_checksum(request, &key).await;
        let inflight_key = InflightKey {
            key: key.clone(),
            checksum: checksum.clone(),
        };

        // An entry may land between the fetch and the claim; go around again
        // until it is served, joined or claimed.
        loop {
            if serve_cached && let Some(entry) = self.fetch_valid(&key, &checksum).await {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "result cache hit");
                return CacheLookup::Hit(entry);
            }

            let mut state = self.inner.state.lock();
            if let Some(sender) = state.inflight.get(&inflight_key) {
                self.inner
                    .counters
                    .dedup_joins
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "joining in-flight execution");
                return CacheLookup::InFlight(PendingExecution {
                    key,
                    rx: sender.subscribe(),
                });
            }
            let landed = serve_cached
                && state
                    .index
                    .get(&key)
                    .is_some_and(|entry| entry.valid_for(&checksum, Utc::now()));
            if landed {
                continue;
            }
            let (sender, _) = watch::channel(None);
            state.inflight.insert(inflight_key.clone(), sender);
            break;
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, "result cache miss; execution claimed");
        CacheLookup::Miss(CacheClaim {
            store: self.clone(),
            inflight_key,
            scanner: request.scanner.to_string(),
            target: request.target.to_path_buf(),
            settled: false,
        })
    }

    /// Checksum of the request's scope. Whole-target checksums are also
    /// recorded for [`last_checksum`](Self::last_checksum).
    async fn live_checksum(&self, request: &CacheRequest<'_>, key: &CacheKey) -> ContentChecksum {
        let scope = request.scope.filter(|_| !request.whole_target()).cloned();
        let checksum = checksum::compute_async(request.target.to_path_buf(), scope).await;
        if request.whole_target() {
            self.record_checksum(&key.target_tag, &checksum);
        }
        checksum
    }

    async fn fetch_valid(&self, key: &CacheKey, checksum: &ContentChecksum) -> Option<CacheEntry> {
        let now = Utc::now();
        let indexed = self.inner.state.lock().index.get(key).cloned();
        if let Some(meta) = &indexed
            && !meta.valid_for(checksum, now)
        {
            self.evict(key, "checksum or ttl mismatch").await;
            return None;
        }

        let key_str = key.to_string();
        let bytes = match self.inner.backend.read(&key_str).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                if indexed.is_some() {
                    self.inner.state.lock().index.remove(key);
                }
                return None;
            }
            Err(err @ ScanError::CacheCorruption { .. }) => {
                self.note_corruption(key, &err).await;
                return None;
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "result cache read failed; treating as miss");
                self.inner.state.lock().index.remove(key);
                return None;
            }
        };

        let entry = match CachedPayload::decode(&key_str, &bytes) {
            Ok(payload) => CacheEntry::from_payload(key.clone(), payload),
            Err(err) => {
                self.note_corruption(key, &err).await;
                return None;
            }
        };

        if !entry.valid_for(checksum, now) {
            self.evict(key, "checksum or ttl mismatch").await;
            return None;
        }

        self.inner.state.lock().index.insert(
            key.clone(),
            IndexedEntry {
                target_tag: key.target_tag.clone(),
                checksum: entry.checksum.clone(),
                stored_at: entry.stored_at,
                ttl: entry.ttl,
            },
        );
        Some(entry)
    }

    async fn persist(
        &self,
        key: CacheKey,
        scanner: &str,
        target: &Path,
        checksum: ContentChecksum,
        findings: Vec<Finding>,
    ) -> Result<CacheEntry> {
        let ttl = self.inner.config.ttl.for_category(key.category);
        let payload = CachedPayload::new(
            scanner,
            target.to_path_buf(),
            key.category,
            checksum,
            ttl.as_secs(),
            findings,
        );
        let bytes = payload.encode(self.inner.config.compression_level)?;
        self.inner.backend.write(&key.to_string(), &bytes).await?;

        self.inner.state.lock().index.insert(
            key.clone(),
            IndexedEntry {
                target_tag: key.target_tag.clone(),
                checksum: payload.checksum.clone(),
                stored_at: payload.stored_at,
                ttl,
            },
        );
        self.inner.counters.stores.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, findings = payload.findings.len(), "stored scan result");
        Ok(CacheEntry::from_payload(key, payload))
    }

    async fn evict(&self, key: &CacheKey, reason: &str) {
        self.inner.state.lock().index.remove(key);
        if let Err(err) = self.inner.backend.remove(&key.to_string()).await {
            tracing::warn!(key = %key, error = %err, "failed to evict stale cache entry");
        }
        self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, reason, "evicted cache entry");
    }

    async fn note_corruption(&self, key: &CacheKey, err: &ScanError) {
        tracing::warn!(key = %key, error = %err, "corrupt cache entry; scanning fresh");
        self.inner
            .counters
            .corruptions
            .fetch_add(1, Ordering::Relaxed);
        self.evict(key, "corrupt").await;
    }

    fn record_checksum(&self, target_tag: &str, checksum: &ContentChecksum) {
        self.inner.state.lock().checksums.insert(
            target_tag.to_string(),
            ChecksumRecord {
                checksum: checksum.clone(),
                recorded_at: Utc::now(),
            },
        );
    }

    fn settle(&self, inflight_key: &InflightKey, outcome: ClaimOutcome) {
        let sender = self.inner.state.lock().inflight.remove(inflight_key);
        if let Some(sender) = sender {
            sender.send_replace(Some(Arc::new(outcome)));
        }
    }
}

/// Ownership of the single execution for a (key, checksum) pair.
///
/// Finish it with [`complete`](Self::complete). Dropping an unfinished claim
/// releases waiters with an `Abandoned` failure.
pub struct CacheClaim {
    store: CacheStore,
    inflight_key: InflightKey,
    scanner: String,
    target: PathBuf,
    settled: bool,
}

impl fmt::Debug for CacheClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClaim")
            .field("key", &self.inflight_key.key.to_string())
            .field("settled", &self.settled)
            .finish()
    }
}

impl CacheClaim {
    /// Key being executed.
    pub fn key(&self) -> &CacheKey {
        &self.inflight_key.key
    }

    /// Checksum captured before the execution started. Results are stored
    /// under it, so edits made during the scan invalidate them.
    pub fn checksum(&self) -> &ContentChecksum {
        &self.inflight_key.checksum
    }

    /// Stores a successful outcome, then releases every waiter with it.
    pub async fn complete(mut self, outcome: ClaimOutcome) -> Option<CacheEntry> {
        let stored = match &outcome {
            Ok(findings) => match self
                .store
                .persist(
                    self.inflight_key.key.clone(),
                    &self.scanner,
                    &self.target,
                    self.inflight_key.checksum.clone(),
                    findings.clone(),
                )
                .await
            {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(
                        key = %self.inflight_key.key,
                        error = %err,
                        "failed to store scan result"
                    );
                    None
                }
            },
            Err(_) => None,
        };
        self.settled = true;
        self.store.settle(&self.inflight_key, outcome);
        stored
    }
}

impl Drop for CacheClaim {
    fn drop(&mut self) {
        if !self.settled {
            self.settled = true;
            self.store.settle(
                &self.inflight_key,
                Err(TaskFailure::new(
                    TaskFailureKind::Abandoned,
                    "in-flight execution ended without a result",
                )),
            );
        }
    }
}

/// Handle on another caller's in-flight execution.
#[derive(Debug)]
pub struct PendingExecution {
    key: CacheKey,
    rx: watch::Receiver<OutcomeSlot>,
}

impl PendingExecution {
    /// Key being waited on.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits for the owner's outcome, but no longer than `deadline`.
    pub async fn wait(mut self, deadline: Duration) -> ClaimOutcome {
        let shared = match tokio::time::timeout(deadline, self.rx.wait_for(Option::is_some)).await {
            Ok(Ok(slot)) => (*slot).clone(),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(key = %self.key, deadline_secs = deadline.as_secs(), "shared execution did not finish in time");
                return Err(TaskFailure::new(
                    TaskFailureKind::Timeout,
                    format!(
                        "shared execution did not finish within {}s",
                        deadline.as_secs()
                    ),
                ));
            }
        };
        match shared {
            Some(outcome) => (*outcome).clone(),
            None => Err(TaskFailure::new(
                TaskFailureKind::Abandoned,
                "in-flight execution ended without a result",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::finding::{Location, Severity};
    use std::fs;
    use tempfile::TempDir;

    fn store() -> (CacheStore, Arc<MemoryCacheBackend>) {
        let backend = Arc::new(MemoryCacheBackend::new());
        (CacheStore::new(CacheConfig::default(), backend.clone()), backend)
    }

    fn finding() -> Finding {
        Finding::new(
            "secret",
            Severity::High,
            "AWS key",
            Location::file("app.py", Some(3)),
        )
    }

    #[test]
    fn hierarchy_keeps_trailing_components() {
        let path = Path::new("/srv/work/org/project/repo");
        assert_eq!(path_hierarchy(path, 3), "org/project/repo");
        assert_eq!(path_hierarchy(Path::new("repo"), 3), "repo");
    }

    #[test]
    fn key_depends_on_scanner_and_config() {
        let target = Path::new("/a/b/c");
        let cfg = ScanConfig::new();
        let a = CacheKey::derive(CacheCategory::ScanResults, "secret", target, &cfg, 3);
        let b = CacheKey::derive(CacheCategory::ScanResults, "sast", target, &cfg, 3);
        let c = CacheKey::derive(
            CacheCategory::ScanResults,
            "secret",
            target,
            &ScanConfig::new().with("language", "python"),
            3,
        );
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.target_tag, b.target_tag);
        assert!(a.to_string().starts_with(&format!("scan:{}:secret:", a.target_tag)));
    }

    #[tokio::test]
    async fn corrupt_payload_is_a_miss_and_evicted() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "x").expect("write");
        let (store, backend) = store();
        let cfg = ScanConfig::new();
        let request = CacheRequest::new("secret", dir.path(), &cfg);

        let entry = store.store(&request, vec![finding()]).await.expect("store");
        backend.put_raw(&entry.key.to_string(), b"garbage".to_vec());
        // Drop the index so the damaged bytes are actually read.
        store.inner.state.lock().index.clear();

        let lookup = store.lookup(&request).await;
        assert!(matches!(lookup, CacheLookup::Miss(_)));
        assert_eq!(store.stats().corruptions, 1);
        drop(lookup);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn dropped_claim_releases_waiters_as_abandoned() {
        let dir = TempDir::new().expect("tempdir");
        let (store, _) = store();
        let cfg = ScanConfig::new();
        let request = CacheRequest::new("secret", dir.path(), &cfg);

        let claim = match store.lookup(&request).await {
            CacheLookup::Miss(claim) => claim,
            other => panic!("expected miss, got {other:?}"),
        };
        let pending = match store.lookup(&request).await {
            CacheLookup::InFlight(pending) => pending,
            other => panic!("expected in-flight, got {other:?}"),
        };
        drop(claim);

        let outcome = pending.wait(Duration::from_secs(5)).await;
        assert_eq!(
            outcome.expect_err("abandoned").kind,
            TaskFailureKind::Abandoned
        );
        assert_eq!(store.inflight_count(), 0);
    }

    #[tokio::test]
    async fn completed_claim_is_served_to_next_lookup() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "x").expect("write");
        let (store, _) = store();
        let cfg = ScanConfig::new();
        let request = CacheRequest::new("secret", dir.path(), &cfg);

        let CacheLookup::Miss(claim) = store.lookup(&request).await else {
            panic!("expected miss");
        };
        claim.complete(Ok(vec![finding()])).await.expect("stored");

        match store.lookup(&request).await {
            CacheLookup::Hit(entry) => assert_eq!(entry.findings, vec![finding()]),
            other => panic!("expected hit, got {other:?}"),
        }
        assert!(store.last_checksum(dir.path()).is_some());
    }

    #[tokio::test]
    async fn waiter_gives_up_when_the_owner_hangs() {
        let dir = TempDir::new().expect("tempdir");
        let (store, _) = store();
        let cfg = ScanConfig::new();
        let request = CacheRequest::new("secret", dir.path(), &cfg);

        let CacheLookup::Miss(_claim) = store.lookup(&request).await else {
            panic!("expected miss");
        };
        let CacheLookup::InFlight(pending) = store.lookup(&request).await else {
            panic!("expected in-flight");
        };

        let outcome = pending.wait(Duration::from_millis(50)).await;
        assert_eq!(outcome.expect_err("timed out").kind, TaskFailureKind::Timeout);
        assert_eq!(store.inflight_count(), 1);
    }

    #[derive(Debug)]
    struct UnreadableBackend(MemoryCacheBackend);

    #[async_trait::async_trait]
    impl CacheBackend for UnreadableBackend {
        async fn read(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(ScanError::Internal("disk unavailable".into()))
        }

        async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
            self.0.write(key, bytes).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.keys_with_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn unreadable_entry_still_claims_the_execution() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "x").expect("write");
        let store = CacheStore::new(
            CacheConfig::default(),
            Arc::new(UnreadableBackend(MemoryCacheBackend::new())),
        );
        let cfg = ScanConfig::new();
        let request = CacheRequest::new("secret", dir.path(), &cfg);
        store.store(&request, vec![finding()]).await.expect("store");

        let first = store.lookup(&request).await;
        let second = store.lookup(&request).await;

        assert!(matches!(first, CacheLookup::Miss(_)));
        assert!(matches!(second, CacheLookup::InFlight(_)));
        assert_eq!(store.inflight_count(), 1);
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries_everywhere() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "x").expect("write");
        let backend = Arc::new(MemoryCacheBackend::new());
        let mut config = CacheConfig::default();
        config.ttl.scan_results_secs = 0;
        config.ttl.content_checksum_secs = 0;
        let store = CacheStore::new(config, backend.clone());
        let cfg = ScanConfig::new();

        store
            .store(&CacheRequest::new("secret", dir.path(), &cfg), vec![finding()])
            .await
            .expect("store");
        store
            .store(
                &CacheRequest::new("dependency", dir.path(), &cfg)
                    .category(CacheCategory::DependencyAnalysis),
                vec![finding()],
            )
            .await
            .expect("store");
        assert_eq!(store.indexed_count(), 2);

        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.indexed_count(), 1);
        assert!(store.last_checksum(dir.path()).is_none());
        assert_eq!(
            backend
                .keys_with_prefix("scan:")
                .await
                .expect("keys")
                .len(),
            0
        );
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn key_digest_hashes_the_documented_json_object() {
        let target = Path::new("/srv/org/project/repo");
        let cfg = ScanConfig::new().with("language", "python");
        let key = CacheKey::derive(CacheCategory::ScanResults, "secret", target, &cfg, 3);

        let material = serde_json::json!({
            "scanner": "secret",
            "path_hierarchy": "org/project/repo",
            "config": { "language": "python" },
        });
        let expected = hex::encode(Sha256::digest(material.to_string().as_bytes()));
        assert_eq!(key.digest, expected[..12]);
        assert_eq!(key.target_tag, hex::encode(Sha256::digest(b"org/project/repo"))[..8]);
    }

    #[tokio::test]
    async fn scoped_entries_survive_unrelated_edits() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("requirements.txt"), "flask==2.0").expect("write");
        fs::write(dir.path().join("app.py"), "x = 1").expect("write");
        let (store, _) = store();
        let cfg = ScanConfig::new();
        let manifests = FileRelevance::default().file_names(["requirements.txt"]);
        let request = CacheRequest::new("dependency", dir.path(), &cfg).scoped_to(&manifests);
        store.store(&request, vec![finding()]).await.expect("store");

        fs::write(dir.path().join("app.py"), "x = 1\ny = 2").expect("edit source");
        assert!(store.lookup(&request).await.is_hit());

        fs::write(dir.path().join("requirements.txt"), "flask==3.0.1").expect("edit manifest");
        assert!(matches!(store.lookup(&request).await, CacheLookup::Miss(_)));
    }

    #[tokio::test]
    async fn refresh_skips_valid_entries() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "x").expect("write");
        let (store, _) = store();
        let cfg = ScanConfig::new();
        let request = CacheRequest::new("secret", dir.path(), &cfg);
        store.store(&request, vec![finding()]).await.expect("store");

        assert!(matches!(store.refresh(&request).await, CacheLookup::Miss(_)));
    }
}
