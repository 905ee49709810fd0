//! Content-addressable screenshot cache
//!
//! Blobs live one per file under the cache directory, named
//! `<fingerprint>.<extension>`. The in-memory index is the source of truth for
//! what is cached: whenever the index and the directory disagree, the entry is
//! dropped from the index, so a lookup never returns anything it cannot read.

use crate::{
    to_chrono_duration, CacheConfig, CaptureRequest, Fingerprint, Metrics, OutputFormat,
    ScreenshotError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Eviction stops once the aggregate size falls to this fraction of the maximum
const EVICTION_TARGET_RATIO: f64 = 0.8;

/// Infix of in-progress blob writes: `<fingerprint>.<ext>.tmp-<uuid>`
const STAGING_MARKER: &str = ".tmp-";

/// Descriptive data kept alongside each cached blob
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryMetadata {
    pub url: String,
    pub params: CaptureRequest,
    pub format: OutputFormat,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub metadata: CacheEntryMetadata,
}

impl CacheEntry {
    fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.metadata.created_at) > to_chrono_duration(max_age)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub max_age: Duration,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub directory: PathBuf,
}

pub struct FingerprintCache {
    directory: PathBuf,
    max_size: u64,
    max_age: Duration,
    sweep_interval: Duration,
    index: Mutex<HashMap<Fingerprint, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Arc<Metrics>,
}

impl FingerprintCache {
    /// Open the cache directory, falling back to the secondary one if the
    /// primary cannot be created
    pub async fn open(config: &CacheConfig, metrics: Arc<Metrics>) -> Result<Self, ScreenshotError> {
        let directory = match fs::create_dir_all(&config.directory).await {
            Ok(()) => config.directory.clone(),
            Err(e) => {
                warn!(
                    "Cannot create cache directory {}: {}; using {}",
                    config.directory.display(),
                    e,
                    config.fallback_directory.display()
                );
                fs::create_dir_all(&config.fallback_directory)
                    .await
                    .map_err(|e| {
                        ScreenshotError::Storage(format!(
                            "cannot create cache directory {}: {}",
                            config.fallback_directory.display(),
                            e
                        ))
                    })?;
                config.fallback_directory.clone()
            }
        };

        let cache = Self {
            directory,
            max_size: config.max_size_bytes,
            max_age: config.max_age,
            sweep_interval: config.sweep_interval,
            index: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics,
        };

        let orphans = cache.remove_orphans().await;
        info!(
            "Screenshot cache ready at {} ({} orphaned blobs removed)",
            cache.directory.display(),
            orphans
        );

        Ok(cache)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn get(&self, request: &CaptureRequest) -> Option<Vec<u8>> {
        self.get_at(request, Utc::now()).await
    }

    /// Look a request up as of `now`
    ///
    /// Expired entries and entries whose blob cannot be read are evicted and
    /// reported as a plain miss.
    pub async fn get_at(&self, request: &CaptureRequest, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let fingerprint = Fingerprint::of(request);

        let lookup = {
            let index = self.index.lock().await;
            index.get(&fingerprint).map(|entry| {
                (
                    entry.path.clone(),
                    entry.metadata.created_at,
                    entry.is_expired(self.max_age, now),
                )
            })
        };

        let Some((path, created_at, expired)) = lookup else {
            debug!("Cache miss for {}", fingerprint);
            self.record_miss();
            return None;
        };

        if expired {
            debug!("Cache entry {} expired", fingerprint);
            self.evict_generation(&fingerprint, created_at).await;
            self.record_miss();
            return None;
        }

        match fs::read(&path).await {
            Ok(data) => {
                if let Some(entry) = self.index.lock().await.get_mut(&fingerprint) {
                    entry.metadata.last_accessed = now;
                }
                debug!("Cache hit for {} ({} bytes)", fingerprint, data.len());
                self.record_hit();
                Some(data)
            }
            Err(e) => {
                warn!("Failed to read cached blob {}: {}", path.display(), e);
                self.evict_generation(&fingerprint, created_at).await;
                self.record_miss();
                None
            }
        }
    }

    pub async fn put(&self, request: &CaptureRequest, data: &[u8]) -> bool {
        self.put_at(request, data, Utc::now()).await
    }

    /// Store a blob for `request`; returns whether an entry was registered
    ///
    /// Storage failures are logged and leave no entry behind.
    pub async fn put_at(&self, request: &CaptureRequest, data: &[u8], now: DateTime<Utc>) -> bool {
        let fingerprint = Fingerprint::of(request);
        let format = request.format();
        let path = self.blob_path(&fingerprint, format);

        // Readers may hold the live blob open, so it is replaced by rename
        // and never rewritten in place
        let size = match self.write_blob(&path, data).await {
            Ok(size) => size,
            Err(e) => {
                warn!("Failed to store cache blob {}: {}", path.display(), e);
                self.evict(&fingerprint).await;
                return false;
            }
        };

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            path,
            metadata: CacheEntryMetadata {
                url: request.url().to_string(),
                params: request.clone(),
                format,
                size,
                created_at: now,
                last_accessed: now,
            },
        };

        self.index.lock().await.insert(fingerprint.clone(), entry);
        self.metrics.cache_stores.increment(1);
        debug!("Cached {} ({} bytes)", fingerprint, size);

        self.enforce_size_limit().await;
        true
    }

    /// Remove an entry and its blob; returns whether the index held it
    pub async fn evict(&self, fingerprint: &Fingerprint) -> bool {
        let removed = {
            let mut index = self.index.lock().await;
            let removed = index.remove(fingerprint);
            self.publish_size(&index);
            removed
        };

        match removed {
            Some(entry) => {
                self.metrics.record_evictions(1);
                remove_blob(&entry.path).await;
                true
            }
            None => false,
        }
    }

    /// Evict only if the entry is still the one created at `created_at`, so a
    /// concurrent re-store is left alone
    async fn evict_generation(&self, fingerprint: &Fingerprint, created_at: DateTime<Utc>) {
        let removed = {
            let mut index = self.index.lock().await;
            let removed = match index.get(fingerprint) {
                Some(entry) if entry.metadata.created_at == created_at => index.remove(fingerprint),
                _ => None,
            };
            self.publish_size(&index);
            removed
        };

        if let Some(entry) = removed {
            self.metrics.record_evictions(1);
            remove_blob(&entry.path).await;
        }
    }

    /// Evict least recently accessed entries until the aggregate size is back
    /// under 80% of the maximum
    async fn enforce_size_limit(&self) {
        let (victims, remaining) = {
            let mut index = self.index.lock().await;
            let mut total: u64 = index.values().map(|e| e.metadata.size).sum();

            if total <= self.max_size {
                self.metrics.set_cache_bytes(total);
                return;
            }

            let target = (self.max_size as f64 * EVICTION_TARGET_RATIO) as u64;
            let mut by_access: Vec<(DateTime<Utc>, Fingerprint)> = index
                .values()
                .map(|e| (e.metadata.last_accessed, e.fingerprint.clone()))
                .collect();
            by_access.sort();

            let mut victims = Vec::new();
            for (_, fingerprint) in by_access {
                if total <= target {
                    break;
                }
                if let Some(entry) = index.remove(&fingerprint) {
                    total -= entry.metadata.size;
                    victims.push(entry.path);
                }
            }

            (victims, total)
        };

        info!(
            "Cache over size limit, evicted {} entries ({} bytes remain)",
            victims.len(),
            remaining
        );
        self.metrics.record_evictions(victims.len());
        self.metrics.set_cache_bytes(remaining);

        for path in victims {
            remove_blob(&path).await;
        }
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<CacheEntry> = {
            let mut index = self.index.lock().await;
            let keys: Vec<Fingerprint> = index
                .values()
                .filter(|e| e.is_expired(self.max_age, now))
                .map(|e| e.fingerprint.clone())
                .collect();
            let expired = keys.iter().filter_map(|k| index.remove(k)).collect();
            self.publish_size(&index);
            expired
        };

        self.metrics.record_evictions(expired.len());
        for entry in &expired {
            remove_blob(&entry.path).await;
        }

        expired.len()
    }

    /// Evict every entry; returns how many were removed
    pub async fn clear(&self) -> usize {
        let entries: Vec<CacheEntry> = self.index.lock().await.drain().map(|(_, e)| e).collect();

        self.metrics.record_evictions(entries.len());
        self.metrics.set_cache_bytes(0);
        for entry in &entries {
            remove_blob(&entry.path).await;
        }

        info!("Cache cleared ({} entries)", entries.len());
        entries.len()
    }

    pub async fn contains(&self, request: &CaptureRequest) -> bool {
        self.index.lock().await.contains_key(&Fingerprint::of(request))
    }

    pub async fn entries(&self) -> Vec<CacheEntry> {
        self.index.lock().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            entries: index.len(),
            total_size: index.values().map(|e| e.metadata.size).sum(),
            max_size: self.max_size,
            max_age: self.max_age,
            oldest_entry: index.values().map(|e| e.metadata.created_at).min(),
            newest_entry: index.values().map(|e| e.metadata.created_at).max(),
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            directory: self.directory.clone(),
        }
    }

    /// Periodically drop expired entries until `shutdown` fires
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.sweep_interval);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = cache.sweep_expired().await;
                        if removed > 0 {
                            info!("Cache sweep removed {} expired entries", removed);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }

            debug!("Cache sweeper stopped");
        })
    }

    /// Write `data` to a staging file next to `path`, then rename it over
    /// `path`; returns the size of the stored file
    async fn write_blob(&self, path: &Path, data: &[u8]) -> std::io::Result<u64> {
        let mut staging = path.as_os_str().to_owned();
        staging.push(format!("{STAGING_MARKER}{}", uuid::Uuid::new_v4()));
        let staging = PathBuf::from(staging);

        let result: std::io::Result<u64> = async {
            fs::write(&staging, data).await?;
            let size = fs::metadata(&staging).await?.len();
            fs::rename(&staging, path).await?;
            Ok(size)
        }
        .await;

        if result.is_err() {
            remove_blob(&staging).await;
        }
        result
    }

    fn blob_path(&self, fingerprint: &Fingerprint, format: OutputFormat) -> PathBuf {
        self.directory
            .join(format!("{}.{}", fingerprint, format.extension()))
    }

    /// Delete blobs named like cache entries that the index does not track
    async fn remove_orphans(&self) -> usize {
        let mut dir = match fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cannot scan cache directory {}: {}", self.directory.display(), e);
                return 0;
            }
        };

        let tracked: Vec<PathBuf> = self
            .index
            .lock()
            .await
            .values()
            .map(|e| e.path.clone())
            .collect();

        let mut removed = 0;
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            if is_cache_file(&path) && !tracked.contains(&path) {
                remove_blob(&path).await;
                removed += 1;
            }
        }

        removed
    }

    fn publish_size(&self, index: &HashMap<Fingerprint, CacheEntry>) {
        self.metrics
            .set_cache_bytes(index.values().map(|e| e.metadata.size).sum());
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.cache_hits.increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.cache_misses.increment(1);
    }
}

/// Blob files and leftover staging files from an interrupted write
fn is_cache_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    match name.split_once(STAGING_MARKER) {
        Some((blob, _)) => is_blob_name(Path::new(blob)),
        None => is_blob_name(path),
    }
}

fn is_blob_name(path: &Path) -> bool {
    let stem_ok = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(Fingerprint::is_well_formed);
    let extension_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| OutputFormat::all().iter().any(|f| f.extension() == ext));

    stem_ok && extension_ok
}

async fn remove_blob(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove cache blob {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::gauge_value;
    use chrono::Duration as ChronoDuration;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn config(dir: &Path, max_size_bytes: u64) -> CacheConfig {
        CacheConfig {
            directory: dir.join("primary"),
            fallback_directory: dir.join("fallback"),
            max_size_bytes,
            ..Default::default()
        }
    }

    fn request(path: &str) -> CaptureRequest {
        CaptureRequest::new(
            &format!("https://example.com/{path}"),
            1280,
            800,
            false,
            OutputFormat::Png,
            0,
        )
    }

    async fn open(dir: &Path, max_size_bytes: u64) -> FingerprintCache {
        FingerprintCache::open(&config(dir, max_size_bytes), Arc::new(Metrics::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_returns_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;
        let request = request("a");

        assert!(cache.get(&request).await.is_none());
        assert!(cache.put(&request, b"png-bytes").await);
        assert_eq!(cache.get(&request).await.unwrap(), b"png-bytes");

        let equivalent = CaptureRequest::new(" HTTPS://EXAMPLE.COM/A", 1280, 800, false, OutputFormat::Png, 0);
        assert_eq!(cache.get(&equivalent).await.unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_blob_file_named_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;
        let request = CaptureRequest::new("https://example.com", 1280, 800, false, OutputFormat::Jpeg, 0);

        cache.put(&request, b"jpeg").await;

        let expected = dir
            .path()
            .join("primary")
            .join(format!("{}.jpg", Fingerprint::of(&request)));
        assert!(expected.exists());
        assert_eq!(cache.entries().await[0].metadata.size, 4);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;
        let request = request("old");
        let created = Utc::now();

        cache.put_at(&request, b"stale", created).await;

        let later = created + ChronoDuration::hours(24) + ChronoDuration::seconds(1);
        assert!(cache.get_at(&request, later).await.is_none());
        assert!(!cache.contains(&request).await);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_unreadable_blob_evicts_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;
        let request = request("gone");

        cache.put(&request, b"bytes").await;
        let path = cache.entries().await[0].path.clone();
        std::fs::remove_file(&path).unwrap();

        assert!(cache.get(&request).await.is_none());
        assert!(!cache.contains(&request).await);
    }

    #[tokio::test]
    async fn test_size_limit_keeps_most_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1000).await;
        let start = Utc::now();
        let blob = vec![7u8; 300];

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            cache
                .put_at(&request(name), &blob, start + ChronoDuration::seconds(i as i64))
                .await;
        }

        // Touch "a" so that "b" becomes the least recently used entry
        assert!(cache
            .get_at(&request("a"), start + ChronoDuration::seconds(10))
            .await
            .is_some());

        cache
            .put_at(&request("d"), &blob, start + ChronoDuration::seconds(11))
            .await;

        let stats = cache.stats().await;
        assert!(stats.total_size <= 1000);
        assert!(stats.total_size <= 800);
        assert!(!cache.contains(&request("b")).await);
        assert!(!cache.contains(&request("c")).await);
        assert!(cache.contains(&request("a")).await);
        assert!(cache.contains(&request("d")).await);
    }

    #[tokio::test]
    async fn test_under_limit_evicts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1000).await;

        cache.put(&request("a"), &[0u8; 500]).await;
        cache.put(&request("b"), &[0u8; 500]).await;

        assert_eq!(cache.stats().await.entries, 2);
    }

    #[tokio::test]
    async fn test_evict_and_clear_remove_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;

        cache.put(&request("a"), b"a").await;
        cache.put(&request("b"), b"b").await;
        let paths: Vec<PathBuf> = cache.entries().await.into_iter().map(|e| e.path).collect();

        assert!(cache.evict(&Fingerprint::of(&request("a"))).await);
        assert!(!cache.evict(&Fingerprint::of(&request("a"))).await);
        assert_eq!(cache.clear().await, 1);
        assert!(paths.iter().all(|p| !p.exists()));
        assert_eq!(cache.stats().await.total_size, 0);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;
        let now = Utc::now();

        cache.put_at(&request("old"), b"old", now - ChronoDuration::hours(25)).await;
        cache.put_at(&request("new"), b"new", now).await;

        assert_eq!(cache.sweep_expired_at(now).await, 1);
        assert!(cache.contains(&request("new")).await);
        assert!(!cache.contains(&request("old")).await);
    }

    #[tokio::test]
    async fn test_stats_hit_rate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;
        assert_eq!(cache.stats().await.hit_rate, 0.0);

        cache.put(&request("a"), b"a").await;
        cache.get(&request("a")).await;
        cache.get(&request("a")).await;
        cache.get(&request("a")).await;
        cache.get(&request("missing")).await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.max_size, 1024 * 1024);
        assert!(stats.oldest_entry.is_some());
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("primary");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let cache = open(dir.path(), 1024).await;
        assert_eq!(cache.directory(), dir.path().join("fallback"));
    }

    #[tokio::test]
    async fn test_open_removes_orphaned_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary");
        std::fs::create_dir_all(&primary).unwrap();
        let orphan = primary.join(format!("{}.png", "a".repeat(64)));
        let unrelated = primary.join("README.txt");
        std::fs::write(&orphan, b"x").unwrap();
        std::fs::write(&unrelated, b"keep").unwrap();

        let _cache = open(dir.path(), 1024).await;
        assert!(!orphan.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_open_removes_interrupted_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary");
        std::fs::create_dir_all(&primary).unwrap();
        let staging = primary.join(format!("{}.png.tmp-0f3c", "b".repeat(64)));
        let unrelated = primary.join("notes.txt.tmp-1");
        std::fs::write(&staging, b"partial").unwrap();
        std::fs::write(&unrelated, b"keep").unwrap();

        let _cache = open(dir.path(), 1024).await;
        assert!(!staging.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restore_never_exposes_partial_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(open(dir.path(), 1 << 30).await);
        let request = request("large");
        let blob: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        assert!(cache.put(&request, &blob).await);

        let writer = {
            let cache = Arc::clone(&cache);
            let request = request.clone();
            let blob = blob.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    assert!(cache.put(&request, &blob).await);
                }
            })
        };

        let mut hits = 0;
        loop {
            let finished = writer.is_finished();
            let data = cache.get(&request).await.expect("blob stays readable while restored");
            assert!(data == blob, "partial read of {} bytes", data.len());
            hits += 1;
            if finished {
                break;
            }
        }
        writer.await.unwrap();
        assert!(hits > 0);

        // Only the live blob is left, no staging files
        let files = std::fs::read_dir(dir.path().join("primary")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;
        let stored = request("a");

        assert!(cache.put(&stored, b"first").await);
        std::fs::remove_dir_all(dir.path().join("primary")).unwrap();

        assert!(!cache.put(&stored, b"second").await);
        assert!(!cache.put(&request("b"), b"other").await);
        assert_eq!(cache.stats().await.entries, 0);
        assert!(cache.get(&stored).await.is_none());
    }

    #[tokio::test]
    async fn test_size_gauge_follows_removals() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = Arc::new(Metrics::with_recorder(&recorder));
        let cache = FingerprintCache::open(&config(dir.path(), 1024 * 1024), metrics)
            .await
            .unwrap();
        let gauge = || gauge_value(&handle.render(), "screenshot_cache_bytes");
        let now = Utc::now();

        cache.put_at(&request("old"), &[0u8; 100], now - ChronoDuration::hours(25)).await;
        cache.put_at(&request("a"), &[0u8; 200], now).await;
        cache.put_at(&request("b"), &[0u8; 300], now).await;
        assert_eq!(gauge(), Some(600.0));

        assert_eq!(cache.sweep_expired_at(now).await, 1);
        assert_eq!(gauge(), Some(500.0));

        assert!(cache.evict(&Fingerprint::of(&request("a"))).await);
        assert_eq!(gauge(), Some(300.0));

        // Stale generation removed on read
        let later = now + ChronoDuration::hours(25);
        assert!(cache.get_at(&request("b"), later).await.is_none());
        assert_eq!(gauge(), Some(0.0));
        assert_eq!(cache.stats().await.total_size, 0);
    }
}
