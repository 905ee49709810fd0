//! Asynchronous capture jobs
//!
//! Jobs are executed by a single worker loop, one at a time, in submission
//! order. The loop is started on demand by [`JobScheduler::create_job`] and
//! goes idle once the queue is drained.

use crate::{
    to_chrono_duration, CapturePort, CaptureRequest, FingerprintCache, Metrics, OutputFormat,
    RawCaptureParams, RetryConfig, SchedulerConfig, ScreenshotError, UrlValidator,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = ScreenshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|e| ScreenshotError::InvalidParameter {
                name: "job_id",
                reason: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// `data:<mime>;base64,<payload>`
    pub image: String,
    pub format: OutputFormat,
    pub completed_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl JobResult {
    pub fn encode(data: &[u8], format: OutputFormat, from_cache: bool, completed_at: DateTime<Utc>) -> Self {
        let payload = base64::engine::general_purpose::STANDARD.encode(data);
        Self {
            image: format!("data:{};base64,{}", format.mime_type(), payload),
            format,
            completed_at,
            from_cache,
        }
    }

    /// Raw image bytes carried by `image`
    pub fn decode_image(&self) -> Result<Vec<u8>, ScreenshotError> {
        let payload = self
            .image
            .split_once(";base64,")
            .map(|(_, payload)| payload)
            .ok_or_else(|| ScreenshotError::Serialization("image is not a base64 data URL".to_string()))?;

        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| ScreenshotError::Serialization(e.to_string()))
    }
}

/// Internal job record
///
/// Status only moves forward: `pending -> processing -> completed | failed`.
/// The transition methods return `false` and change nothing when asked to
/// move any other way.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub request: CaptureRequest,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: CaptureRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            status: JobStatus::Pending,
            request,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        true
    }

    pub fn complete(&mut self, result: JobResult, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        true
    }

    pub fn fail(&mut self, message: String, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(message);
        self.completed_at = Some(now);
        true
    }

    /// External projection, without the capture parameters
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub is_processing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub reclaimed: usize,
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    jobs: DashMap<JobId, Job>,
    queue: Mutex<VecDeque<JobId>>,
    worker_active: AtomicBool,
    cache: Arc<FingerprintCache>,
    capture: Arc<dyn CapturePort>,
    validator: Arc<UrlValidator>,
    config: SchedulerConfig,
    metrics: Arc<Metrics>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        cache: Arc<FingerprintCache>,
        capture: Arc<dyn CapturePort>,
        validator: Arc<UrlValidator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs: DashMap::new(),
                queue: Mutex::new(VecDeque::new()),
                worker_active: AtomicBool::new(false),
                cache,
                capture,
                validator,
                config,
                metrics,
            }),
        }
    }

    /// Validate `raw`, register a pending job and make sure the worker runs
    ///
    /// Rejected requests leave no job behind.
    pub async fn create_job(&self, raw: &RawCaptureParams) -> Result<JobId, ScreenshotError> {
        let request = raw.normalize(&self.inner.validator)?;
        let job = Job::new(request, Utc::now());
        let id = job.id;

        self.inner.jobs.insert(id, job);
        let depth = {
            let mut queue = self.inner.queue.lock().await;
            queue.push_back(id);
            queue.len()
        };

        self.inner.metrics.jobs_created.increment(1);
        self.inner.metrics.set_queue_depth(depth);
        info!("Job {} queued for {} ({} waiting)", id, raw.url.trim(), depth);

        self.ensure_worker();
        Ok(id)
    }

    pub fn get_job(&self, id: &JobId) -> Option<JobView> {
        self.inner.jobs.get(id).map(|job| job.view())
    }

    /// Every tracked job, oldest first
    pub fn get_all_jobs(&self) -> Vec<JobView> {
        let mut jobs: Vec<JobView> = self.inner.jobs.iter().map(|job| job.view()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn queue_stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            is_processing: self.inner.worker_active.load(Ordering::SeqCst),
            ..Default::default()
        };

        for job in self.inner.jobs.iter() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }

        stats
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now())
    }

    /// Drop finished jobs past retention and fail jobs stuck in `processing`
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let retention = to_chrono_duration(self.inner.config.job_retention);
        let processing_timeout = to_chrono_duration(self.inner.config.processing_timeout);
        let mut report = CleanupReport::default();

        for mut job in self.inner.jobs.iter_mut() {
            let stuck = job.status == JobStatus::Processing
                && job
                    .started_at
                    .is_some_and(|started| now.signed_duration_since(started) > processing_timeout);

            if stuck {
                let message = format!(
                    "Job reclaimed: still processing after {:?}",
                    self.inner.config.processing_timeout
                );
                if job.fail(message, now) {
                    warn!("Job {} exceeded processing timeout, marked failed", job.id);
                    self.inner.metrics.jobs_failed.increment(1);
                    report.reclaimed += 1;
                }
            }
        }

        let before = self.inner.jobs.len();
        self.inner.jobs.retain(|_, job| {
            job.completed_at
                .map_or(true, |done| now.signed_duration_since(done) <= retention)
        });
        report.removed = before.saturating_sub(self.inner.jobs.len());

        report
    }

    /// Periodically run [`JobScheduler::cleanup`] until `shutdown` fires
    pub fn spawn_cleanup(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let scheduler = self.clone();
        let every = self.inner.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = scheduler.cleanup();
                        if report.removed > 0 || report.reclaimed > 0 {
                            info!(
                                "Job cleanup removed {} finished jobs, reclaimed {} stuck jobs",
                                report.removed, report.reclaimed
                            );
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }

            debug!("Job cleanup stopped");
        })
    }

    fn ensure_worker(&self) {
        if self
            .inner
            .worker_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("Starting job worker");
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.run_worker().await;
            });
        }
    }
}

impl SchedulerInner {
    async fn run_worker(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().await.pop_front();

            match next {
                Some(id) => {
                    let worker = self.clone();
                    // Run each job in its own task so a panic fails that job
                    // instead of killing the loop
                    let outcome = tokio::spawn(async move { worker.process_job(id).await }).await;
                    if let Err(e) = outcome {
                        error!("Job {} aborted: {}", id, e);
                        self.finish_failed(id, format!("Job aborted: {e}"));
                    }
                    let depth = self.queue.lock().await.len();
                    self.metrics.set_queue_depth(depth);
                }
                None => {
                    self.worker_active.store(false, Ordering::SeqCst);

                    // A job queued between the pop and the store above would
                    // otherwise sit until the next create_job
                    let queued = !self.queue.lock().await.is_empty();
                    if queued
                        && self
                            .worker_active
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                    {
                        continue;
                    }

                    debug!("Job queue drained, worker idle");
                    break;
                }
            }
        }
    }

    async fn process_job(&self, id: JobId) {
        let request = {
            let Some(mut job) = self.jobs.get_mut(&id) else {
                warn!("Job {} vanished before processing", id);
                return;
            };
            if !job.start(Utc::now()) {
                return;
            }
            job.request.clone()
        };

        debug!("Processing job {} for {}", id, request.url());

        match self.execute(&request).await {
            Ok((data, from_cache)) => {
                let now = Utc::now();
                let result = JobResult::encode(&data, request.format(), from_cache, now);
                if let Some(mut job) = self.jobs.get_mut(&id) {
                    if job.complete(result, now) {
                        self.metrics.jobs_completed.increment(1);
                        info!("Job {} completed (from cache: {})", id, from_cache);
                    }
                }
            }
            Err(e) => {
                error!("Job {} failed: {}", id, e);
                self.finish_failed(id, e.to_string());
            }
        }
    }

    fn finish_failed(&self, id: JobId, message: String) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if job.fail(message, Utc::now()) {
                self.metrics.jobs_failed.increment(1);
            }
        }
    }

    /// Cache first, then capture with retries; a failed store is not an error
    async fn execute(&self, request: &CaptureRequest) -> Result<(Vec<u8>, bool), ScreenshotError> {
        if let Some(data) = self.cache.get(request).await {
            return Ok((data, true));
        }

        let data = capture_with_retry(
            self.capture.as_ref(),
            request,
            &self.config.retry,
            &self.metrics,
        )
        .await?;

        if !self.cache.put(request, &data).await {
            warn!("Captured {} but could not cache it", request.url());
        }

        Ok((data, false))
    }
}

/// Invoke `port` until it succeeds, the error is not retryable, or the retry
/// budget runs out; the last error is returned verbatim
pub async fn capture_with_retry(
    port: &dyn CapturePort,
    request: &CaptureRequest,
    retry: &RetryConfig,
    metrics: &Metrics,
) -> Result<Vec<u8>, ScreenshotError> {
    let mut attempt = 0;

    loop {
        metrics.captures_attempted.increment(1);

        match port.capture(request).await {
            Ok(data) => return Ok(data),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for(attempt);
                warn!(
                    "Capture of {} failed (attempt {}/{}): {}; retrying in {:?}",
                    request.url(),
                    attempt + 1,
                    retry.total_attempts(),
                    e,
                    delay
                );
                metrics.capture_retries.increment(1);
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockCapturePort;
    use crate::CacheConfig;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn request() -> CaptureRequest {
        CaptureRequest::new("https://example.com", 1280, 800, false, OutputFormat::Png, 0)
    }

    async fn scheduler_with(dir: &std::path::Path, port: MockCapturePort) -> JobScheduler {
        let metrics = Arc::new(Metrics::new());
        let cache = FingerprintCache::open(
            &CacheConfig {
                directory: dir.to_path_buf(),
                fallback_directory: dir.join("fallback"),
                ..Default::default()
            },
            metrics.clone(),
        )
        .await
        .unwrap();

        JobScheduler::new(
            SchedulerConfig::default(),
            Arc::new(cache),
            Arc::new(port),
            Arc::new(UrlValidator::default()),
            metrics,
        )
    }

    #[test]
    fn test_status_only_moves_forward() {
        let now = Utc::now();
        let mut job = Job::new(request(), now);

        assert!(!job.complete(JobResult::encode(b"x", OutputFormat::Png, false, now), now));
        assert!(!job.fail("early".to_string(), now));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.completed_at.is_none());

        assert!(job.start(now));
        assert!(!job.start(now));
        assert!(job.completed_at.is_none());

        let done = now + ChronoDuration::seconds(1);
        assert!(job.complete(JobResult::encode(b"x", OutputFormat::Png, false, done), done));
        assert_eq!(job.completed_at, Some(done));

        let later = done + ChronoDuration::seconds(1);
        assert!(!job.fail("late".to_string(), later));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_at, Some(done));
    }

    #[test]
    fn test_view_hides_capture_parameters() {
        let job = Job::new(request(), Utc::now());
        let json = serde_json::to_value(job.view()).unwrap();

        assert_eq!(json["status"], "pending");
        assert!(json.get("request").is_none());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn test_result_round_trips_image() {
        let result = JobResult::encode(&[0x89, 0x50, 0x4e, 0x47], OutputFormat::Png, false, Utc::now());
        assert!(result.image.starts_with("data:image/png;base64,"));
        assert_eq!(result.decode_image().unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);
    }

    #[test]
    fn test_job_id_parsing() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-job".parse::<JobId>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_three_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut port = MockCapturePort::new();
        port.expect_capture().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ScreenshotError::NavigationTimeout(Duration::from_secs(30)))
        });

        let started = tokio::time::Instant::now();
        let result = capture_with_retry(&port, &request(), &RetryConfig::default(), &Metrics::new()).await;

        assert!(matches!(result, Err(ScreenshotError::NavigationTimeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut port = MockCapturePort::new();
        port.expect_capture().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ScreenshotError::DnsResolution("example.com".to_string()))
            } else {
                Ok(vec![1, 2, 3])
            }
        });

        let result = capture_with_retry(&port, &request(), &RetryConfig::default(), &Metrics::new()).await;

        assert_eq!(result.unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let mut port = MockCapturePort::new();
        port.expect_capture()
            .times(1)
            .returning(|_| Err(ScreenshotError::Storage("unexpected".to_string())));

        let result = capture_with_retry(&port, &request(), &RetryConfig::default(), &Metrics::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rejected_request_creates_no_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut port = MockCapturePort::new();
        port.expect_capture().never();
        let scheduler = scheduler_with(dir.path(), port).await;

        assert!(scheduler.create_job(&RawCaptureParams::new("ftp://internal")).await.is_err());
        assert!(scheduler.create_job(&RawCaptureParams::new("http://127.0.0.1")).await.is_err());
        assert!(scheduler.get_all_jobs().is_empty());
        assert_eq!(scheduler.queue_stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_finished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(dir.path(), MockCapturePort::new()).await;
        let now = Utc::now();

        let mut old = Job::new(request(), now - ChronoDuration::hours(3));
        old.start(now - ChronoDuration::hours(3));
        old.complete(
            JobResult::encode(b"x", OutputFormat::Png, false, now),
            now - ChronoDuration::hours(2),
        );
        let mut recent = Job::new(request(), now);
        recent.start(now);
        recent.fail("boom".to_string(), now - ChronoDuration::minutes(5));
        let pending = Job::new(request(), now - ChronoDuration::hours(5));

        let (old_id, recent_id, pending_id) = (old.id, recent.id, pending.id);
        for job in [old, recent, pending] {
            scheduler.inner.jobs.insert(job.id, job);
        }

        let report = scheduler.cleanup_at(now);
        assert_eq!(report, CleanupReport { removed: 1, reclaimed: 0 });
        assert!(scheduler.get_job(&old_id).is_none());
        assert!(scheduler.get_job(&recent_id).is_some());
        assert!(scheduler.get_job(&pending_id).is_some());
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_stuck_processing_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(dir.path(), MockCapturePort::new()).await;
        let now = Utc::now();

        let mut stuck = Job::new(request(), now - ChronoDuration::minutes(30));
        stuck.start(now - ChronoDuration::minutes(20));
        let id = stuck.id;
        scheduler.inner.jobs.insert(id, stuck);

        let report = scheduler.cleanup_at(now);
        assert_eq!(report.reclaimed, 1);

        let view = scheduler.get_job(&id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.unwrap().contains("reclaimed"));
        assert_eq!(view.completed_at, Some(now));
    }
}
