use crate::ScreenshotError;
use metrics::{register_counter, register_gauge, Counter, Gauge, Key, Recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Counters and gauges shared by the cache, scheduler and rate limiter
///
/// Handles are resolved against whatever recorder is installed when the
/// struct is built. Without a recorder every handle is a no-op, which is what
/// tests rely on.
pub struct Metrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_stores: Counter,
    pub cache_evictions: Counter,
    pub cache_bytes: Gauge,
    pub captures_attempted: Counter,
    pub capture_retries: Counter,
    pub jobs_created: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub queue_depth: Gauge,
    pub rate_limit_denials: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::build(|name| register_counter!(name), |name| register_gauge!(name))
    }

    /// Register every handle against `recorder` instead of the global one
    pub fn with_recorder(recorder: &dyn Recorder) -> Self {
        Self::build(
            |name| recorder.register_counter(&Key::from_name(name)),
            |name| recorder.register_gauge(&Key::from_name(name)),
        )
    }

    fn build(counter: impl Fn(&'static str) -> Counter, gauge: impl Fn(&'static str) -> Gauge) -> Self {
        Self {
            cache_hits: counter("screenshot_cache_hits_total"),
            cache_misses: counter("screenshot_cache_misses_total"),
            cache_stores: counter("screenshot_cache_stores_total"),
            cache_evictions: counter("screenshot_cache_evictions_total"),
            cache_bytes: gauge("screenshot_cache_bytes"),
            captures_attempted: counter("screenshot_captures_attempted_total"),
            capture_retries: counter("screenshot_capture_retries_total"),
            jobs_created: counter("screenshot_jobs_created_total"),
            jobs_completed: counter("screenshot_jobs_completed_total"),
            jobs_failed: counter("screenshot_jobs_failed_total"),
            queue_depth: gauge("screenshot_queue_depth"),
            rate_limit_denials: counter("screenshot_rate_limit_denials_total"),
        }
    }

    pub fn record_evictions(&self, count: usize) {
        if count > 0 {
            self.cache_evictions.increment(count as u64);
        }
    }

    pub fn set_cache_bytes(&self, bytes: u64) {
        self.cache_bytes.set(bytes as f64);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the process-wide Prometheus recorder
///
/// Must run before any [`Metrics`] is built, otherwise those handles stay
/// detached from the recorder.
pub fn install_prometheus() -> Result<PrometheusHandle, ScreenshotError> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::set_boxed_recorder(Box::new(recorder))
        .map_err(|e| ScreenshotError::Configuration(format!("metrics recorder: {e}")))?;

    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

#[cfg(test)]
pub(crate) fn gauge_value(rendered: &str, name: &str) -> Option<f64> {
    rendered
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(' ')?.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_report_to_given_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = Metrics::with_recorder(&recorder);

        metrics.set_queue_depth(3);
        metrics.rate_limit_denials.increment(2);

        let rendered = handle.render();
        assert_eq!(gauge_value(&rendered, "screenshot_queue_depth"), Some(3.0));
        assert_eq!(gauge_value(&rendered, "screenshot_rate_limit_denials_total"), Some(2.0));
    }
}
