//! Fixed-window request limiting per client

use crate::{to_chrono_duration, Metrics, RateLimitConfig};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client id used when no identifying header is present
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Headers consulted for the client address, most trusted first
const CLIENT_HEADERS: &[&str] = &["x-forwarded-for", "x-real-ip", "cf-connecting-ip", "x-client-ip"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateLimitWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}

pub struct RateLimiter {
    windows: DashMap<String, RateLimitWindow>,
    max_requests: u32,
    window: Duration,
    sweep_interval: Duration,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests: config.max_requests,
            window: config.window,
            sweep_interval: config.sweep_interval,
            metrics,
        }
    }

    pub fn check_limit(&self, client_id: &str) -> RateLimitDecision {
        self.check_limit_at(client_id, Utc::now())
    }

    /// Count one request from `client_id` at `now`
    ///
    /// The first request after a window has elapsed opens a new one. Denied
    /// requests are not counted.
    pub fn check_limit_at(&self, client_id: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let window = match self.windows.entry(client_id.to_string()) {
            Entry::Vacant(vacant) => vacant.insert(self.fresh_window(now)),
            Entry::Occupied(occupied) => {
                let mut window = occupied.into_ref();
                if now >= window.reset_at {
                    *window = self.fresh_window(now);
                } else if window.count >= self.max_requests {
                    self.metrics.rate_limit_denials.increment(1);
                    warn!("Rate limit exceeded for client {}", client_id);
                    return RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time: window.reset_at,
                    };
                } else {
                    window.count += 1;
                }
                window
            }
        };

        RateLimitDecision {
            allowed: true,
            remaining: self.max_requests.saturating_sub(window.count),
            reset_time: window.reset_at,
        }
    }

    fn fresh_window(&self, now: DateTime<Utc>) -> RateLimitWindow {
        RateLimitWindow {
            count: 1,
            reset_at: now + to_chrono_duration(self.window),
        }
    }

    /// Number of clients currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| now < window.reset_at);
        before.saturating_sub(self.windows.len())
    }

    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.sweep_interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = limiter.sweep_expired();
                        if removed > 0 {
                            info!("Rate limiter dropped {} expired windows", removed);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }

            debug!("Rate limit sweeper stopped");
        })
    }
}

/// Derive a client id from request headers
///
/// Header names match case-insensitively. For `x-forwarded-for` only the
/// first address of the list is used.
pub fn client_id_from_headers<'a, I>(headers: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let headers: Vec<(String, &str)> = headers
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect();

    for wanted in CLIENT_HEADERS {
        let value = headers
            .iter()
            .find(|(name, _)| name == wanted)
            .map(|(_, value)| value.split(',').next().unwrap_or_default().trim());

        if let Some(value) = value.filter(|v| !v.is_empty()) {
            return value.to_string();
        }
    }

    UNKNOWN_CLIENT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(
            &RateLimitConfig {
                max_requests,
                ..Default::default()
            },
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn test_first_request_opens_window() {
        let limiter = limiter(10);
        let now = Utc::now();

        let decision = limiter.check_limit_at("1.2.3.4", now);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.reset_time, now + ChronoDuration::seconds(60));
    }

    #[test]
    fn test_denies_after_limit_until_reset() {
        let limiter = limiter(10);
        let start = Utc::now();

        for i in 0..10 {
            let decision = limiter.check_limit_at("1.2.3.4", start + ChronoDuration::seconds(i));
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 9 - i as u32);
        }

        let denied = limiter.check_limit_at("1.2.3.4", start + ChronoDuration::seconds(30));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_time, start + ChronoDuration::seconds(60));

        let reopened = limiter.check_limit_at("1.2.3.4", start + ChronoDuration::seconds(60));
        assert!(reopened.allowed);
        assert_eq!(reopened.remaining, 9);
        assert_eq!(reopened.reset_time, start + ChronoDuration::seconds(120));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter(1);
        let now = Utc::now();

        assert!(limiter.check_limit_at("a", now).allowed);
        assert!(!limiter.check_limit_at("a", now).allowed);
        assert!(limiter.check_limit_at("b", now).allowed);
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_sweep_removes_elapsed_windows() {
        let limiter = limiter(10);
        let now = Utc::now();

        limiter.check_limit_at("old", now - ChronoDuration::seconds(120));
        limiter.check_limit_at("fresh", now);

        assert_eq!(limiter.sweep_expired_at(now), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_client_id_header_precedence() {
        assert_eq!(
            client_id_from_headers([("X-Forwarded-For", "203.0.113.7, 10.0.0.1"), ("X-Real-IP", "198.51.100.2")]),
            "203.0.113.7"
        );
        assert_eq!(
            client_id_from_headers([("cf-connecting-ip", "192.0.2.4"), ("x-real-ip", "198.51.100.2")]),
            "198.51.100.2"
        );
        assert_eq!(client_id_from_headers([("X-Client-IP", "192.0.2.9")]), "192.0.2.9");
        assert_eq!(client_id_from_headers([("x-forwarded-for", " ")]), UNKNOWN_CLIENT);
        assert_eq!(client_id_from_headers(Vec::<(&str, &str)>::new()), UNKNOWN_CLIENT);
    }
}
