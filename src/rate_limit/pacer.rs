//! Per-host request pacing.
//!
//! Keeps a minimum interval between requests to the same host. The interval
//! widens when the host throttles us and narrows back after a run of
//! successes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Interval between requests to the same host when not throttled.
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Applied to the interval once `recovery_threshold` successes accumulate.
    pub recovery_multiplier: f64,
    pub recovery_threshold: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            recovery_multiplier: 0.8,
            recovery_threshold: 5,
        }
    }
}

#[derive(Debug)]
struct HostState {
    current_delay: Duration,
    last_request: Option<Instant>,
    consecutive_successes: u32,
    in_backoff: bool,
}

impl HostState {
    fn time_until_ready(&self) -> Duration {
        match self.last_request {
            Some(last) => self.current_delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}

/// Shared, cloneable pacer.
#[derive(Debug, Clone)]
pub struct RequestPacer {
    config: PacerConfig,
    hosts: Arc<RwLock<HashMap<String, HostState>>>,
}

impl Default for RequestPacer {
    fn default() -> Self {
        Self::new(PacerConfig::default())
    }
}

impl RequestPacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            hosts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn host_of(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
    }

    /// Wait until the host is ready, then record the request start.
    pub async fn acquire(&self, url: &str) {
        let Some(host) = Self::host_of(url) else {
            return;
        };

        let wait = {
            let hosts = self.hosts.read().await;
            hosts
                .get(&host)
                .map(HostState::time_until_ready)
                .unwrap_or(Duration::ZERO)
        };
        if wait > Duration::ZERO {
            debug!("Pacing {}: waiting {:?}", host, wait);
            tokio::time::sleep(wait).await;
        }

        let mut hosts = self.hosts.write().await;
        let state = hosts.entry(host).or_insert_with(|| HostState {
            current_delay: self.config.base_delay,
            last_request: None,
            consecutive_successes: 0,
            in_backoff: false,
        });
        state.last_request = Some(Instant::now());
    }

    pub async fn report_success(&self, url: &str) {
        let Some(host) = Self::host_of(url) else {
            return;
        };
        let mut hosts = self.hosts.write().await;
        let Some(state) = hosts.get_mut(&host) else {
            return;
        };

        state.consecutive_successes += 1;
        if state.in_backoff && state.consecutive_successes >= self.config.recovery_threshold {
            state.current_delay = state
                .current_delay
                .mul_f64(self.config.recovery_multiplier)
                .max(self.config.base_delay);
            if state.current_delay <= self.config.base_delay {
                state.in_backoff = false;
                info!("{} recovered from rate limit backoff", host);
            }
            state.consecutive_successes = 0;
        }
    }

    /// Widen the interval for a host that signalled throttling.
    pub async fn report_rate_limit(&self, url: &str) {
        let Some(host) = Self::host_of(url) else {
            return;
        };
        let mut hosts = self.hosts.write().await;
        let Some(state) = hosts.get_mut(&host) else {
            return;
        };

        state.consecutive_successes = 0;
        state.in_backoff = true;
        let widened = state.current_delay.as_secs_f64() * self.config.backoff_multiplier;
        state.current_delay = if widened.is_finite() {
            Duration::from_secs_f64(widened).min(self.config.max_delay)
        } else {
            self.config.max_delay
        };
        warn!("Rate limited by {}, request interval now {:?}", host, state.current_delay);
    }

    pub async fn current_delay(&self, url: &str) -> Option<Duration> {
        let host = Self::host_of(url)?;
        self.hosts.read().await.get(&host).map(|s| s.current_delay)
    }
}
