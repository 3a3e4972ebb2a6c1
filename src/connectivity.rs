//! Real-reachability probe.
//!
//! Link-layer state only says whether an interface is up, not whether the
//! internet is reachable. The probe issues a single time-boxed HEAD request
//! to a well-known endpoint and caches the verdict for a few seconds so
//! frequent sync triggers don't turn into request storms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::SyncConfig;

pub struct ConnectivityProbe {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    cache_ttl: Duration,
    /// Platform link-layer flag; callers flip this on interface up/down events.
    link_up: AtomicBool,
    cache: Mutex<Option<(Instant, bool)>>,
}

impl ConnectivityProbe {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
            cache_ttl,
            link_up: AtomicBool::new(true),
            cache: Mutex::new(None),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.probe_endpoint.clone(),
            Duration::from_millis(config.probe_timeout_ms),
            Duration::from_millis(config.probe_cache_ms),
        )
    }

    pub fn set_link_state(&self, up: bool) {
        self.link_up.store(up, Ordering::Relaxed);
    }

    pub fn link_state(&self) -> bool {
        self.link_up.load(Ordering::Relaxed)
    }

    /// Check whether the internet is actually reachable.
    ///
    /// Cached result within the TTL is returned without any I/O. A downed
    /// link short-circuits to `false` without issuing a request. Otherwise a
    /// single HEAD request decides; any failure (timeout, network error,
    /// non-success status) counts as offline. No retries here — the
    /// periodic sync tick re-polls.
    pub async fn is_actually_online(&self) -> bool {
        if let Some(cached) = self.cached() {
            return cached;
        }

        if !self.link_up.load(Ordering::Relaxed) {
            return self.store(false);
        }

        let online = match self
            .client
            .head(&self.endpoint)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Connectivity probe failed: {}", e);
                false
            }
        };
        self.store(online)
    }

    fn cached(&self) -> Option<bool> {
        let guard = match self.cache.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *guard {
            Some((at, online)) if at.elapsed() < self.cache_ttl => Some(online),
            _ => None,
        }
    }

    fn store(&self, online: bool) -> bool {
        let mut guard = match self.cache.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some((Instant::now(), online));
        online
    }

    /// Pre-seed the cached verdict so tests can dictate reachability.
    #[cfg(test)]
    pub(crate) fn seed_cached(&self, online: bool) {
        self.store(online);
    }
}

/// Classify an error as a connectivity failure rather than a real fault.
///
/// The coordinator uses this to land in the `offline` state (retry on the
/// next trigger) instead of `error`.
pub fn is_network_error(error: &anyhow::Error) -> bool {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                return true;
            }
        }
    }

    let message = format!("{:#}", error).to_lowercase();
    const PATTERNS: &[&str] = &[
        "network",
        "dns",
        "name not resolved",
        "no route to host",
        "connection refused",
        "connection reset",
        "connection closed",
        "broken pipe",
        "timed out",
        "timeout",
        "unreachable",
    ];
    PATTERNS.iter().any(|p| message.contains(p))
}
