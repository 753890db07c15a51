//! Request metrics owned by a proxy instance

use chrono::Utc;
use parking_lot::Mutex;
use url::Url;

use crate::models::{ProxyMetrics, UpstreamDecision};

/// Metrics key used for direct connections and undecided requests
pub const DIRECT_KEY: &str = "direct";

/// Live counters, updated from concurrent request callbacks
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<ProxyMetrics>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all counters with a fresh set stamped with the current time
    pub fn restart(&self) {
        *self.inner.lock() = ProxyMetrics {
            started_at: Some(Utc::now()),
            ..ProxyMetrics::default()
        };
    }

    /// Clear the start timestamp; counters are kept
    pub fn mark_stopped(&self) {
        self.inner.lock().started_at = None;
    }

    pub fn record_request(&self) {
        self.inner.lock().total_requests += 1;
    }

    pub fn record_decision(&self, decision: &UpstreamDecision) {
        let key = metrics_key(decision);
        *self.inner.lock().upstream_requests.entry(key).or_insert(0) += 1;
    }

    pub fn record_error(&self, message: &str) {
        let mut inner = self.inner.lock();
        inner.total_errors += 1;
        inner.last_error = Some(message.to_string());
        inner.last_error_at = Some(Utc::now());
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> ProxyMetrics {
        self.inner.lock().clone()
    }
}

/// Metrics key for a decision: the redacted upstream, or [`DIRECT_KEY`]
pub fn metrics_key(decision: &UpstreamDecision) -> String {
    match decision {
        UpstreamDecision::Upstream(url) => redact_upstream(url),
        UpstreamDecision::Direct | UpstreamDecision::NoDecision => DIRECT_KEY.to_string(),
    }
}

/// Strip credentials from an upstream URL. Unparseable input is returned as is.
pub fn redact_upstream(upstream: &str) -> String {
    let Ok(mut url) = Url::parse(upstream) else {
        return upstream.to_string();
    };

    if url.username().is_empty() && url.password().is_none() {
        return upstream.to_string();
    }

    // Both setters only fail for URLs that cannot carry credentials at all.
    let _ = url.set_username("");
    let _ = url.set_password(None);

    let mut redacted = url.to_string();
    if url.path() == "/" && !upstream.ends_with('/') {
        redacted.pop();
    }
    redacted
}
