use ns_protocol::MetricsResponse;

use crate::embedding::CacheOutcome;

/// Process-wide request counters. Only the dispatcher mutates them, and they
/// only ever grow.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: u64,
    requests_failed: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&mut self) {
        self.requests_total += 1;
    }

    pub(crate) fn record_failure(&mut self) {
        self.requests_failed += 1;
    }

    pub(crate) fn record_cache(&mut self, outcome: CacheOutcome) {
        match outcome {
            CacheOutcome::Hit => self.cache_hits += 1,
            CacheOutcome::Miss => self.cache_misses += 1,
        }
    }

    pub fn snapshot(&self) -> MetricsResponse {
        MetricsResponse {
            requests_total: self.requests_total,
            requests_failed: self.requests_failed,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
        }
    }
}

pub(crate) fn log_event(event: &str, cmd: &str, detail: &str) {
    tracing::debug!(event, cmd, detail, "command");
}
