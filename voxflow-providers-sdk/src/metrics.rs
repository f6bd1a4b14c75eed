//! # Metrics Store Module
//!
//! Thread-safe per-provider counters feeding health state and selection
//! hints. Every record keeps `success_rate = successful / total` exact, and
//! the health flag follows one rule: a provider goes unhealthy once it has
//! at least ten requests with a success rate under 50%, and only a
//! subsequent success restores it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ErrorCode;

/// EMA weight applied to each new latency sample after the first.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Mutable per-provider statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    /// Total seconds of audio successfully processed
    pub total_audio_secs: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub healthy: bool,
    /// error code string -> occurrence count
    pub error_counts: HashMap<String, u64>,
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            success_rate: 0.0,
            average_latency_ms: 0.0,
            total_audio_secs: 0.0,
            last_used: None,
            healthy: true,
            error_counts: HashMap::new(),
        }
    }
}

impl ProviderStats {
    fn record_success(&mut self, latency_ms: u64, audio_secs: f64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_audio_secs += audio_secs;
        self.last_used = Some(Utc::now());
        self.healthy = true;

        if self.average_latency_ms == 0.0 {
            self.average_latency_ms = latency_ms as f64;
        } else {
            self.average_latency_ms = LATENCY_EMA_ALPHA * latency_ms as f64
                + (1.0 - LATENCY_EMA_ALPHA) * self.average_latency_ms;
        }

        self.recompute_rate();
    }

    fn record_failure(&mut self, code: ErrorCode) {
        self.total_requests += 1;
        self.failed_requests += 1;
        *self
            .error_counts
            .entry(code.as_str().to_string())
            .or_insert(0) += 1;
        self.recompute_rate();

        if self.total_requests >= 10 && self.success_rate < 0.5 {
            self.healthy = false;
        }
    }

    fn recompute_rate(&mut self) {
        self.success_rate = self.successful_requests as f64 / self.total_requests as f64;
    }
}

/// Aggregate view across every tracked provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallMetrics {
    pub total_providers: usize,
    /// Providers used within the last hour
    pub active_providers: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub overall_success_rate: f64,
    /// Lowest non-zero average latency
    pub fastest_provider: Option<String>,
    /// Highest success rate among providers with >= 5 requests
    pub most_reliable_provider: Option<String>,
    pub providers: HashMap<String, ProviderStats>,
}

/// Thread-safe store of per-provider statistics.
///
/// Stats are created lazily on first record and live for the worker
/// process lifetime; snapshots returned to callers are deep copies.
#[derive(Debug, Default)]
pub struct MetricsStore {
    stats: DashMap<String, ProviderStats>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, provider: &str, latency_ms: u64, audio_secs: f64) {
        self.stats
            .entry(provider.to_string())
            .or_default()
            .record_success(latency_ms, audio_secs);
    }

    pub fn record_failure(&self, provider: &str, code: ErrorCode) {
        self.stats
            .entry(provider.to_string())
            .or_default()
            .record_failure(code);
    }

    /// Deep-copied snapshot for one provider.
    pub fn provider_stats(&self, provider: &str) -> Option<ProviderStats> {
        self.stats.get(provider).map(|s| s.clone())
    }

    /// Cached health verdict; providers without stats count as healthy.
    pub fn is_healthy(&self, provider: &str) -> bool {
        self.stats.get(provider).map(|s| s.healthy).unwrap_or(true)
    }

    pub fn reset(&self, provider: &str) {
        self.stats.remove(provider);
    }

    pub fn reset_all(&self) {
        self.stats.clear();
    }

    /// Deep-copied snapshot of every provider's stats.
    pub fn all_stats(&self) -> HashMap<String, ProviderStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn overall(&self) -> OverallMetrics {
        let providers = self.all_stats();
        let hour_ago = Utc::now() - chrono::Duration::hours(1);

        let mut total = 0u64;
        let mut successful = 0u64;
        let mut failed = 0u64;
        let mut active = 0usize;
        let mut fastest: Option<(String, f64)> = None;
        let mut most_reliable: Option<(String, f64)> = None;

        for (name, stats) in &providers {
            total += stats.total_requests;
            successful += stats.successful_requests;
            failed += stats.failed_requests;

            if stats.last_used.is_some_and(|t| t > hour_ago) {
                active += 1;
            }
            if stats.average_latency_ms > 0.0
                && fastest
                    .as_ref()
                    .is_none_or(|(_, best)| stats.average_latency_ms < *best)
            {
                fastest = Some((name.clone(), stats.average_latency_ms));
            }
            if stats.total_requests >= 5
                && most_reliable
                    .as_ref()
                    .is_none_or(|(_, best)| stats.success_rate > *best)
            {
                most_reliable = Some((name.clone(), stats.success_rate));
            }
        }

        OverallMetrics {
            total_providers: providers.len(),
            active_providers: active,
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            overall_success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            fastest_provider: fastest.map(|(name, _)| name),
            most_reliable_provider: most_reliable.map(|(name, _)| name),
            providers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_stay_consistent() {
        let store = MetricsStore::new();
        store.record_success("p", 100, 30.0);
        store.record_failure("p", ErrorCode::NetworkError);
        store.record_success("p", 200, 10.0);

        let stats = store.provider_stats("p").unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(
            stats.total_requests,
            stats.successful_requests + stats.failed_requests
        );
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.total_audio_secs, 40.0);
        assert_eq!(stats.error_counts["network_error"], 1);
    }

    #[test]
    fn test_latency_ema() {
        let store = MetricsStore::new();
        store.record_success("p", 100, 0.0);
        assert_eq!(store.provider_stats("p").unwrap().average_latency_ms, 100.0);

        store.record_success("p", 200, 0.0);
        // 0.2 * 200 + 0.8 * 100
        assert!((store.provider_stats("p").unwrap().average_latency_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_flips_after_ten_bad_requests() {
        let store = MetricsStore::new();
        for _ in 0..4 {
            store.record_success("p", 10, 0.0);
        }
        for _ in 0..5 {
            store.record_failure("p", ErrorCode::ServerError);
        }
        // 9 requests: rule not armed yet
        assert!(store.is_healthy("p"));

        store.record_failure("p", ErrorCode::ServerError);
        // 10 requests, 40% success
        assert!(!store.is_healthy("p"));

        // Only a success restores health
        store.record_failure("p", ErrorCode::ServerError);
        assert!(!store.is_healthy("p"));
        store.record_success("p", 10, 0.0);
        assert!(store.is_healthy("p"));
    }

    #[test]
    fn test_unknown_provider_is_healthy() {
        let store = MetricsStore::new();
        assert!(store.is_healthy("never-seen"));
        assert!(store.provider_stats("never-seen").is_none());
    }

    #[test]
    fn test_overall_picks_fastest_and_most_reliable() {
        let store = MetricsStore::new();
        for _ in 0..5 {
            store.record_success("fast-flaky", 50, 1.0);
        }
        for _ in 0..5 {
            store.record_failure("fast-flaky", ErrorCode::NetworkError);
        }
        for _ in 0..5 {
            store.record_success("slow-steady", 500, 1.0);
        }
        // Too few requests to qualify as most reliable
        store.record_success("new", 10, 1.0);

        let overall = store.overall();
        assert_eq!(overall.total_providers, 3);
        assert_eq!(overall.total_requests, 16);
        assert_eq!(overall.fastest_provider.as_deref(), Some("new"));
        assert_eq!(overall.most_reliable_provider.as_deref(), Some("slow-steady"));
        assert_eq!(overall.active_providers, 3);
    }

    #[test]
    fn test_snapshot_is_deep_copy() {
        let store = MetricsStore::new();
        store.record_success("p", 100, 1.0);
        let mut snapshot = store.provider_stats("p").unwrap();
        snapshot.total_requests = 999;
        assert_eq!(store.provider_stats("p").unwrap().total_requests, 1);
    }
}
