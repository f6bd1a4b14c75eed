//! # Orchestrator Module
//!
//! Provider selection and fallback execution. Selection builds an ordered
//! candidate list from the configured fallback chain, the load-balancing
//! strategy, the static routing rules and the prefer-local flag, then
//! filters it through cached health. Execution walks the candidates in
//! order, retrying each retryable failure up to `max_retries` times before
//! moving on, and records every attempt in the metrics store.
//!
//! ## Selection pipeline
//!
//! 1. Base list: configured `fallback_chain`, else all registered providers
//! 2. Load-balancing order (round-robin rotation, least-connections or
//!    weighted sort)
//! 3. Routing rules move their match to the front (size, then format, then
//!    language, so language has the highest priority)
//! 4. `prefer_local` stable-partitions local providers ahead of the rest
//! 5. Unhealthy candidates are dropped unless none would remain
//!
//! Health verdicts are cached per provider with a TTL of
//! `health_check_interval`; `update_provider_health` lets the executor
//! demote a provider immediately when it observes a transport failure.

use crate::config::{
    DurationBucket, LoadBalancingStrategy, OrchestratorConfig, SizeBucket,
};
use crate::error::{ErrorCode, TranscriptionError};
use crate::metrics::MetricsStore;
use crate::models::{MediaClass, ProviderType, TranscriptionRequest, TranscriptionResponse};
use crate::providers::Provider;
use crate::registry::ProviderRegistry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Per-check bound for lazily refreshed health probes.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy)]
struct HealthEntry {
    healthy: bool,
    checked_at: Instant,
}

#[derive(Default, Clone)]
struct UsageStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    provider_usage: HashMap<String, u64>,
    provider_errors: HashMap<String, HashMap<String, u64>>,
}

/// Deep-copied orchestrator statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Wins per provider
    pub provider_usage: HashMap<String, u64>,
    /// provider -> error code -> count of exhausted traversals
    pub provider_errors: HashMap<String, HashMap<String, u64>>,
    /// Last cached health verdict per provider
    pub last_health_check: HashMap<String, bool>,
    pub fastest_provider: Option<String>,
    pub most_reliable_provider: Option<String>,
}

pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<MetricsStore>,
    config: OrchestratorConfig,
    health_cache: RwLock<HashMap<String, HealthEntry>>,
    usage: Mutex<UsageStats>,
    in_flight: DashMap<String, u64>,
    rr_cursor: AtomicUsize,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        metrics: Arc<MetricsStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            config,
            health_cache: RwLock::new(HashMap::new()),
            usage: Mutex::new(UsageStats::default()),
            in_flight: DashMap::new(),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Ordered candidate list for `request`. Never empty while at least one
    /// provider is registered.
    pub async fn recommend_providers(&self, request: &TranscriptionRequest) -> Vec<String> {
        let registered = self.registry.list();
        if registered.is_empty() {
            return Vec::new();
        }

        let mut candidates: Vec<String> = if self.config.fallback_chain.is_empty() {
            registered.clone()
        } else {
            self.config
                .fallback_chain
                .iter()
                .filter(|name| registered.contains(name))
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            candidates = registered.clone();
        }

        self.apply_load_balancing(&mut candidates);
        self.apply_router_rules(&mut candidates, request);
        if self.config.prefer_local {
            self.partition_local_first(&mut candidates);
        }
        dedup_preserving_order(&mut candidates);

        // Health gate: drop unhealthy candidates unless that would leave
        // nothing to try.
        let mut healthy = Vec::with_capacity(candidates.len());
        for name in &candidates {
            if self.cached_health(name).await {
                healthy.push(name.clone());
            }
        }
        if healthy.is_empty() {
            candidates
        } else {
            healthy
        }
    }

    fn apply_load_balancing(&self, candidates: &mut Vec<String>) {
        match self.config.load_balancing.strategy {
            LoadBalancingStrategy::RoundRobin => {
                if candidates.len() > 1 {
                    let offset = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                    candidates.rotate_left(offset);
                }
            }
            LoadBalancingStrategy::LeastConnections => {
                candidates.sort_by_key(|name| {
                    self.in_flight.get(name).map(|count| *count).unwrap_or(0)
                });
            }
            LoadBalancingStrategy::Weighted => {
                let weights = &self.config.load_balancing.weights;
                candidates.sort_by(|a, b| {
                    let wa = weights.get(a).copied().unwrap_or(0.0);
                    let wb = weights.get(b).copied().unwrap_or(0.0);
                    wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }
    }

    /// Apply routing rules lowest-priority first so the highest-priority
    /// match ends up at the front: duration, size, format, language.
    fn apply_router_rules(&self, candidates: &mut Vec<String>, request: &TranscriptionRequest) {
        let rules = &self.config.router_rules;

        // Duration rules only apply when the caller supplied a hint; no
        // probe is attempted.
        if let Some(hint) = request
            .options
            .get("duration_hint_secs")
            .and_then(|v| v.as_f64())
        {
            if let Some(name) = rules.by_duration.get(&DurationBucket::for_secs(hint)) {
                move_to_front(candidates, name);
            }
        }

        // Size rules use a cheap stat; unreadable files skip the rule.
        if !rules.by_file_size.is_empty() {
            if let Ok(metadata) = std::fs::metadata(&request.file_path) {
                if let Some(name) = rules.by_file_size.get(&SizeBucket::for_bytes(metadata.len())) {
                    move_to_front(candidates, name);
                }
            }
        }

        if let Some(name) = rules.by_format.get(&MediaClass::from_path(&request.file_path)) {
            move_to_front(candidates, name);
        }

        if let Some(language) = &request.language {
            if let Some(name) = rules.by_language.get(language) {
                move_to_front(candidates, name);
            }
        }
    }

    fn partition_local_first(&self, candidates: &mut Vec<String>) {
        let mut local = Vec::new();
        let mut other = Vec::new();
        for name in candidates.drain(..) {
            match self.registry.get(&name) {
                Ok(provider) if provider.info().provider_type == ProviderType::Local => {
                    local.push(name)
                }
                _ => other.push(name),
            }
        }
        local.extend(other);
        *candidates = local;
    }

    /// Cached health verdict, refreshed with a bounded probe once the TTL
    /// lapses. Metrics-derived health (success-rate rule) is consulted
    /// first; a provider the metrics store has demoted stays demoted until
    /// a success restores it.
    async fn cached_health(&self, name: &str) -> bool {
        if !self.metrics.is_healthy(name) {
            return false;
        }

        let fresh = {
            let cache = self.health_cache.read().expect("health cache poisoned");
            cache.get(name).and_then(|entry| {
                (entry.checked_at.elapsed() < self.config.health_check_interval)
                    .then_some(entry.healthy)
            })
        };
        if let Some(healthy) = fresh {
            return healthy;
        }

        let healthy = match self.registry.get(name) {
            Ok(provider) => {
                match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, provider.health_check()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        tracing::debug!(provider = name, error = %err, "health check failed");
                        false
                    }
                    Err(_) => {
                        tracing::debug!(provider = name, "health check timed out");
                        false
                    }
                }
            }
            Err(_) => false,
        };
        self.update_provider_health(name, healthy);
        healthy
    }

    /// Bypass the cache and pin a health verdict, stamped now.
    pub fn update_provider_health(&self, name: &str, healthy: bool) {
        self.health_cache
            .write()
            .expect("health cache poisoned")
            .insert(
                name.to_string(),
                HealthEntry {
                    healthy,
                    checked_at: Instant::now(),
                },
            );
    }

    /// Transcribe with full selection and fallback.
    pub async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let candidates = self.recommend_providers(request).await;
        self.execute_chain(&candidates, request).await
    }

    /// Force `name` as the primary, then walk the usual chain minus the
    /// already-tried provider.
    pub async fn transcribe_with_provider(
        &self,
        name: &str,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        self.registry.get(name)?;
        let mut candidates = vec![name.to_string()];
        for candidate in self.recommend_providers(request).await {
            if candidate != name {
                candidates.push(candidate);
            }
        }
        self.execute_chain(&candidates, request).await
    }

    async fn execute_chain(
        &self,
        candidates: &[String],
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        if candidates.is_empty() {
            return Err(TranscriptionError::new(
                ErrorCode::ProviderNotFound,
                "orchestrator",
                "no providers available",
            ));
        }

        let mut attempted: Vec<String> = Vec::new();
        let mut failures: Vec<(String, TranscriptionError)> = Vec::new();

        for name in candidates {
            let provider = match self.registry.get(name) {
                Ok(provider) => provider,
                Err(_) => continue,
            };
            attempted.push(name.clone());

            *self.in_flight.entry(name.clone()).or_insert(0) += 1;
            let result = self.try_provider(provider.as_ref(), name, request).await;
            if let Some(mut count) = self.in_flight.get_mut(name) {
                *count = count.saturating_sub(1);
            }

            match result {
                Ok(response) => {
                    self.update_provider_health(name, true);
                    {
                        let mut usage = self.usage.lock().expect("usage lock poisoned");
                        usage.total_requests += 1;
                        usage.successful_requests += 1;
                        *usage.provider_usage.entry(name.clone()).or_insert(0) += 1;
                    }
                    tracing::info!(
                        provider = %name,
                        attempted = ?attempted,
                        processing_ms = response.processing_time.as_millis() as u64,
                        "transcription succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    tracing::warn!(provider = %name, error = %err, "provider failed, walking fallback chain");
                    if err.code == ErrorCode::NetworkError {
                        // Observed transport failure: demote immediately
                        self.update_provider_health(name, false);
                    }
                    failures.push((name.clone(), err));
                }
            }
        }

        {
            let mut usage = self.usage.lock().expect("usage lock poisoned");
            usage.total_requests += 1;
            usage.failed_requests += 1;
            for (name, err) in &failures {
                *usage
                    .provider_errors
                    .entry(name.clone())
                    .or_default()
                    .entry(err.code.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        let last = failures.pop();
        let (last_provider, last_err) = match last {
            Some((name, err)) => (name, err),
            None => (
                "orchestrator".to_string(),
                TranscriptionError::new(
                    ErrorCode::ProviderNotFound,
                    "orchestrator",
                    "no providers available",
                ),
            ),
        };

        Err(TranscriptionError {
            code: ErrorCode::AllProvidersFailed,
            message: format!(
                "all providers failed (attempted: {}); last error from {last_provider}: {}: {}",
                attempted.join(", "),
                last_err.code,
                last_err.message
            ),
            provider: "orchestrator".to_string(),
            retryable: last_err.retryable,
            suggestions: last_err.suggestions,
        })
    }

    /// Up to `max_retries + 1` attempts against one provider, sleeping
    /// `retry_delay` between attempts and stopping early on a
    /// non-retryable error. Every attempt lands in the metrics store.
    async fn try_provider(
        &self,
        provider: &dyn Provider,
        name: &str,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let max_attempts = self.config.max_retries + 1;
        let mut last_err: Option<TranscriptionError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let started = Instant::now();
            match provider.transcribe(request).await {
                Ok(response) => {
                    self.metrics.record_success(
                        name,
                        started.elapsed().as_millis() as u64,
                        response.duration_secs.unwrap_or(0.0),
                    );
                    return Ok(response);
                }
                Err(err) => {
                    self.metrics.record_failure(name, err.code);
                    tracing::debug!(
                        provider = name,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %err,
                        "attempt failed"
                    );
                    let retryable = err.retryable;
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_err.expect("at least one attempt was made"))
    }

    /// Current number of in-flight requests against `name`.
    pub fn in_flight(&self, name: &str) -> u64 {
        self.in_flight.get(name).map(|count| *count).unwrap_or(0)
    }

    /// Deep-copied statistics snapshot.
    pub fn stats(&self) -> OrchestratorStats {
        let usage = self.usage.lock().expect("usage lock poisoned").clone();
        let last_health_check = {
            let cache = self.health_cache.read().expect("health cache poisoned");
            cache
                .iter()
                .map(|(name, entry)| (name.clone(), entry.healthy))
                .collect()
        };
        let overall = self.metrics.overall();

        OrchestratorStats {
            total_requests: usage.total_requests,
            successful_requests: usage.successful_requests,
            failed_requests: usage.failed_requests,
            provider_usage: usage.provider_usage,
            provider_errors: usage.provider_errors,
            last_health_check,
            fastest_provider: overall.fastest_provider,
            most_reliable_provider: overall.most_reliable_provider,
        }
    }
}

fn dedup_preserving_order(candidates: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|name| seen.insert(name.clone()));
}

fn move_to_front(candidates: &mut Vec<String>, name: &str) {
    if let Some(position) = candidates.iter().position(|c| c == name) {
        let name = candidates.remove(position);
        candidates.insert(0, name);
    }
}
