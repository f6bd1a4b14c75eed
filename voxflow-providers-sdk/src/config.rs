//! # Configuration Module
//!
//! Declarative provider configuration: the `providers.yaml` document, its
//! schema types, environment-variable expansion, validation, and atomic
//! write-through.
//!
//! ## Document discovery
//!
//! `config_path()` prefers `./providers.yaml`, falling back to
//! `~/.voxflow/providers.yaml`. When neither exists, `load_config()`
//! materializes a default document (an enabled local binary provider, a
//! disabled remote API provider, and a prefer-local orchestrator with a
//! `local-whisper -> openai-api` fallback chain) and writes it to the
//! fallback path.
//!
//! ## Environment expansion
//!
//! `${VAR}` and `${VAR:-default}` references inside `auth.api_key`,
//! `auth.base_url`, header values and `global.temp_dir` are expanded at
//! load time. Missing variables resolve to the empty string; validation
//! may then reject the configuration if an essential field ends up blank.

use crate::common::duration_serde;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading/validation failures. These are fatal at
/// construction time and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Authentication settings for a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Performance knobs for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub timeout_sec: u64,
    pub max_concurrency: u32,
    /// Requests per minute; 0 disables the local rate gate
    pub rate_limit_rpm: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            timeout_sec: 300,
            max_concurrency: 2,
            rate_limit_rpm: 0,
        }
    }
}

/// Retry knobs for a provider's own transport retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 1000,
            exponential_backoff: true,
        }
    }
}

/// Declarative configuration for one provider instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Factory key, e.g. "local-whisper" or "openai-api"
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default)]
    pub enabled: bool,
    /// Provider-specific settings, schema declared in ProviderInfo
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub settings: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

impl ProviderConfig {
    pub fn new(provider_type: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Fetch a string setting, if present and a string.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    /// Fetch an integer setting.
    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.performance.timeout_sec)
    }
}

/// File-size buckets for the size routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeBucket {
    Small,
    Medium,
    Large,
}

impl SizeBucket {
    /// Deterministic size-only bucketing: small < 10 MB <= medium < 100 MB <= large.
    pub fn for_bytes(bytes: u64) -> Self {
        const MB: u64 = 1024 * 1024;
        if bytes < 10 * MB {
            Self::Small
        } else if bytes < 100 * MB {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

/// Duration buckets for the duration routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationBucket {
    Short,
    Medium,
    Long,
}

impl DurationBucket {
    /// short < 5 min <= medium < 30 min <= long.
    pub fn for_secs(secs: f64) -> Self {
        if secs < 300.0 {
            Self::Short
        } else if secs < 1800.0 {
            Self::Medium
        } else {
            Self::Long
        }
    }
}

/// Static routing rules consulted before health filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterRules {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_file_size: HashMap<SizeBucket, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_language: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_format: HashMap<crate::models::MediaClass, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_duration: HashMap<DurationBucket, String>,
}

/// Backoff shape used by the workflow layer's activity retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_serde")]
    pub initial_interval: Duration,
    #[serde(with = "duration_serde")]
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(100),
            multiplier: 2.0,
        }
    }
}

/// Candidate-ordering strategy applied when several providers tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastConnections,
    Weighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub weights: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, serde_json::Value>,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            weights: HashMap::new(),
            options: HashMap::new(),
        }
    }
}

/// Orchestrator behavior: fallback chain, routing rules, retries, health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub prefer_local: bool,
    #[serde(default)]
    pub router_rules: RouterRules,
    #[serde(with = "duration_serde")]
    pub health_check_interval: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fallback_chain: Vec::new(),
            prefer_local: true,
            router_rules: RouterRules::default(),
            health_check_interval: Duration::from_secs(60),
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            retry_policy: RetryPolicyConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
        }
    }
}

/// Metrics retention/export settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub retention_days: u32,
    pub export_format: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            export_format: "json".to_string(),
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub global_timeout_sec: u64,
    pub temp_dir: String,
    pub log_level: String,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            global_timeout_sec: 600,
            temp_dir: env::temp_dir().join("voxflow").to_string_lossy().into_owned(),
            log_level: "info".to_string(),
            metrics: MetricsSettings::default(),
        }
    }
}

/// The whole `providers.yaml` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfiguration {
    #[serde(default)]
    pub default_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub global: GlobalConfig,
}

impl ProviderConfiguration {
    /// The default document written on first run.
    pub fn default_document() -> Self {
        let local = ProviderConfig::new("local-whisper")
            .with_setting(
                "binary_path",
                serde_json::json!("${WHISPER_BINARY_PATH:-whisper-cli}"),
            )
            .with_setting(
                "model_path",
                serde_json::json!("${WHISPER_MODEL_PATH:-models/ggml-base.en.bin}"),
            );

        let mut remote = ProviderConfig::new("openai-api");
        remote.enabled = false;
        remote.auth.api_key = Some("${OPENAI_API_KEY}".to_string());

        let mut providers = HashMap::new();
        providers.insert("local-whisper".to_string(), local);
        providers.insert("openai-api".to_string(), remote);

        Self {
            default_provider: "local-whisper".to_string(),
            providers,
            orchestrator: OrchestratorConfig {
                fallback_chain: vec!["local-whisper".to_string(), "openai-api".to_string()],
                prefer_local: true,
                ..Default::default()
            },
            global: GlobalConfig::default(),
        }
    }

    /// Expand `${VAR}` / `${VAR:-default}` references in the fields that
    /// conventionally carry them.
    pub fn expand_env(&mut self) {
        for provider in self.providers.values_mut() {
            if let Some(key) = provider.auth.api_key.take() {
                provider.auth.api_key = Some(expand_env_str(&key));
            }
            if let Some(url) = provider.auth.base_url.take() {
                provider.auth.base_url = Some(expand_env_str(&url));
            }
            for value in provider.auth.headers.values_mut() {
                *value = expand_env_str(value);
            }
            for value in provider.settings.values_mut() {
                if let serde_json::Value::String(s) = value {
                    *value = serde_json::Value::String(expand_env_str(s));
                }
            }
        }
        self.global.temp_dir = expand_env_str(&self.global.temp_dir);
    }

    /// Structural validation. Runs after expansion.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.default_provider.is_empty() {
            match self.providers.get(&self.default_provider) {
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "default_provider '{}' is not configured",
                        self.default_provider
                    )))
                }
                Some(p) if !p.enabled => {
                    return Err(ConfigError::Invalid(format!(
                        "default_provider '{}' is disabled",
                        self.default_provider
                    )))
                }
                Some(_) => {}
            }
        }

        for (name, provider) in &self.providers {
            if name.is_empty() {
                return Err(ConfigError::Invalid("provider name cannot be empty".into()));
            }
            if provider.provider_type.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider '{name}' has an empty type"
                )));
            }
        }

        for name in &self.orchestrator.fallback_chain {
            if !self.providers.contains_key(name) {
                return Err(ConfigError::Invalid(format!(
                    "fallback_chain references unknown provider '{name}'"
                )));
            }
        }

        Ok(())
    }

    /// Names of the enabled providers, sorted for deterministic iteration.
    pub fn enabled_providers(&self) -> Vec<(&String, &ProviderConfig)> {
        let mut enabled: Vec<_> = self.providers.iter().filter(|(_, p)| p.enabled).collect();
        enabled.sort_by(|a, b| a.0.cmp(b.0));
        enabled
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global.global_timeout_sec)
    }
}

/// Expand every `${VAR}` / `${VAR:-default}` reference in `input`. Missing
/// variables without a default resolve to the empty string.
pub fn expand_env_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let reference = &rest[start + 2..start + 2 + end];
                let (var, default) = match reference.split_once(":-") {
                    Some((var, default)) => (var, Some(default)),
                    None => (reference, None),
                };
                match env::var(var) {
                    Ok(value) if !value.is_empty() => out.push_str(&value),
                    _ => out.push_str(default.unwrap_or("")),
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference: keep the literal text
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Preferred config file location: a local `providers.yaml` if present,
/// otherwise `~/.voxflow/providers.yaml`.
pub fn config_path() -> PathBuf {
    let local = PathBuf::from("providers.yaml");
    if local.exists() {
        return local;
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxflow")
        .join("providers.yaml")
}

/// Load the configuration from `path`, creating the default document when
/// the file does not exist. Environment references are expanded and the
/// result validated.
pub fn load_config_from(path: &Path) -> Result<ProviderConfiguration, ConfigError> {
    if !path.exists() {
        let default = ProviderConfiguration::default_document();
        save_config_to(path, &default)?;
        tracing::info!(path = %path.display(), "created default provider configuration");
        let mut expanded = default;
        expanded.expand_env();
        expanded.validate()?;
        return Ok(expanded);
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: ProviderConfiguration =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.expand_env();
    config.validate()?;
    Ok(config)
}

/// Load from the conventional location (see [`config_path`]).
pub fn load_config() -> Result<ProviderConfiguration, ConfigError> {
    load_config_from(&config_path())
}

/// Serialize and atomically replace the file: parent directories are
/// created, content lands in a sibling temp file first, then renames over
/// the target.
pub fn save_config_to(path: &Path, config: &ProviderConfiguration) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    let rendered = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, rendered).map_err(|source| ConfigError::Write {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_config(config: &ProviderConfiguration) -> Result<(), ConfigError> {
    save_config_to(&config_path(), config)
}
