//! # Provider System Module
//!
//! The capability contract every transcription backend implements, plus the
//! construction table that maps declarative `type` strings to constructors.
//!
//! ## Overview
//!
//! - **Provider trait**: transcription, legacy text surface, capability
//!   sheet, configuration validation, health check
//! - **Configurable**: optional runtime reconfiguration capability
//! - **Factory**: `type -> constructor` lookup used by hosts to build
//!   providers from `providers.yaml` entries
//!
//! ## Built-in provider types
//!
//! | type | backend |
//! |------|---------|
//! | `local-whisper`  | local whisper.cpp-style binary |
//! | `openai-api`     | OpenAI-compatible `/audio/transcriptions` API |
//! | `whisper-server` | self-hosted whisper.cpp server (`/inference`) |
//! | `ssh-whisper`    | remote binary executed over SSH |
//! | `http-generic`   | arbitrary HTTP endpoint with configurable fields |
//!
//! The table self-populates with the built-ins on first access (Rust has no
//! load-time init); hosts can add their own types with
//! [`register_provider_type`].

use crate::config::ProviderConfig;
use crate::error::{ErrorCode, TranscriptionError};
use crate::models::{ProviderInfo, TranscriptionRequest, TranscriptionResponse};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

pub mod http_client;
pub mod http_generic;
pub mod local_whisper;
pub mod openai_api;
pub mod ssh_whisper;
pub mod whisper_server;

/// The capability contract for one transcription backend.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// The immutable capability sheet for this instance.
    fn info(&self) -> ProviderInfo;

    /// Pure check of the held configuration; no I/O. The registry rejects
    /// providers whose configuration does not validate.
    fn validate_configuration(&self) -> Result<(), TranscriptionError>;

    /// Transcribe one file with the full option set.
    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError>;

    /// Legacy single-method surface: path in, text out.
    async fn transcript(&self, path: &Path) -> Result<String, TranscriptionError> {
        let request = TranscriptionRequest::new(path);
        Ok(self.transcribe(&request).await?.text)
    }

    /// Probe whether the backend can currently serve requests.
    async fn health_check(&self) -> Result<(), TranscriptionError>;

    /// Optional runtime-reconfiguration capability.
    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("info", &self.info()).finish()
    }
}

/// Optional capability: providers that accept settings updates at runtime.
pub trait Configurable: Send + Sync {
    fn update_configuration(
        &self,
        settings: HashMap<String, serde_json::Value>,
    ) -> Result<(), TranscriptionError>;

    fn get_configuration(&self) -> HashMap<String, serde_json::Value>;
}

/// One entry of the construction table.
#[derive(Clone)]
pub struct ProviderTypeEntry {
    /// Build an instance named `name` from a declarative config.
    pub constructor: fn(&str, &ProviderConfig) -> Result<Arc<dyn Provider>, TranscriptionError>,
    /// Descriptive metadata without constructing an instance.
    pub describe: fn() -> ProviderInfo,
}

static PROVIDER_TYPES: OnceLock<RwLock<HashMap<String, ProviderTypeEntry>>> = OnceLock::new();

fn provider_types() -> &'static RwLock<HashMap<String, ProviderTypeEntry>> {
    PROVIDER_TYPES.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(
            local_whisper::PROVIDER_TYPE.to_string(),
            ProviderTypeEntry {
                constructor: local_whisper::from_config,
                describe: local_whisper::type_info,
            },
        );
        table.insert(
            openai_api::PROVIDER_TYPE.to_string(),
            ProviderTypeEntry {
                constructor: openai_api::from_config,
                describe: openai_api::type_info,
            },
        );
        table.insert(
            whisper_server::PROVIDER_TYPE.to_string(),
            ProviderTypeEntry {
                constructor: whisper_server::from_config,
                describe: whisper_server::type_info,
            },
        );
        table.insert(
            ssh_whisper::PROVIDER_TYPE.to_string(),
            ProviderTypeEntry {
                constructor: ssh_whisper::from_config,
                describe: ssh_whisper::type_info,
            },
        );
        table.insert(
            http_generic::PROVIDER_TYPE.to_string(),
            ProviderTypeEntry {
                constructor: http_generic::from_config,
                describe: http_generic::type_info,
            },
        );
        RwLock::new(table)
    })
}

/// Register an additional provider type. Key collisions are rejected.
pub fn register_provider_type(
    type_key: &str,
    entry: ProviderTypeEntry,
) -> Result<(), TranscriptionError> {
    let mut table = provider_types().write().expect("provider type table poisoned");
    if table.contains_key(type_key) {
        return Err(TranscriptionError::invalid_input(
            "factory",
            format!("provider type already registered: {type_key}"),
        ));
    }
    table.insert(type_key.to_string(), entry);
    Ok(())
}

/// Construct a provider of `type_key` named `name` from `config`.
pub fn create_provider(
    type_key: &str,
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn Provider>, TranscriptionError> {
    let constructor = {
        let table = provider_types().read().expect("provider type table poisoned");
        table.get(type_key).map(|entry| entry.constructor)
    };
    match constructor {
        Some(constructor) => constructor(name, config),
        None => Err(TranscriptionError::invalid_input(
            "factory",
            format!(
                "unknown provider type '{type_key}' (available: {})",
                available_provider_types().join(", ")
            ),
        )),
    }
}

/// Construct a provider from a `providers.yaml` entry, using its declared
/// type.
pub fn build_provider_from_config(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn Provider>, TranscriptionError> {
    create_provider(&config.provider_type, name, config)
}

/// The registered type strings, sorted.
pub fn available_provider_types() -> Vec<String> {
    let table = provider_types().read().expect("provider type table poisoned");
    let mut types: Vec<String> = table.keys().cloned().collect();
    types.sort();
    types
}

/// Descriptive metadata for a type without constructing an instance; used
/// by listings and health dashboards.
pub fn provider_type_info(type_key: &str) -> Option<ProviderInfo> {
    let table = provider_types().read().expect("provider type table poisoned");
    table.get(type_key).map(|entry| (entry.describe)())
}

/// Stat the input and enforce existence plus the declared size limit
/// before any upload or subprocess starts. Returns the file size.
pub(crate) fn check_input_file(
    provider: &str,
    path: &Path,
    info: &ProviderInfo,
) -> Result<u64, TranscriptionError> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| TranscriptionError::file_not_found(provider, path))?;
    if !metadata.is_file() {
        return Err(TranscriptionError::invalid_input(
            provider,
            format!("not a regular file: {}", path.display()),
        ));
    }
    let size = metadata.len();
    if !info.accepts_file_size(size) {
        return Err(TranscriptionError::file_too_large(
            provider,
            size,
            info.max_file_size_mb,
        ));
    }
    Ok(size)
}

/// Provider-local requests-per-minute gate. The orchestrator never
/// serializes across providers; each instance spaces its own calls.
#[derive(Debug)]
pub(crate) struct RateGate {
    min_interval: Option<Duration>,
    last: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl RateGate {
    pub fn new(rate_limit_rpm: u32) -> Self {
        let min_interval = if rate_limit_rpm == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(60.0 / rate_limit_rpm as f64))
        };
        Self {
            min_interval,
            last: tokio::sync::Mutex::new(None),
        }
    }

    /// Wait until the next request slot is open.
    pub async fn acquire(&self) {
        let Some(min_interval) = self.min_interval else {
            return;
        };
        let mut last = self.last.lock().await;
        let now = tokio::time::Instant::now();
        if let Some(previous) = *last {
            let next_slot = previous + min_interval;
            if next_slot > now {
                tokio::time::sleep(next_slot - now).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }
}

/// Reject formats a provider cannot produce.
pub(crate) fn check_response_format(
    provider: &str,
    request: &TranscriptionRequest,
    supported: &[crate::models::ResponseFormat],
) -> Result<crate::models::ResponseFormat, TranscriptionError> {
    let format = request.format();
    if supported.contains(&format) {
        Ok(format)
    } else {
        Err(TranscriptionError::invalid_input(
            provider,
            format!("unsupported response format: {}", format.as_str()),
        ))
    }
}

/// Non-empty text or an `empty_transcription` error.
pub(crate) fn require_text(provider: &str, text: String) -> Result<String, TranscriptionError> {
    if text.trim().is_empty() {
        Err(TranscriptionError::empty_transcription(provider))
    } else {
        Ok(text)
    }
}

/// Classify an exit of a spawned transcription process.
pub(crate) fn subprocess_failure(
    provider: &str,
    status: std::process::ExitStatus,
    stderr: &str,
) -> TranscriptionError {
    TranscriptionError::new(
        ErrorCode::TranscriptionFailed,
        provider,
        format!(
            "process exited with {status}: {}",
            stderr.trim().lines().last().unwrap_or("no stderr output")
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types_are_registered() {
        let types = available_provider_types();
        for expected in [
            "http-generic",
            "local-whisper",
            "openai-api",
            "ssh-whisper",
            "whisper-server",
        ] {
            assert!(types.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_unknown_type_fails_with_listing() {
        let config = ProviderConfig::new("no-such-type");
        let err = create_provider("no-such-type", "x", &config).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.contains("local-whisper"));
    }

    #[test]
    fn test_type_info_without_construction() {
        let info = provider_type_info("local-whisper").unwrap();
        assert_eq!(info.provider_type, crate::models::ProviderType::Local);
        assert!(info.requirements.binary);
        assert!(provider_type_info("nope").is_none());
    }

    #[test]
    fn test_duplicate_type_registration_rejected() {
        let entry = ProviderTypeEntry {
            constructor: local_whisper::from_config,
            describe: local_whisper::type_info,
        };
        assert!(register_provider_type("local-whisper", entry).is_err());
    }

    #[tokio::test]
    async fn test_rate_gate_spaces_requests() {
        tokio::time::pause();
        let gate = RateGate::new(60); // one per second
        let start = tokio::time::Instant::now();
        gate.acquire().await;
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_rate_gate_disabled_at_zero() {
        let gate = RateGate::new(0);
        let start = std::time::Instant::now();
        gate.acquire().await;
        gate.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
