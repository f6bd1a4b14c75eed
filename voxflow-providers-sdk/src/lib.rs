//! # Voxflow Providers SDK
//!
//! The provider framework behind the Voxflow batch speech-to-text pipeline:
//! a uniform capability contract over heterogeneous transcription backends,
//! plus the registry, factory, metrics store and fallback orchestrator that
//! route jobs across them.
//!
//! ## Overview
//!
//! - **Providers**: local binaries, remote HTTP APIs, self-hosted servers,
//!   SSH-tunneled remote binaries and generic HTTP endpoints behind one
//!   [`providers::Provider`] trait
//! - **Factory**: declarative `type` strings to constructors
//!   ([`providers::create_provider`])
//! - **Registry**: live name -> instance directory with default tracking
//!   and aggregate health checks ([`registry::ProviderRegistry`])
//! - **Metrics**: per-provider counters, EMA latency and health state
//!   ([`metrics::MetricsStore`])
//! - **Orchestrator**: routing rules, health-aware selection, retries and
//!   the fallback chain ([`orchestrator::Orchestrator`])
//! - **Configuration**: the `providers.yaml` document with `${ENV_VAR}`
//!   expansion ([`config`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voxflow_providers_sdk::config;
//! use voxflow_providers_sdk::metrics::MetricsStore;
//! use voxflow_providers_sdk::models::TranscriptionRequest;
//! use voxflow_providers_sdk::orchestrator::Orchestrator;
//! use voxflow_providers_sdk::providers::build_provider_from_config;
//! use voxflow_providers_sdk::registry::ProviderRegistry;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let configuration = config::load_config()?;
//!
//! let registry = Arc::new(ProviderRegistry::new());
//! for (name, provider_config) in configuration.enabled_providers() {
//!     let provider = build_provider_from_config(name, provider_config)?;
//!     registry.register(name, provider)?;
//! }
//!
//! let orchestrator = Orchestrator::new(
//!     registry,
//!     Arc::new(MetricsStore::new()),
//!     configuration.orchestrator.clone(),
//! );
//!
//! let response = orchestrator
//!     .transcribe(&TranscriptionRequest::new("/data/episode.mp3").with_language("en"))
//!     .await?;
//! println!("{}", response.text);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod common;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod subtitle;

pub use adapter::{OrchestratorTranscriber, Transcriber};
pub use config::{OrchestratorConfig, ProviderConfig, ProviderConfiguration};
pub use error::{ErrorCode, TranscriptionError};
pub use metrics::{MetricsStore, OverallMetrics, ProviderStats};
pub use models::{
    AudioFormat, ProviderInfo, ProviderType, ResponseFormat, Segment, TranscriptionRequest,
    TranscriptionResponse, Word,
};
pub use orchestrator::{Orchestrator, OrchestratorStats};
pub use providers::{build_provider_from_config, create_provider, Provider};
pub use registry::ProviderRegistry;

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, TranscriptionError>;
