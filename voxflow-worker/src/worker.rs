//! Worker host wiring: load the provider configuration, build and register
//! providers through the factory, stand up the orchestrator, object store,
//! activities and workflow runtime, and serve the health endpoint until
//! interrupted.

use crate::activities::Activities;
use crate::config::WorkerConfig;
use crate::engine::Runtime;
use crate::health::{router, HealthState};
use crate::storage::{ObjectStore, S3ObjectStore};
use crate::workflows::{self, names as workflow_names};
use anyhow::Context;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use voxflow_providers_sdk::config as provider_config;
use voxflow_providers_sdk::metrics::MetricsStore;
use voxflow_providers_sdk::orchestrator::Orchestrator;
use voxflow_providers_sdk::providers::build_provider_from_config;
use voxflow_providers_sdk::registry::ProviderRegistry;

pub struct WorkerHost {
    runtime: Arc<Runtime>,
    activities: Arc<Activities>,
    health_port: u16,
}

impl WorkerHost {
    /// Assemble the full worker from configuration. Construction failures
    /// of enabled providers are fatal; an unreachable object store is not
    /// (store-mode workflows will fail until it comes back).
    pub async fn build(config: WorkerConfig) -> anyhow::Result<Self> {
        let configuration = match &config.providers_config_path {
            Some(path) => provider_config::load_config_from(Path::new(path)),
            None => provider_config::load_config(),
        }
        .context("loading provider configuration")?;

        let registry = Arc::new(ProviderRegistry::new());
        for (name, provider_cfg) in configuration.enabled_providers() {
            let provider = build_provider_from_config(name, provider_cfg)
                .with_context(|| format!("constructing provider '{name}'"))?;
            registry
                .register(name, provider)
                .with_context(|| format!("registering provider '{name}'"))?;
            tracing::info!(provider = %name, provider_type = %provider_cfg.provider_type, "provider registered");
        }
        if !configuration.default_provider.is_empty() {
            registry
                .set_default(&configuration.default_provider)
                .context("setting default provider")?;
        }

        let metrics = Arc::new(MetricsStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            metrics,
            configuration.orchestrator.clone(),
        ));

        let store: Arc<dyn ObjectStore> = Arc::new(
            S3ObjectStore::connect(
                &config.store.endpoint,
                &config.store.access_key,
                &config.store.secret_key,
                &config.store.bucket,
                &config.store.region,
            )
            .await,
        );
        if let Err(err) = store.ensure_bucket().await {
            tracing::warn!(
                endpoint = %config.store.endpoint,
                error = %err,
                "object store unavailable at startup; store-mode workflows will fail until it recovers"
            );
        }

        let temp_dir = PathBuf::from(&configuration.global.temp_dir);
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("creating temp dir {}", temp_dir.display()))?;

        let activities = Arc::new(Activities::new(
            registry,
            orchestrator,
            store,
            temp_dir,
        ));

        let runtime = Arc::new(Runtime::new(&config.task_queue));
        register_workflows(&runtime, activities.clone());
        tracing::info!(
            worker_id = %runtime.worker_id(),
            task_queue = %runtime.task_queue(),
            workflows = ?runtime.registered_workflows(),
            providers = ?activities.registry().list(),
            "worker ready"
        );

        Ok(Self {
            runtime,
            activities,
            health_port: config.health_port,
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn activities(&self) -> &Arc<Activities> {
        &self.activities
    }

    /// Serve the health endpoint until ctrl-c, then cancel every in-flight
    /// workflow.
    pub async fn run(self) -> anyhow::Result<()> {
        let state = Arc::new(HealthState {
            runtime: self.runtime.clone(),
            activities: self.activities.clone(),
        });
        let app = router(state);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.health_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding health endpoint on {addr}"))?;
        tracing::info!(%addr, "health endpoint listening");

        let runtime = self.runtime.clone();
        let server = axum::serve(listener, app);
        tokio::select! {
            result = server => result.context("health endpoint failed")?,
            _ = tokio::signal::ctrl_c() => {
                runtime.shutdown();
            }
        }
        Ok(())
    }
}

/// Register the five workflow families under their fixed names.
fn register_workflows(runtime: &Arc<Runtime>, activities: Arc<Activities>) {
    let acts = activities.clone();
    runtime.register_workflow(workflow_names::SINGLE_FILE, move |ctx, request| {
        workflows::single_file::run(ctx, acts.clone(), request)
    });

    let acts = activities.clone();
    runtime.register_workflow(workflow_names::BATCH, move |ctx, request| {
        workflows::batch::run(ctx, acts.clone(), request)
    });

    let acts = activities.clone();
    runtime.register_workflow(workflow_names::BATCH_WITH_RETRY, move |ctx, request| {
        workflows::batch::run_with_retry(ctx, acts.clone(), request)
    });

    let acts = activities.clone();
    runtime.register_workflow(workflow_names::FALLBACK, move |ctx, request| {
        workflows::fallback::run(ctx, acts.clone(), request)
    });

    let acts = activities;
    runtime.register_workflow(workflow_names::SMART_FALLBACK, move |ctx, request| {
        workflows::fallback::run_smart(ctx, acts.clone(), request)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_env, MockBehavior};
    use crate::workflows::SingleFileRequest;

    #[tokio::test]
    async fn test_registered_workflow_names() {
        let env = test_env(vec![("mock", MockBehavior::succeed("hi"))]).await;
        let runtime = Arc::new(Runtime::new("test-queue"));
        register_workflows(&runtime, env.activities.clone());

        assert_eq!(
            runtime.registered_workflows(),
            vec![
                "BatchTranscription",
                "BatchWithRetry",
                "SingleFileTranscription",
                "SmartFallback",
                "TranscriptionWithFallback",
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_single_file_through_runtime() {
        let env = test_env(vec![("mock", MockBehavior::succeed("via runtime"))]).await;
        let runtime = Arc::new(Runtime::new("test-queue"));
        register_workflows(&runtime, env.activities.clone());

        let input = env.dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let request = SingleFileRequest {
            file_id: "f1".to_string(),
            file_path: input.to_string_lossy().into_owned(),
            provider: None,
            language: None,
            output_format: None,
            options: Default::default(),
            use_object_store: false,
        };

        let output = runtime
            .start_workflow(
                workflow_names::SINGLE_FILE,
                "wf-1",
                serde_json::to_value(&request).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(output["provider"], "mock");
        assert!(output["location"]
            .as_str()
            .unwrap()
            .ends_with("a_transcription.txt"));
    }
}
