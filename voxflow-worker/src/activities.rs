//! # Activities Module
//!
//! The only way workflows touch the outside world: thin wrappers around the
//! provider registry, the orchestrator and the object store. Long-running
//! work heartbeats every ten seconds while the real call proceeds on a
//! spawned task, and every activity observes cancellation.

use crate::engine::{ActivityContext, WorkflowError};
use crate::storage::{store_url, ObjectInfo, ObjectStore, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use voxflow_providers_sdk::models::TranscriptionRequest;
use voxflow_providers_sdk::orchestrator::Orchestrator;
use voxflow_providers_sdk::registry::ProviderRegistry;
use voxflow_providers_sdk::ProviderType;

/// Fixed activity names as registered with the runtime surface.
pub mod names {
    pub const TRANSCRIBE_FILE: &str = "TranscribeFile";
    pub const GET_PROVIDER_STATUS: &str = "GetProviderStatus";
    pub const LIST_AVAILABLE_PROVIDERS: &str = "ListAvailableProviders";
    pub const GET_RECOMMENDED_PROVIDER: &str = "GetRecommendedProvider";
    pub const UPLOAD_FILE: &str = "UploadFile";
    pub const DOWNLOAD_FILE: &str = "DownloadFile";
    pub const CLEANUP_TEMP_FILE: &str = "CleanupTempFile";
    pub const LIST_FILES: &str = "ListFiles";
    pub const ENSURE_BUCKET_EXISTS: &str = "EnsureBucketExists";
}

/// Heartbeat cadence for long-running activities.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeFileRequest {
    pub file_id: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub response_format: Option<voxflow_providers_sdk::ResponseFormat>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeFileResult {
    pub file_id: String,
    pub text: String,
    pub provider: String,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn storage_failure(activity: &str, err: StorageError) -> WorkflowError {
    let retryable = !matches!(err, StorageError::NotFound { .. });
    WorkflowError::ActivityFailed {
        activity: activity.to_string(),
        message: err.to_string(),
        retryable,
    }
}

fn io_failure(activity: &str, message: String) -> WorkflowError {
    WorkflowError::ActivityFailed {
        activity: activity.to_string(),
        message,
        retryable: true,
    }
}

/// Shared activity environment: registry + orchestrator + object store +
/// the sanctioned temp directory.
pub struct Activities {
    registry: Arc<ProviderRegistry>,
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ObjectStore>,
    temp_dir: PathBuf,
}

impl Activities {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn ObjectStore>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            store,
            temp_dir,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Transcribe one local file with the override provider, or the
    /// registry default when none is given. The provider call runs on its
    /// own task while this activity heartbeats every ten seconds.
    pub async fn transcribe_file(
        &self,
        actx: &ActivityContext,
        request: TranscribeFileRequest,
    ) -> Result<TranscribeFileResult, WorkflowError> {
        let provider_name = match &request.provider {
            Some(name) => name.clone(),
            None => self
                .registry
                .default_name()
                .ok_or_else(|| WorkflowError::ActivityFailed {
                    activity: names::TRANSCRIBE_FILE.to_string(),
                    message: "no provider override and no default provider".to_string(),
                    retryable: false,
                })?,
        };
        let provider = self
            .registry
            .get(&provider_name)
            .map_err(WorkflowError::Transcription)?;

        let mut provider_request = TranscriptionRequest::new(&request.file_path);
        provider_request.language = request.language.clone();
        provider_request.response_format = request.response_format;
        provider_request.options = request.options.clone();

        let metrics = self.orchestrator.metrics().clone();
        let call_provider = provider.clone();
        let call_name = provider_name.clone();
        let started = std::time::Instant::now();
        let mut call = tokio::spawn(async move {
            let result = call_provider.transcribe(&provider_request).await;
            match &result {
                Ok(response) => metrics.record_success(
                    &call_name,
                    started.elapsed().as_millis() as u64,
                    response.duration_secs.unwrap_or(0.0),
                ),
                Err(err) => metrics.record_failure(&call_name, err.code),
            }
            result
        });

        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    actx.record_heartbeat();
                }
                _ = actx.cancelled() => {
                    call.abort();
                    return Err(WorkflowError::Cancelled);
                }
                joined = &mut call => {
                    break joined.map_err(|e| WorkflowError::ActivityFailed {
                        activity: names::TRANSCRIBE_FILE.to_string(),
                        message: format!("transcription task panicked: {e}"),
                        retryable: false,
                    })?;
                }
            }
        };

        let response = outcome.map_err(WorkflowError::Transcription)?;
        Ok(TranscribeFileResult {
            file_id: request.file_id,
            text: response.text,
            provider: provider_name,
            processing_time_ms: response.processing_time.as_millis() as u64,
        })
    }

    /// Current health verdict for one provider.
    pub async fn get_provider_status(&self, name: &str) -> Result<ProviderStatus, WorkflowError> {
        let provider = self.registry.get(name).map_err(WorkflowError::Transcription)?;
        let info = provider.info();
        match provider.health_check().await {
            Ok(()) => Ok(ProviderStatus {
                name: name.to_string(),
                provider_type: info.provider_type,
                healthy: true,
                error: None,
            }),
            Err(err) => Ok(ProviderStatus {
                name: name.to_string(),
                provider_type: info.provider_type,
                healthy: false,
                error: Some(err.to_string()),
            }),
        }
    }

    pub fn list_available_providers(&self) -> Vec<String> {
        self.registry.list()
    }

    /// First remote-type provider in the registry, if any. Used by the
    /// batch retry pass when the primary was local.
    pub fn first_remote_provider(&self) -> Option<String> {
        self.registry
            .list_info()
            .into_iter()
            .find(|info| info.provider_type == ProviderType::Remote)
            .map(|info| info.name)
    }

    /// Whether `name` resolves to a local-type provider.
    pub fn is_local_provider(&self, name: &str) -> bool {
        self.registry
            .get(name)
            .map(|provider| provider.info().provider_type == ProviderType::Local)
            .unwrap_or(false)
    }

    /// The orchestrator's top pick for this file, if it has one.
    pub async fn get_recommended_provider(&self, file_path: &Path) -> Option<String> {
        let request = TranscriptionRequest::new(file_path);
        self.orchestrator
            .recommend_providers(&request)
            .await
            .into_iter()
            .next()
    }

    /// Upload a local file under `key` with user metadata; returns the
    /// `store://` URL.
    pub async fn upload_file(
        &self,
        actx: &ActivityContext,
        local_path: &Path,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, WorkflowError> {
        let bytes = tokio::fs::read(local_path).await.map_err(|e| {
            io_failure(
                names::UPLOAD_FILE,
                format!("failed to read {}: {e}", local_path.display()),
            )
        })?;
        actx.record_heartbeat();
        self.store
            .put(key, bytes, metadata)
            .await
            .map_err(|e| storage_failure(names::UPLOAD_FILE, e))?;
        actx.record_heartbeat();
        tracing::debug!(key, "uploaded object");
        Ok(store_url(key))
    }

    /// Download `key` to `local_path`, or to a fresh file under the temp
    /// dir when none is given. Returns the local path.
    pub async fn download_file(
        &self,
        actx: &ActivityContext,
        key: &str,
        local_path: Option<PathBuf>,
    ) -> Result<PathBuf, WorkflowError> {
        let bytes = self
            .store
            .get(key)
            .await
            .map_err(|e| storage_failure(names::DOWNLOAD_FILE, e))?;
        actx.record_heartbeat();

        let target = match local_path {
            Some(path) => path,
            None => {
                let file_name = Path::new(key)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "download".to_string());
                self.temp_dir
                    .join(format!("{}-{file_name}", uuid::Uuid::new_v4()))
            }
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                io_failure(
                    names::DOWNLOAD_FILE,
                    format!("failed to create {}: {e}", parent.display()),
                )
            })?;
        }
        tokio::fs::write(&target, bytes).await.map_err(|e| {
            io_failure(
                names::DOWNLOAD_FILE,
                format!("failed to write {}: {e}", target.display()),
            )
        })?;
        actx.record_heartbeat();
        tracing::debug!(key, target = %target.display(), "downloaded object");
        Ok(target)
    }

    pub async fn ensure_bucket_exists(&self) -> Result<(), WorkflowError> {
        self.store
            .ensure_bucket()
            .await
            .map_err(|e| storage_failure(names::ENSURE_BUCKET_EXISTS, e))
    }

    /// List stored objects under `prefix`. Without `recursive`, keys with
    /// further path segments below the prefix are dropped.
    pub async fn list_files(
        &self,
        prefix: &str,
        recursive: bool,
        max_results: usize,
    ) -> Result<Vec<ObjectInfo>, WorkflowError> {
        let mut listed = self
            .store
            .list(prefix, max_results)
            .await
            .map_err(|e| storage_failure(names::LIST_FILES, e))?;
        if !recursive {
            listed.retain(|object| !object.key[prefix.len()..].trim_start_matches('/').contains('/'));
        }
        Ok(listed)
    }

    /// Delete a staged temp file. Refuses paths outside the sanctioned
    /// temp directory; a missing file is not an error.
    pub async fn cleanup_temp_file(&self, path: &Path) -> Result<(), WorkflowError> {
        if !path.starts_with(&self.temp_dir) {
            return Err(WorkflowError::ActivityFailed {
                activity: names::CLEANUP_TEMP_FILE.to_string(),
                message: format!(
                    "refusing to delete outside the temp dir: {}",
                    path.display()
                ),
                retryable: false,
            });
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_failure(
                names::CLEANUP_TEMP_FILE,
                format!("failed to delete {}: {e}", path.display()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use voxflow_providers_sdk::config::OrchestratorConfig;
    use voxflow_providers_sdk::error::TranscriptionError;
    use voxflow_providers_sdk::metrics::MetricsStore;
    use voxflow_providers_sdk::models::{ProviderInfo, TranscriptionResponse};
    use voxflow_providers_sdk::providers::Provider;

    struct EchoProvider {
        text: String,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Provider for EchoProvider {
        fn info(&self) -> ProviderInfo {
            voxflow_providers_sdk::providers::local_whisper::type_info()
        }

        fn validate_configuration(&self) -> Result<(), TranscriptionError> {
            Ok(())
        }

        async fn transcribe(
            &self,
            _request: &TranscriptionRequest,
        ) -> Result<TranscriptionResponse, TranscriptionError> {
            if self.fail {
                Err(TranscriptionError::network("echo", "down"))
            } else {
                Ok(TranscriptionResponse::new(self.text.clone(), "echo-model"))
            }
        }

        async fn health_check(&self) -> Result<(), TranscriptionError> {
            Ok(())
        }
    }

    fn activities_with(providers: Vec<(&str, bool)>, temp_dir: PathBuf) -> Activities {
        let registry = Arc::new(ProviderRegistry::new());
        for (name, fail) in providers {
            registry
                .register(
                    name,
                    Arc::new(EchoProvider {
                        text: format!("text from {name}"),
                        fail,
                    }),
                )
                .unwrap();
        }
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            Arc::new(MetricsStore::new()),
            OrchestratorConfig::default(),
        ));
        Activities::new(
            registry,
            orchestrator,
            Arc::new(MemoryObjectStore::new("voxflow")),
            temp_dir,
        )
    }

    #[tokio::test]
    async fn test_transcribe_file_uses_default_provider() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let activities = activities_with(vec![("echo", false)], dir.path().to_path_buf());

        let result = activities
            .transcribe_file(
                &ActivityContext::detached(),
                TranscribeFileRequest {
                    file_id: "f1".to_string(),
                    file_path: input,
                    provider: None,
                    language: None,
                    response_format: None,
                    options: HashMap::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.file_id, "f1");
        assert_eq!(result.text, "text from echo");
        assert_eq!(result.provider, "echo");
    }

    #[tokio::test]
    async fn test_transcribe_file_override_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let activities =
            activities_with(vec![("first", false), ("second", false)], dir.path().to_path_buf());

        let result = activities
            .transcribe_file(
                &ActivityContext::detached(),
                TranscribeFileRequest {
                    file_id: "f1".to_string(),
                    file_path: input,
                    provider: Some("second".to_string()),
                    language: None,
                    response_format: None,
                    options: HashMap::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.provider, "second");

        let stats = activities
            .orchestrator()
            .metrics()
            .provider_stats("second")
            .unwrap();
        assert_eq!(stats.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_transcribe_file_propagates_provider_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let activities = activities_with(vec![("bad", true)], dir.path().to_path_buf());

        let err = activities
            .transcribe_file(
                &ActivityContext::detached(),
                TranscribeFileRequest {
                    file_id: "f1".to_string(),
                    file_path: input,
                    provider: None,
                    language: None,
                    response_format: None,
                    options: HashMap::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.retryable());
        assert!(matches!(err, WorkflowError::Transcription(_)));
    }

    #[tokio::test]
    async fn test_unknown_provider_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let activities = activities_with(vec![("echo", false)], dir.path().to_path_buf());

        let err = activities
            .transcribe_file(
                &ActivityContext::detached(),
                TranscribeFileRequest {
                    file_id: "f1".to_string(),
                    file_path: PathBuf::from("/tmp/a.wav"),
                    provider: Some("missing".to_string()),
                    language: None,
                    response_format: None,
                    options: HashMap::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        std::fs::write(&input, b"transcript body").unwrap();
        let activities = activities_with(vec![("echo", false)], dir.path().to_path_buf());
        let actx = ActivityContext::detached();

        let url = activities
            .upload_file(
                &actx,
                &input,
                "transcriptions/2026-08-01/f1.txt",
                HashMap::from([("provider".to_string(), "echo".to_string())]),
            )
            .await
            .unwrap();
        assert_eq!(url, "store://transcriptions/2026-08-01/f1.txt");

        let downloaded = activities
            .download_file(&actx, "transcriptions/2026-08-01/f1.txt", None)
            .await
            .unwrap();
        assert!(downloaded.starts_with(dir.path()));
        assert_eq!(std::fs::read(&downloaded).unwrap(), b"transcript body");
    }

    #[tokio::test]
    async fn test_list_files_recursion_flag() {
        let dir = tempfile::tempdir().unwrap();
        let activities = activities_with(vec![("echo", false)], dir.path().to_path_buf());
        let store = activities.store().clone();
        store
            .put("audio/a.wav", b"x".to_vec(), HashMap::new())
            .await
            .unwrap();
        store
            .put("audio/nested/b.wav", b"y".to_vec(), HashMap::new())
            .await
            .unwrap();

        let flat = activities.list_files("audio/", false, 100).await.unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].key, "audio/a.wav");

        let all = activities.list_files("audio/", true, 100).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_refuses_paths_outside_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let activities = activities_with(vec![("echo", false)], dir.path().to_path_buf());

        let err = activities
            .cleanup_temp_file(Path::new("/etc/passwd"))
            .await
            .unwrap_err();
        assert!(!err.retryable());

        // Inside the temp dir: deleting a real file works, and a missing
        // one is fine
        let staged = dir.path().join("staged.wav");
        std::fs::write(&staged, b"x").unwrap();
        activities.cleanup_temp_file(&staged).await.unwrap();
        assert!(!staged.exists());
        activities.cleanup_temp_file(&staged).await.unwrap();
    }

    #[tokio::test]
    async fn test_provider_status_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let activities = activities_with(vec![("echo", false)], dir.path().to_path_buf());

        let status = activities.get_provider_status("echo").await.unwrap();
        assert!(status.healthy);
        assert!(status.error.is_none());

        assert_eq!(activities.list_available_providers(), vec!["echo"]);
        assert!(activities.get_provider_status("missing").await.is_err());

        let recommended = activities
            .get_recommended_provider(Path::new("/tmp/a.wav"))
            .await;
        assert_eq!(recommended.as_deref(), Some("echo"));
    }
}
