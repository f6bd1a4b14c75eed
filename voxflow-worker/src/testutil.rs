//! Scriptable providers and prebuilt activity environments for workflow
//! tests.

use crate::activities::Activities;
use crate::engine::WorkflowContext;
use crate::storage::{MemoryObjectStore, ObjectInfo, ObjectStore, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voxflow_providers_sdk::config::OrchestratorConfig;
use voxflow_providers_sdk::error::{ErrorCode, TranscriptionError};
use voxflow_providers_sdk::metrics::MetricsStore;
use voxflow_providers_sdk::models::{
    ProviderInfo, ProviderType, TranscriptionRequest, TranscriptionResponse,
};
use voxflow_providers_sdk::orchestrator::Orchestrator;
use voxflow_providers_sdk::providers::Provider;
use voxflow_providers_sdk::registry::ProviderRegistry;

/// What a mock provider should do per call.
#[derive(Clone)]
pub struct MockBehavior {
    pub text: String,
    pub fail_first: u64,
    pub error_code: ErrorCode,
    pub retryable: bool,
    pub delay: Duration,
    pub healthy: bool,
    pub provider_type: ProviderType,
}

impl MockBehavior {
    pub fn succeed(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fail_first: 0,
            error_code: ErrorCode::UnknownError,
            retryable: false,
            delay: Duration::ZERO,
            healthy: true,
            provider_type: ProviderType::Local,
        }
    }

    pub fn fail_always(code: &str, retryable: bool) -> Self {
        Self {
            fail_first: u64::MAX,
            error_code: code_from_str(code),
            retryable,
            ..Self::succeed("")
        }
    }

    pub fn fail_first(n: u64, code: &str, retryable: bool) -> Self {
        Self {
            fail_first: n,
            error_code: code_from_str(code),
            retryable,
            ..Self::succeed("recovered")
        }
    }

    pub fn unhealthy(text: &str) -> Self {
        Self {
            healthy: false,
            ..Self::succeed(text)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn remote(mut self) -> Self {
        self.provider_type = ProviderType::Remote;
        self
    }
}

fn code_from_str(code: &str) -> ErrorCode {
    match code {
        "invalid_input" => ErrorCode::InvalidInput,
        "network_error" => ErrorCode::NetworkError,
        "authentication_failed" => ErrorCode::AuthenticationFailed,
        "server_error" => ErrorCode::ServerError,
        "transcription_failed" => ErrorCode::TranscriptionFailed,
        _ => ErrorCode::UnknownError,
    }
}

/// Provider whose behavior is scripted and whose concurrency is observable.
pub struct MockProvider {
    name: String,
    behavior: MockBehavior,
    calls: AtomicU64,
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: &str, behavior: MockBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            calls: AtomicU64::new(0),
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping transcribe calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn info(&self) -> ProviderInfo {
        let mut info = voxflow_providers_sdk::providers::local_whisper::type_info();
        info.name = self.name.clone();
        info.provider_type = self.behavior.provider_type;
        info
    }

    fn validate_configuration(&self) -> Result<(), TranscriptionError> {
        Ok(())
    }

    async fn transcribe(
        &self,
        _request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.behavior.fail_first {
            return Err(TranscriptionError::new(
                self.behavior.error_code,
                &self.name,
                "scripted failure",
            )
            .retryable(self.behavior.retryable));
        }

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        if !self.behavior.delay.is_zero() {
            tokio::time::sleep(self.behavior.delay).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        let mut response = TranscriptionResponse::new(self.behavior.text.clone(), "mock-model");
        response.duration_secs = Some(1.0);
        Ok(response)
    }

    async fn health_check(&self) -> Result<(), TranscriptionError> {
        if self.behavior.healthy {
            Ok(())
        } else {
            Err(TranscriptionError::new(
                ErrorCode::TranscriptionFailed,
                &self.name,
                "binary not found",
            ))
        }
    }
}

/// Object store whose writes always fail; reads miss.
pub struct FailingStore;

#[async_trait]
impl ObjectStore for FailingStore {
    fn endpoint(&self) -> String {
        "memory://failing".to_string()
    }

    fn bucket(&self) -> &str {
        "failing"
    }

    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn put(
        &self,
        _key: &str,
        _bytes: Vec<u8>,
        _metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        Err(StorageError::Backend("injected write failure".to_string()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::NotFound {
            key: key.to_string(),
        })
    }

    async fn list(&self, _prefix: &str, _max: usize) -> Result<Vec<ObjectInfo>, StorageError> {
        Ok(Vec::new())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A ready-to-run activity environment over mock providers.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub activities: Arc<Activities>,
    memory: Option<Arc<MemoryObjectStore>>,
    providers: HashMap<String, Arc<MockProvider>>,
}

impl TestEnv {
    pub fn workflow_ctx(&self, workflow_id: &str) -> WorkflowContext {
        WorkflowContext::new(workflow_id, "test-queue", CancellationToken::new())
    }

    pub fn memory_store(&self) -> Arc<MemoryObjectStore> {
        self.memory.clone().expect("env uses the failing store")
    }

    pub fn provider(&self, name: &str) -> Arc<MockProvider> {
        self.providers[name].clone()
    }
}

fn build_env(
    providers: Vec<(&str, MockBehavior)>,
    store: Arc<dyn ObjectStore>,
    memory: Option<Arc<MemoryObjectStore>>,
) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ProviderRegistry::new());
    let mut mocks = HashMap::new();
    for (name, behavior) in providers {
        let provider = Arc::new(MockProvider::new(name, behavior));
        registry.register(name, provider.clone()).unwrap();
        mocks.insert(name.to_string(), provider);
    }

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(MetricsStore::new()),
        OrchestratorConfig {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        },
    ));

    let activities = Arc::new(Activities::new(
        registry,
        orchestrator,
        store,
        dir.path().to_path_buf(),
    ));

    TestEnv {
        dir,
        activities,
        memory,
        providers: mocks,
    }
}

/// Environment backed by the in-memory object store.
pub async fn test_env(providers: Vec<(&str, MockBehavior)>) -> TestEnv {
    let memory = Arc::new(MemoryObjectStore::new("voxflow-test"));
    build_env(providers, memory.clone(), Some(memory))
}

/// Environment whose object store rejects every write.
pub async fn failing_env(providers: Vec<(&str, MockBehavior)>) -> TestEnv {
    build_env(providers, Arc::new(FailingStore), None)
}
