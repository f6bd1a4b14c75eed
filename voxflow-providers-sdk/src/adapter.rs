//! Bridge between the orchestrator and the legacy single-method
//! transcription surface used by older callers: path in, text out, with the
//! configured global timeout applied around the whole fallback traversal.

use crate::error::TranscriptionError;
use crate::models::TranscriptionRequest;
use crate::orchestrator::Orchestrator;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// The legacy transcription surface.
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcript(&self, path: &Path) -> Result<String, TranscriptionError>;
}

/// [`Transcriber`] backed by the orchestrator's selection and fallback.
pub struct OrchestratorTranscriber {
    orchestrator: Arc<Orchestrator>,
    global_timeout: Duration,
}

impl OrchestratorTranscriber {
    pub fn new(orchestrator: Arc<Orchestrator>, global_timeout: Duration) -> Self {
        Self {
            orchestrator,
            global_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Transcriber for OrchestratorTranscriber {
    async fn transcript(&self, path: &Path) -> Result<String, TranscriptionError> {
        let request = TranscriptionRequest::new(path);
        let response =
            tokio::time::timeout(self.global_timeout, self.orchestrator.transcribe(&request))
                .await
                .map_err(|_| {
                    TranscriptionError::network(
                        "orchestrator",
                        format!(
                            "transcription timed out after {}s",
                            self.global_timeout.as_secs()
                        ),
                    )
                })??;
        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::error::ErrorCode;
    use crate::metrics::MetricsStore;
    use crate::models::{ProviderInfo, TranscriptionResponse};
    use crate::providers::Provider;
    use crate::registry::ProviderRegistry;

    struct SlowProvider {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Provider for SlowProvider {
        fn info(&self) -> ProviderInfo {
            crate::providers::local_whisper::type_info()
        }

        fn validate_configuration(&self) -> Result<(), TranscriptionError> {
            Ok(())
        }

        async fn transcribe(
            &self,
            _request: &TranscriptionRequest,
        ) -> Result<TranscriptionResponse, TranscriptionError> {
            tokio::time::sleep(self.delay).await;
            Ok(TranscriptionResponse::new("slow text", "m"))
        }

        async fn health_check(&self) -> Result<(), TranscriptionError> {
            Ok(())
        }
    }

    fn transcriber_with(delay: Duration, global_timeout: Duration) -> OrchestratorTranscriber {
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .register("slow", Arc::new(SlowProvider { delay }))
            .unwrap();
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            Arc::new(MetricsStore::new()),
            OrchestratorConfig {
                max_retries: 0,
                ..Default::default()
            },
        ));
        OrchestratorTranscriber::new(orchestrator, global_timeout)
    }

    #[tokio::test]
    async fn test_transcript_returns_text() {
        let transcriber = transcriber_with(Duration::from_millis(1), Duration::from_secs(5));
        let text = transcriber.transcript(Path::new("/tmp/a.wav")).await.unwrap();
        assert_eq!(text, "slow text");
    }

    #[tokio::test]
    async fn test_global_timeout_applies() {
        let transcriber = transcriber_with(Duration::from_secs(60), Duration::from_millis(20));
        let err = transcriber
            .transcript(Path::new("/tmp/a.wav"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert!(err.message.contains("timed out"));
    }
}
