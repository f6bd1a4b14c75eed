//! Self-hosted whisper.cpp server provider: multipart POST to the
//! `/inference` endpoint of a user-controlled URL. Useful for a GPU box on
//! the local network; no API key unless the deployment adds one via
//! headers.

use crate::config::ProviderConfig;
use crate::error::TranscriptionError;
use crate::models::{
    AudioFormat, ProviderFeatures, ProviderInfo, ProviderRequirements, ProviderType,
    ResponseFormat, Segment, TranscriptionRequest, TranscriptionResponse,
};
use crate::providers::http_client::{map_error_response, AuthStrategy, HttpProviderClient};
use crate::providers::{check_input_file, check_response_format, require_text, Provider, RateGate};
use crate::subtitle::subtitles_to_text;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub const PROVIDER_TYPE: &str = "whisper-server";

const SUPPORTED_FORMATS: &[ResponseFormat] = &[
    ResponseFormat::Text,
    ResponseFormat::Json,
    ResponseFormat::VerboseJson,
    ResponseFormat::Srt,
    ResponseFormat::Vtt,
];

pub struct WhisperServerProvider {
    name: String,
    client: HttpProviderClient,
    base_url: String,
    inference_path: String,
    rate_gate: RateGate,
}

impl WhisperServerProvider {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, TranscriptionError> {
        let base_url = config.auth.base_url.clone().unwrap_or_default();
        let auth = match &config.auth.api_key {
            Some(key) if !key.is_empty() => AuthStrategy::Bearer { token: key.clone() },
            _ => AuthStrategy::None,
        };
        let client = HttpProviderClient::new(
            name,
            config.timeout(),
            Some(base_url.clone()),
            "http://localhost:8080",
            &config.auth.headers,
            auth,
        )?;
        Ok(Self {
            name: name.to_string(),
            client,
            base_url,
            inference_path: config
                .setting_str("inference_path")
                .unwrap_or("/inference")
                .to_string(),
            rate_gate: RateGate::new(config.performance.rate_limit_rpm),
        })
    }
}

pub fn from_config(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn Provider>, TranscriptionError> {
    let provider = WhisperServerProvider::new(name, config)?;
    provider.validate_configuration()?;
    Ok(Arc::new(provider))
}

pub fn type_info() -> ProviderInfo {
    let mut config_schema = HashMap::new();
    config_schema.insert(
        "inference_path".to_string(),
        crate::models::ConfigField::new("string", "Inference endpoint path", false)
            .with_default(serde_json::json!("/inference")),
    );

    ProviderInfo {
        name: PROVIDER_TYPE.to_string(),
        display_name: "Self-hosted Whisper Server".to_string(),
        provider_type: ProviderType::Remote,
        version: "1.0.0".to_string(),
        supported_formats: AudioFormat::all(),
        supported_languages: Vec::new(),
        max_file_size_mb: 0,
        max_duration_secs: 0,
        features: ProviderFeatures {
            timestamps: true,
            word_level: false,
            confidence: false,
            language_detection: true,
            streaming: false,
        },
        requirements: ProviderRequirements {
            internet: false,
            api_key: false,
            binary: false,
        },
        default_model: "server-default".to_string(),
        available_models: Vec::new(),
        latency_hint_ms: 8_000,
        cost_hint: "free (self-hosted)".to_string(),
        config_schema,
    }
}

/// Lenient parse of the server's JSON payload; whisper.cpp builds differ in
/// which optional fields they emit.
fn parse_json_payload(
    provider: &str,
    body: &str,
    model: String,
) -> Result<TranscriptionResponse, TranscriptionError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| TranscriptionError::parse(provider, format!("invalid JSON response: {e}")))?;

    let text = value
        .get("text")
        .and_then(|t| t.as_str())
        .ok_or_else(|| TranscriptionError::parse(provider, "response has no 'text' field"))?
        .trim()
        .to_string();

    let mut response = TranscriptionResponse::new(text, model);
    response.language = value
        .get("language")
        .and_then(|l| l.as_str())
        .map(str::to_string);
    response.duration_secs = value.get("duration").and_then(|d| d.as_f64());

    if let Some(segments) = value.get("segments").and_then(|s| s.as_array()) {
        let parsed: Vec<Segment> = segments
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                Some(Segment {
                    id: s.get("id").and_then(|v| v.as_u64()).unwrap_or(i as u64) as u32,
                    text: s.get("text")?.as_str()?.trim().to_string(),
                    start: s.get("start")?.as_f64()?,
                    end: s.get("end")?.as_f64()?,
                    avg_logprob: s.get("avg_logprob").and_then(|v| v.as_f64()),
                    compression_ratio: s.get("compression_ratio").and_then(|v| v.as_f64()),
                    no_speech_prob: s.get("no_speech_prob").and_then(|v| v.as_f64()),
                    temperature: s.get("temperature").and_then(|v| v.as_f64()),
                    words: None,
                })
            })
            .collect();
        if !parsed.is_empty() {
            if response.duration_secs.is_none() {
                response.duration_secs = parsed.last().map(|s| s.end);
            }
            response.segments = Some(parsed);
        }
    }

    Ok(response)
}

#[async_trait::async_trait]
impl Provider for WhisperServerProvider {
    fn info(&self) -> ProviderInfo {
        let mut info = type_info();
        info.name = self.name.clone();
        info
    }

    fn validate_configuration(&self) -> Result<(), TranscriptionError> {
        if self.base_url.is_empty() {
            return Err(TranscriptionError::invalid_input(
                &self.name,
                "auth.base_url is required for a self-hosted server",
            ));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(TranscriptionError::invalid_input(
                &self.name,
                format!("base_url must be http(s): {}", self.base_url),
            ));
        }
        Ok(())
    }

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let info = self.info();
        let format = check_response_format(&self.name, request, SUPPORTED_FORMATS)?;
        check_input_file(&self.name, &request.file_path, &info)?;
        self.rate_gate.acquire().await;

        let mut form = reqwest::multipart::Form::new()
            .part("file", self.client.file_part(&request.file_path).await?)
            .text("response_format", format.as_str().to_string());
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }
        if let Some(temperature) = request.clamped_temperature() {
            form = form.text("temperature", temperature.to_string());
        }
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }

        let started = Instant::now();
        let resp = self.client.post_multipart(&self.inference_path, form).await?;
        if !resp.status().is_success() {
            return Err(map_error_response(&self.name, resp).await);
        }

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| "server-default".to_string());
        let body = resp
            .text()
            .await
            .map_err(|e| TranscriptionError::parse(&self.name, e.to_string()))?;

        let mut response = match format {
            ResponseFormat::Json | ResponseFormat::VerboseJson => {
                parse_json_payload(&self.name, &body, model)?
            }
            ResponseFormat::Srt | ResponseFormat::Vtt => {
                TranscriptionResponse::new(body.trim(), model)
            }
            ResponseFormat::Text => {
                // Some deployments pin a subtitle output format server-side;
                // strip the scaffolding when the caller asked for plain text.
                let text = if body.contains("-->") {
                    subtitles_to_text(&body)
                } else {
                    body.trim().to_string()
                };
                TranscriptionResponse::new(text, model)
            }
        };

        response.text = require_text(&self.name, response.text)?;
        response.processing_time = started.elapsed();
        if response.language.is_none() {
            response.language = request.language.clone();
        }
        Ok(response)
    }

    async fn health_check(&self) -> Result<(), TranscriptionError> {
        let resp = self.client.get("/health").await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(map_error_response(&self.name, resp).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> WhisperServerProvider {
        let mut config = ProviderConfig::new(PROVIDER_TYPE);
        config.auth.base_url = Some(server.uri());
        WhisperServerProvider::new("whisper-server", &config).unwrap()
    }

    fn input_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("a.wav");
        std::fs::write(&path, b"RIFF").unwrap();
        path
    }

    #[test]
    fn test_validate_requires_base_url() {
        let config = ProviderConfig::new(PROVIDER_TYPE);
        let provider = WhisperServerProvider::new("whisper-server", &config).unwrap();
        assert_eq!(
            provider.validate_configuration().unwrap_err().code,
            ErrorCode::InvalidInput
        );

        let mut config = ProviderConfig::new(PROVIDER_TYPE);
        config.auth.base_url = Some("ftp://host".to_string());
        let provider = WhisperServerProvider::new("whisper-server", &config).unwrap();
        assert!(provider.validate_configuration().is_err());
    }

    #[tokio::test]
    async fn test_json_response_with_segments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inference"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "hello world",
                "segments": [
                    {"text": "hello", "start": 0.0, "end": 1.0},
                    {"text": "world", "start": 1.0, "end": 2.0}
                ]
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&server);
        let response = provider
            .transcribe(
                &TranscriptionRequest::new(input_file(&dir))
                    .with_response_format(ResponseFormat::Json),
            )
            .await
            .unwrap();
        assert_eq!(response.text, "hello world");
        assert_eq!(response.segments.as_ref().unwrap().len(), 2);
        assert_eq!(response.duration_secs, Some(2.0));
    }

    #[tokio::test]
    async fn test_subtitle_body_stripped_for_text_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inference"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "1\n00:00:00,000 --> 00:00:02,000\nhello world\n",
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&server);
        let response = provider
            .transcribe(&TranscriptionRequest::new(input_file(&dir)))
            .await
            .unwrap();
        assert_eq!(response.text, "hello world");
    }

    #[tokio::test]
    async fn test_srt_request_keeps_subtitle_body() {
        let srt = "1\n00:00:00,000 --> 00:00:02,000\nhello world";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inference"))
            .respond_with(ResponseTemplate::new(200).set_body_string(srt))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&server);
        let response = provider
            .transcribe(
                &TranscriptionRequest::new(input_file(&dir))
                    .with_response_format(ResponseFormat::Srt),
            )
            .await
            .unwrap();
        assert!(response.text.contains("-->"));
    }

    #[tokio::test]
    async fn test_custom_inference_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok text"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = ProviderConfig::new(PROVIDER_TYPE)
            .with_setting("inference_path", serde_json::json!("/v1/transcribe"));
        config.auth.base_url = Some(server.uri());
        let provider = WhisperServerProvider::new("whisper-server", &config).unwrap();

        let response = provider
            .transcribe(&TranscriptionRequest::new(input_file(&dir)))
            .await
            .unwrap();
        assert_eq!(response.text, "ok text");
    }

    #[tokio::test]
    async fn test_health_check_uses_health_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        assert!(provider.health_check().await.is_ok());
    }
}
