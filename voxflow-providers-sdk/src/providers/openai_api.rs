//! OpenAI-compatible transcription API provider: multipart upload to
//! `/audio/transcriptions` with a bearer key. Groq and other
//! OpenAI-compatible services work through the same type with a different
//! `base_url`.

use crate::config::ProviderConfig;
use crate::error::TranscriptionError;
use crate::models::{
    AudioFormat, ProviderFeatures, ProviderInfo, ProviderRequirements, ProviderType,
    ResponseFormat, Segment, TranscriptionRequest, TranscriptionResponse, Word,
};
use crate::providers::http_client::{map_error_response, AuthStrategy, HttpProviderClient};
use crate::providers::{check_input_file, check_response_format, require_text, Provider, RateGate};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub const PROVIDER_TYPE: &str = "openai-api";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "whisper-1";
const SUPPORTED_FORMATS: &[ResponseFormat] = &[
    ResponseFormat::Text,
    ResponseFormat::Json,
    ResponseFormat::VerboseJson,
    ResponseFormat::Srt,
    ResponseFormat::Vtt,
];

pub struct OpenAiApiProvider {
    name: String,
    client: HttpProviderClient,
    api_key: String,
    default_model: String,
    rate_gate: RateGate,
}

impl OpenAiApiProvider {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, TranscriptionError> {
        let api_key = config.auth.api_key.clone().unwrap_or_default();
        let client = HttpProviderClient::new(
            name,
            config.timeout(),
            config.auth.base_url.clone(),
            DEFAULT_BASE_URL,
            &config.auth.headers,
            AuthStrategy::Bearer {
                token: api_key.clone(),
            },
        )?;
        Ok(Self {
            name: name.to_string(),
            client,
            api_key,
            default_model: config
                .setting_str("model")
                .unwrap_or(DEFAULT_MODEL)
                .to_string(),
            rate_gate: RateGate::new(config.performance.rate_limit_rpm),
        })
    }
}

pub fn from_config(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn Provider>, TranscriptionError> {
    let provider = OpenAiApiProvider::new(name, config)?;
    provider.validate_configuration()?;
    Ok(Arc::new(provider))
}

pub fn type_info() -> ProviderInfo {
    let mut config_schema = HashMap::new();
    config_schema.insert(
        "model".to_string(),
        crate::models::ConfigField::new("string", "Transcription model id", false)
            .with_default(serde_json::json!(DEFAULT_MODEL)),
    );

    ProviderInfo {
        name: PROVIDER_TYPE.to_string(),
        display_name: "OpenAI Transcription API".to_string(),
        provider_type: ProviderType::Remote,
        version: "1.0.0".to_string(),
        supported_formats: vec![
            AudioFormat::Wav,
            AudioFormat::Mp3,
            AudioFormat::M4a,
            AudioFormat::Flac,
            AudioFormat::Ogg,
            AudioFormat::Webm,
        ],
        supported_languages: Vec::new(),
        max_file_size_mb: 25,
        max_duration_secs: 0,
        features: ProviderFeatures {
            timestamps: true,
            word_level: true,
            confidence: true,
            language_detection: true,
            streaming: false,
        },
        requirements: ProviderRequirements {
            internet: true,
            api_key: true,
            binary: false,
        },
        default_model: DEFAULT_MODEL.to_string(),
        available_models: vec![DEFAULT_MODEL.to_string()],
        latency_hint_ms: 5_000,
        cost_hint: "$0.006/min".to_string(),
        config_schema,
    }
}

/// `verbose_json` payload shape.
#[derive(Debug, Deserialize)]
struct VerbosePayload {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Option<Vec<ApiSegment>>,
    #[serde(default)]
    words: Option<Vec<ApiWord>>,
}

#[derive(Debug, Deserialize)]
struct ApiSegment {
    id: u32,
    text: String,
    start: f64,
    end: f64,
    #[serde(default)]
    avg_logprob: Option<f64>,
    #[serde(default)]
    compression_ratio: Option<f64>,
    #[serde(default)]
    no_speech_prob: Option<f64>,
    #[serde(default)]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiWord {
    word: String,
    start: f64,
    end: f64,
    #[serde(default)]
    probability: Option<f64>,
}

impl VerbosePayload {
    fn into_response(self, model: String) -> TranscriptionResponse {
        let segments: Option<Vec<Segment>> = self.segments.map(|segments| {
            segments
                .into_iter()
                .map(|s| Segment {
                    id: s.id,
                    text: s.text.trim().to_string(),
                    start: s.start,
                    end: s.end,
                    avg_logprob: s.avg_logprob,
                    compression_ratio: s.compression_ratio,
                    no_speech_prob: s.no_speech_prob,
                    temperature: s.temperature,
                    words: None,
                })
                .collect()
        });

        // Aggregate confidence from the per-segment log probabilities
        let confidence = segments.as_ref().and_then(|segments| {
            let probs: Vec<f64> = segments.iter().filter_map(|s| s.avg_logprob).collect();
            if probs.is_empty() {
                None
            } else {
                let mean = probs.iter().sum::<f64>() / probs.len() as f64;
                Some(mean.exp().clamp(0.0, 1.0))
            }
        });

        let mut response = TranscriptionResponse::new(self.text.trim(), model);
        response.language = self.language;
        response.duration_secs = self.duration;
        response.confidence = confidence;
        response.segments = segments;
        response.words = self.words.map(|words| {
            words
                .into_iter()
                .map(|w| Word {
                    text: w.word,
                    start: w.start,
                    end: w.end,
                    probability: w.probability,
                })
                .collect()
        });
        response
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiApiProvider {
    fn info(&self) -> ProviderInfo {
        let mut info = type_info();
        info.name = self.name.clone();
        info.default_model = self.default_model.clone();
        info
    }

    fn validate_configuration(&self) -> Result<(), TranscriptionError> {
        if self.api_key.is_empty() {
            return Err(TranscriptionError::authentication(
                &self.name,
                "api_key is not configured",
            )
            .with_suggestion("set auth.api_key (e.g. ${OPENAI_API_KEY})"));
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

        // Ask for verbose_json whenever structure is wanted; keep the
        // caller's format otherwise.
        let wire_format = match format {
            ResponseFormat::Json | ResponseFormat::VerboseJson => ResponseFormat::VerboseJson,
            other => other,
        };

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let mut form = reqwest::multipart::Form::new()
            .part("file", self.client.file_part(&request.file_path).await?)
            .text("model", model.clone())
            .text("response_format", wire_format.as_str().to_string());
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = request.clamped_temperature() {
            form = form.text("temperature", temperature.to_string());
        }
        for granularity in &request.timestamp_granularities {
            let value = match granularity {
                crate::models::TimestampGranularity::Word => "word",
                crate::models::TimestampGranularity::Segment => "segment",
            };
            form = form.text("timestamp_granularities[]", value.to_string());
        }

        let started = Instant::now();
        let resp = self.client.post_multipart("/audio/transcriptions", form).await?;
        if !resp.status().is_success() {
            return Err(map_error_response(&self.name, resp).await);
        }

        let mut response = match wire_format {
            ResponseFormat::VerboseJson => {
                let payload: VerbosePayload = resp
                    .json()
                    .await
                    .map_err(|e| TranscriptionError::parse(&self.name, e.to_string()))?;
                payload.into_response(model)
            }
            _ => {
                let body = resp
                    .text()
                    .await
                    .map_err(|e| TranscriptionError::parse(&self.name, e.to_string()))?;
                TranscriptionResponse::new(body.trim(), model)
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
        self.validate_configuration()?;
        let resp = self.client.get("/models").await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(map_error_response(&self.name, resp).await)
        }
    }
}
