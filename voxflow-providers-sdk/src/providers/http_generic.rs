//! Generic HTTP provider: a configurable escape hatch for transcription
//! endpoints nobody wrote a dedicated provider for. Endpoint, method, file
//! field name, extra form params and headers all come from settings; the
//! response is read from a JSON `text`/`transcription`/`result` field or,
//! failing that, the raw body.

use crate::config::ProviderConfig;
use crate::error::TranscriptionError;
use crate::models::{
    AudioFormat, ProviderFeatures, ProviderInfo, ProviderRequirements, ProviderType,
    ResponseFormat, TranscriptionRequest, TranscriptionResponse,
};
use crate::providers::http_client::{
    map_error_response, map_transport_error, AuthStrategy, HttpProviderClient,
};
use crate::providers::{check_input_file, check_response_format, require_text, Provider, RateGate};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub const PROVIDER_TYPE: &str = "http-generic";

const SUPPORTED_FORMATS: &[ResponseFormat] = &[ResponseFormat::Text, ResponseFormat::Json];

#[derive(Debug, Clone)]
struct Settings {
    endpoint: String,
    method: String,
    file_field: String,
    form_fields: HashMap<String, String>,
}

impl Settings {
    fn from_map(map: &HashMap<String, serde_json::Value>) -> Self {
        Self {
            endpoint: map
                .get("endpoint")
                .and_then(|v| v.as_str())
                .unwrap_or("/transcribe")
                .to_string(),
            method: map
                .get("method")
                .and_then(|v| v.as_str())
                .unwrap_or("POST")
                .to_ascii_uppercase(),
            file_field: map
                .get("file_field")
                .and_then(|v| v.as_str())
                .unwrap_or("file")
                .to_string(),
            form_fields: map
                .get("form_fields")
                .and_then(|v| v.as_object())
                .map(|fields| {
                    fields
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

pub struct HttpGenericProvider {
    name: String,
    client: HttpProviderClient,
    settings: Settings,
    base_url: String,
    rate_gate: RateGate,
}

impl HttpGenericProvider {
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
            "http://localhost:8000",
            &config.auth.headers,
            auth,
        )?;
        Ok(Self {
            name: name.to_string(),
            client,
            settings: Settings::from_map(&config.settings),
            base_url,
            rate_gate: RateGate::new(config.performance.rate_limit_rpm),
        })
    }
}

pub fn from_config(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn Provider>, TranscriptionError> {
    let provider = HttpGenericProvider::new(name, config)?;
    provider.validate_configuration()?;
    Ok(Arc::new(provider))
}

pub fn type_info() -> ProviderInfo {
    let mut config_schema = HashMap::new();
    config_schema.insert(
        "endpoint".to_string(),
        crate::models::ConfigField::new("string", "Request path on the base URL", false)
            .with_default(serde_json::json!("/transcribe")),
    );
    config_schema.insert(
        "method".to_string(),
        crate::models::ConfigField::new("string", "HTTP method (POST or PUT)", false)
            .with_default(serde_json::json!("POST")),
    );
    config_schema.insert(
        "file_field".to_string(),
        crate::models::ConfigField::new("string", "Multipart field name for the audio", false)
            .with_default(serde_json::json!("file")),
    );
    config_schema.insert(
        "form_fields".to_string(),
        crate::models::ConfigField::new("map", "Extra form fields sent verbatim", false),
    );

    ProviderInfo {
        name: PROVIDER_TYPE.to_string(),
        display_name: "Generic HTTP Endpoint".to_string(),
        provider_type: ProviderType::Remote,
        version: "1.0.0".to_string(),
        supported_formats: AudioFormat::all(),
        supported_languages: Vec::new(),
        max_file_size_mb: 0,
        max_duration_secs: 0,
        features: ProviderFeatures::default(),
        requirements: ProviderRequirements {
            internet: true,
            api_key: false,
            binary: false,
        },
        default_model: "endpoint-default".to_string(),
        available_models: Vec::new(),
        latency_hint_ms: 10_000,
        cost_hint: "depends on the endpoint".to_string(),
        config_schema,
    }
}

/// Pull the transcript out of a response body: first JSON
/// `text`/`transcription`/`result`, else the raw body.
fn extract_text(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["text", "transcription", "result"] {
            if let Some(text) = value.get(field).and_then(|t| t.as_str()) {
                return text.trim().to_string();
            }
        }
    }
    body.trim().to_string()
}

#[async_trait::async_trait]
impl Provider for HttpGenericProvider {
    fn info(&self) -> ProviderInfo {
        let mut info = type_info();
        info.name = self.name.clone();
        info
    }

    fn validate_configuration(&self) -> Result<(), TranscriptionError> {
        if self.base_url.is_empty() {
            return Err(TranscriptionError::invalid_input(
                &self.name,
                "auth.base_url is required",
            ));
        }
        match self.settings.method.as_str() {
            "POST" | "PUT" => Ok(()),
            other => Err(TranscriptionError::invalid_input(
                &self.name,
                format!("unsupported method: {other}"),
            )),
        }
    }

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let info = self.info();
        check_response_format(&self.name, request, SUPPORTED_FORMATS)?;
        check_input_file(&self.name, &request.file_path, &info)?;
        self.rate_gate.acquire().await;

        let mut form = reqwest::multipart::Form::new().part(
            self.settings.file_field.clone(),
            self.client.file_part(&request.file_path).await?,
        );
        for (key, value) in &self.settings.form_fields {
            form = form.text(key.clone(), value.clone());
        }
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }
        if let Some(model) = &request.model {
            form = form.text("model", model.clone());
        }

        let method = match self.settings.method.as_str() {
            "PUT" => reqwest::Method::PUT,
            _ => reqwest::Method::POST,
        };

        let started = Instant::now();
        let resp = self
            .client
            .request(method, &self.settings.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| map_transport_error(&self.name, e))?;
        if !resp.status().is_success() {
            return Err(map_error_response(&self.name, resp).await);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| TranscriptionError::parse(&self.name, e.to_string()))?;
        let text = require_text(&self.name, extract_text(&body))?;

        let mut response = TranscriptionResponse::new(
            text,
            request
                .model
                .clone()
                .unwrap_or_else(|| "endpoint-default".to_string()),
        );
        response.language = request.language.clone();
        response.processing_time = started.elapsed();
        Ok(response)
    }

    async fn health_check(&self) -> Result<(), TranscriptionError> {
        self.validate_configuration()?;
        // Any response proves the endpoint is reachable; generic endpoints
        // rarely expose a dedicated health route.
        self.client.get("/").await.map(|_| ())
    }
}
