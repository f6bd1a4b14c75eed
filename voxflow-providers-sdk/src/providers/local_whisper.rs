//! Local whisper.cpp-style binary provider: spawns a configured executable
//! with a model and input path and parses its stdout. No network, no API
//! key; the binary and model must exist on the worker machine.

use crate::config::ProviderConfig;
use crate::error::{ErrorCode, TranscriptionError};
use crate::models::{
    AudioFormat, ProviderFeatures, ProviderInfo, ProviderRequirements, ProviderType, Segment,
    TranscriptionRequest, TranscriptionResponse,
};
use crate::providers::{check_input_file, require_text, subprocess_failure, Configurable, Provider};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::process::Command;

pub const PROVIDER_TYPE: &str = "local-whisper";

#[derive(Debug, Clone)]
struct Settings {
    binary_path: String,
    model_path: String,
    threads: Option<u64>,
    extra_args: Vec<String>,
}

impl Settings {
    fn from_map(map: &HashMap<String, serde_json::Value>) -> Self {
        Self {
            binary_path: map
                .get("binary_path")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            model_path: map
                .get("model_path")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            threads: map.get("threads").and_then(|v| v.as_u64()),
            extra_args: map
                .get("extra_args")
                .and_then(|v| v.as_array())
                .map(|args| {
                    args.iter()
                        .filter_map(|a| a.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn to_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "binary_path".to_string(),
            serde_json::json!(self.binary_path),
        );
        map.insert("model_path".to_string(), serde_json::json!(self.model_path));
        if let Some(threads) = self.threads {
            map.insert("threads".to_string(), serde_json::json!(threads));
        }
        if !self.extra_args.is_empty() {
            map.insert("extra_args".to_string(), serde_json::json!(self.extra_args));
        }
        map
    }

    fn model_name(&self) -> String {
        Path::new(&self.model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "whisper".to_string())
    }
}

pub struct LocalWhisperProvider {
    name: String,
    settings: RwLock<Settings>,
    timeout: Duration,
}

impl LocalWhisperProvider {
    pub fn new(name: &str, config: &ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            settings: RwLock::new(Settings::from_map(&config.settings)),
            timeout: config.timeout(),
        }
    }

    fn settings(&self) -> Settings {
        self.settings.read().expect("settings lock poisoned").clone()
    }
}

pub fn from_config(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn Provider>, TranscriptionError> {
    let provider = LocalWhisperProvider::new(name, config);
    provider.validate_configuration()?;
    Ok(Arc::new(provider))
}

pub fn type_info() -> ProviderInfo {
    let mut config_schema = HashMap::new();
    config_schema.insert(
        "binary_path".to_string(),
        crate::models::ConfigField::new("string", "Path to the whisper executable", true),
    );
    config_schema.insert(
        "model_path".to_string(),
        crate::models::ConfigField::new("string", "Path to the ggml model file", true),
    );
    config_schema.insert(
        "threads".to_string(),
        crate::models::ConfigField::new("int", "Worker threads for inference", false),
    );
    config_schema.insert(
        "extra_args".to_string(),
        crate::models::ConfigField::new("list", "Additional CLI arguments", false),
    );

    ProviderInfo {
        name: PROVIDER_TYPE.to_string(),
        display_name: "Local Whisper".to_string(),
        provider_type: ProviderType::Local,
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
            binary: true,
        },
        default_model: "ggml-base.en".to_string(),
        available_models: vec![
            "ggml-tiny".to_string(),
            "ggml-base.en".to_string(),
            "ggml-small".to_string(),
            "ggml-medium".to_string(),
            "ggml-large-v3".to_string(),
        ],
        latency_hint_ms: 15_000,
        cost_hint: "free (local CPU/GPU)".to_string(),
        config_schema,
    }
}

/// Parse whisper.cpp stdout: timestamped lines become segments, everything
/// else becomes plain transcript text.
///
/// Timestamped lines look like
/// `[00:00:00.000 --> 00:00:02.500]   hello world`.
pub(crate) fn parse_output(stdout: &str) -> (String, Vec<Segment>) {
    let mut segments = Vec::new();
    let mut plain = Vec::new();

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(segment) = parse_segment_line(trimmed, segments.len() as u32) {
            segments.push(segment);
        } else {
            plain.push(trimmed.to_string());
        }
    }

    let text = if segments.is_empty() {
        plain.join(" ")
    } else {
        segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };
    (text, segments)
}

fn parse_segment_line(line: &str, id: u32) -> Option<Segment> {
    let rest = line.strip_prefix('[')?;
    let (timing, text) = rest.split_once(']')?;
    let (start, end) = timing.split_once("-->")?;
    Some(Segment {
        id,
        text: text.trim().to_string(),
        start: parse_timestamp(start.trim())?,
        end: parse_timestamp(end.trim())?,
        avg_logprob: None,
        compression_ratio: None,
        no_speech_prob: None,
        temperature: None,
        words: None,
    })
}

/// "HH:MM:SS.mmm" or "MM:SS.mmm" to seconds.
fn parse_timestamp(ts: &str) -> Option<f64> {
    let parts: Vec<&str> = ts.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (h.parse::<f64>().ok()?, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        [m, s] => (0.0, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        _ => return None,
    };
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[async_trait::async_trait]
impl Provider for LocalWhisperProvider {
    fn info(&self) -> ProviderInfo {
        let settings = self.settings();
        let mut info = type_info();
        info.name = self.name.clone();
        info.default_model = settings.model_name();
        info
    }

    fn validate_configuration(&self) -> Result<(), TranscriptionError> {
        let settings = self.settings();
        if settings.binary_path.is_empty() {
            return Err(TranscriptionError::invalid_input(
                &self.name,
                "binary_path is required",
            )
            .with_suggestion("set settings.binary_path or WHISPER_BINARY_PATH"));
        }
        if settings.model_path.is_empty() {
            return Err(TranscriptionError::invalid_input(
                &self.name,
                "model_path is required",
            )
            .with_suggestion("set settings.model_path or WHISPER_MODEL_PATH"));
        }
        Ok(())
    }

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let settings = self.settings();
        let info = self.info();
        check_input_file(&self.name, &request.file_path, &info)?;

        let mut command = Command::new(&settings.binary_path);
        command
            .arg("-m")
            .arg(&settings.model_path)
            .arg("-f")
            .arg(&request.file_path);
        if let Some(language) = &request.language {
            command.arg("-l").arg(language);
        }
        if let Some(threads) = settings.threads {
            command.arg("-t").arg(threads.to_string());
        }
        if let Some(temperature) = request.clamped_temperature() {
            command.arg("--temperature").arg(temperature.to_string());
        }
        if let Some(prompt) = &request.prompt {
            command.arg("--prompt").arg(prompt);
        }
        command.args(&settings.extra_args);
        command.kill_on_drop(true);

        let started = Instant::now();
        let child = command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TranscriptionError::new(
                        ErrorCode::TranscriptionFailed,
                        &self.name,
                        format!("binary not found: {}", settings.binary_path),
                    )
                    .with_suggestion("install whisper.cpp or fix binary_path")
                } else {
                    TranscriptionError::new(
                        ErrorCode::TranscriptionFailed,
                        &self.name,
                        format!("failed to spawn {}: {e}", settings.binary_path),
                    )
                }
            })?;

        let timeout = request.timeout.unwrap_or(self.timeout);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                TranscriptionError::new(
                    ErrorCode::TranscriptionFailed,
                    &self.name,
                    format!("transcription timed out after {}s", timeout.as_secs()),
                )
                .retryable(true)
            })?
            .map_err(|e| {
                TranscriptionError::new(
                    ErrorCode::TranscriptionFailed,
                    &self.name,
                    format!("failed to collect output: {e}"),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(subprocess_failure(&self.name, output.status, &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (text, segments) = parse_output(&stdout);
        let text = require_text(&self.name, text)?;

        let duration_secs = segments.last().map(|s| s.end);
        let mut response = TranscriptionResponse::new(
            text,
            request
                .model
                .clone()
                .unwrap_or_else(|| settings.model_name()),
        );
        response.language = request.language.clone();
        response.duration_secs = duration_secs;
        response.segments = (!segments.is_empty()).then_some(segments);
        response.processing_time = started.elapsed();
        Ok(response)
    }

    async fn health_check(&self) -> Result<(), TranscriptionError> {
        let settings = self.settings();
        if !Path::new(&settings.binary_path).exists() {
            return Err(TranscriptionError::new(
                ErrorCode::TranscriptionFailed,
                &self.name,
                format!("binary not found: {}", settings.binary_path),
            ));
        }
        if !Path::new(&settings.model_path).exists() {
            return Err(TranscriptionError::new(
                ErrorCode::TranscriptionFailed,
                &self.name,
                format!("model not found: {}", settings.model_path),
            ));
        }
        Ok(())
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }
}

impl Configurable for LocalWhisperProvider {
    fn update_configuration(
        &self,
        settings: HashMap<String, serde_json::Value>,
    ) -> Result<(), TranscriptionError> {
        let merged = {
            let current = self.settings.read().expect("settings lock poisoned");
            let mut map = current.to_map();
            map.extend(settings);
            Settings::from_map(&map)
        };
        if merged.binary_path.is_empty() || merged.model_path.is_empty() {
            return Err(TranscriptionError::invalid_input(
                &self.name,
                "binary_path and model_path cannot be cleared",
            ));
        }
        *self.settings.write().expect("settings lock poisoned") = merged;
        Ok(())
    }

    fn get_configuration(&self) -> HashMap<String, serde_json::Value> {
        self.settings().to_map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProviderConfig {
        ProviderConfig::new(PROVIDER_TYPE)
            .with_setting("binary_path", serde_json::json!("/usr/bin/whisper-cli"))
            .with_setting("model_path", serde_json::json!("/models/ggml-base.en.bin"))
    }

    #[test]
    fn test_parse_timestamped_output() {
        let stdout = "\n[00:00:00.000 --> 00:00:02.500]   hello world\n[00:00:02.500 --> 00:01:04.000]  second segment\n";
        let (text, segments) = parse_output(stdout);
        assert_eq!(text, "hello world second segment");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments[0].end, 2.5);
        assert_eq!(segments[1].end, 64.0);
        assert_eq!(segments[1].id, 1);
    }

    #[test]
    fn test_parse_plain_output() {
        let (text, segments) = parse_output("hello world\n");
        assert_eq!(text, "hello world");
        assert!(segments.is_empty());
    }

    #[test]
    fn test_validate_requires_paths() {
        let config = ProviderConfig::new(PROVIDER_TYPE);
        let provider = LocalWhisperProvider::new("local", &config);
        let err = provider.validate_configuration().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);

        let provider = LocalWhisperProvider::new("local", &test_config());
        assert!(provider.validate_configuration().is_ok());
    }

    #[tokio::test]
    async fn test_health_check_reports_missing_binary() {
        let provider = LocalWhisperProvider::new("local", &test_config());
        let err = provider.health_check().await.unwrap_err();
        assert!(err.message.contains("binary not found"));
    }

    #[tokio::test]
    async fn test_transcribe_with_stub_binary() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("fake-whisper");
        let model = dir.path().join("model.bin");
        let input = dir.path().join("a.wav");
        std::fs::write(&binary, "#!/bin/sh\necho 'hello world'\n").unwrap();
        std::fs::write(&model, b"model").unwrap();
        std::fs::write(&input, b"RIFF").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = ProviderConfig::new(PROVIDER_TYPE)
            .with_setting("binary_path", serde_json::json!(binary.to_str().unwrap()))
            .with_setting("model_path", serde_json::json!(model.to_str().unwrap()));
        let provider = LocalWhisperProvider::new("local", &config);

        let response = provider
            .transcribe(&TranscriptionRequest::new(&input).with_language("en"))
            .await
            .unwrap();
        assert_eq!(response.text, "hello world");
        assert_eq!(response.language.as_deref(), Some("en"));
        assert_eq!(response.model_used, "model");
    }

    #[tokio::test]
    async fn test_missing_input_is_file_not_found() {
        let provider = LocalWhisperProvider::new("local", &test_config());
        let err = provider
            .transcribe(&TranscriptionRequest::new("/nonexistent/a.wav"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FileNotFound);
        assert!(!err.retryable);
    }

    #[test]
    fn test_configurable_merge() {
        let provider = LocalWhisperProvider::new("local", &test_config());
        provider
            .update_configuration(HashMap::from([(
                "threads".to_string(),
                serde_json::json!(8),
            )]))
            .unwrap();
        let config = provider.get_configuration();
        assert_eq!(config["threads"], serde_json::json!(8));
        assert_eq!(config["binary_path"], serde_json::json!("/usr/bin/whisper-cli"));

        let err = provider
            .update_configuration(HashMap::from([(
                "binary_path".to_string(),
                serde_json::json!(""),
            )]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }
}
