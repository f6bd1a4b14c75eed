//! # Data Model Module
//!
//! Core request/response types shared by every transcription provider and
//! by the orchestrator: audio formats, provider capability descriptors,
//! transcription requests and their segment/word-level results.
//!
//! ## Overview
//!
//! - **ProviderInfo**: immutable capability sheet a provider advertises
//! - **TranscriptionRequest**: one transcription job, provider-agnostic
//! - **TranscriptionResponse**: text plus optional segments, words and metadata
//!
//! Capabilities are data, not trait variants: routing and feature checks key
//! off the declared flags, so a new backend only needs a new factory entry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Audio container formats understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    M4a,
    Flac,
    Ogg,
    Amr,
    Webm,
}

impl AudioFormat {
    /// Map a file extension (without the dot, any case) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(Self::Wav),
            "mp3" => Some(Self::Mp3),
            "m4a" => Some(Self::M4a),
            "flac" => Some(Self::Flac),
            "ogg" => Some(Self::Ogg),
            "amr" => Some(Self::Amr),
            "webm" => Some(Self::Webm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Amr => "amr",
            Self::Webm => "webm",
        }
    }

    /// Every format the pipeline knows about.
    pub fn all() -> Vec<AudioFormat> {
        vec![
            Self::Wav,
            Self::Mp3,
            Self::M4a,
            Self::Flac,
            Self::Ogg,
            Self::Amr,
            Self::Webm,
        ]
    }
}

/// Coarse media class used by format-based routing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaClass {
    Audio,
    Video,
}

impl MediaClass {
    /// Classify a path by extension. Container formats that are video-first
    /// (mp4, mkv, avi, mov, flv, wmv, ts) count as video; everything else,
    /// including unknown extensions, counts as audio.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "mkv" | "avi" | "mov" | "flv" | "wmv" | "ts" => Self::Video,
            _ => Self::Audio,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Where a provider runs relative to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Runs on the worker machine (binary, GPU)
    Local,
    /// Runs behind a remote API
    Remote,
    /// Partly local, partly remote (e.g. remote binary over SSH)
    Hybrid,
}

/// Feature flags a provider advertises.
///
/// Selection and output shaping key off these flags instead of trait
/// variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFeatures {
    pub timestamps: bool,
    pub word_level: bool,
    pub confidence: bool,
    pub language_detection: bool,
    pub streaming: bool,
}

/// Environmental requirements a provider has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequirements {
    pub internet: bool,
    pub api_key: bool,
    pub binary: bool,
}

/// One field of a provider's configuration schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    /// Value type, e.g. "string", "int", "bool"
    pub field_type: String,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ConfigField {
    pub fn new(field_type: &str, description: &str, required: bool) -> Self {
        Self {
            field_type: field_type.to_string(),
            description: description.to_string(),
            required,
            default: None,
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Immutable capability sheet for one provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Unique registry name
    pub name: String,
    /// Human-readable name for listings
    pub display_name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub version: String,
    pub supported_formats: Vec<AudioFormat>,
    /// Empty means every language
    pub supported_languages: Vec<String>,
    /// 0 means unbounded
    pub max_file_size_mb: u64,
    /// 0 means unbounded
    pub max_duration_secs: u64,
    pub features: ProviderFeatures,
    pub requirements: ProviderRequirements,
    pub default_model: String,
    pub available_models: Vec<String>,
    /// Typical end-to-end latency hint in milliseconds
    pub latency_hint_ms: u64,
    /// Free-form cost hint, e.g. "free (local CPU)" or "$0.006/min"
    pub cost_hint: String,
    pub config_schema: HashMap<String, ConfigField>,
}

impl ProviderInfo {
    /// Whether `language` (empty = unspecified) is accepted by this provider.
    pub fn supports_language(&self, language: &str) -> bool {
        language.is_empty()
            || self.supported_languages.is_empty()
            || self.supported_languages.iter().any(|l| l == language)
    }

    /// Whether a file of `size_bytes` fits under the declared limit.
    pub fn accepts_file_size(&self, size_bytes: u64) -> bool {
        self.max_file_size_mb == 0 || size_bytes <= self.max_file_size_mb * 1024 * 1024
    }
}

/// Shape of the transcription result a caller asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
    VerboseJson,
    Srt,
    Vtt,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::VerboseJson => "verbose_json",
            Self::Srt => "srt",
            Self::Vtt => "vtt",
        }
    }

    /// Subtitle formats carry index numbers and timestamp markers.
    pub fn is_subtitle(&self) -> bool {
        matches!(self, Self::Srt | Self::Vtt)
    }
}

/// Timestamp detail levels a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampGranularity {
    Word,
    Segment,
}

/// One transcription job.
///
/// Cancellation rides the async context: dropping the in-flight future (or
/// cancelling the workflow token above it) aborts the request, and
/// `timeout` bounds a single orchestrated call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature, clamped to [0.0, 1.0] before use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timestamp_granularities: Vec<TimestampGranularity>,
    /// Free-form per-provider options
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl TranscriptionRequest {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            language: None,
            model: None,
            temperature: None,
            prompt: None,
            response_format: None,
            timestamp_granularities: Vec::new(),
            options: HashMap::new(),
            timeout: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Requested format, defaulting to plain text.
    pub fn format(&self) -> ResponseFormat {
        self.response_format.unwrap_or_default()
    }

    /// Temperature clamped to the valid [0, 1] range.
    pub fn clamped_temperature(&self) -> Option<f32> {
        self.temperature.map(|t| t.clamp(0.0, 1.0))
    }

    /// Whether word-level timestamps were asked for.
    pub fn wants_words(&self) -> bool {
        self.timestamp_granularities
            .contains(&TimestampGranularity::Word)
    }
}

/// A timed slice of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    pub text: String,
    /// Start offset in seconds
    pub start: f64,
    /// End offset in seconds
    pub end: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_logprob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_speech_prob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<Word>>,
}

/// A single recognized word with its time span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub start: f64,
    pub end: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
}

/// Result of one transcription call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    /// Detected (or echoed) language code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Total audio duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Aggregate confidence in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<Word>>,
    /// Free-form per-provider metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub processing_time: Duration,
    pub model_used: String,
}

impl TranscriptionResponse {
    pub fn new(text: impl Into<String>, model_used: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: None,
            duration_secs: None,
            confidence: None,
            segments: None,
            words: None,
            metadata: HashMap::new(),
            processing_time: Duration::ZERO,
            model_used: model_used.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_format_extension_round_trip() {
        for format in AudioFormat::all() {
            assert_eq!(AudioFormat::from_extension(format.as_str()), Some(format));
        }
        assert_eq!(AudioFormat::from_extension("WAV"), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::from_extension("mp5"), None);
    }

    #[test]
    fn test_media_class_from_path() {
        assert_eq!(
            MediaClass::from_path(Path::new("/tmp/a.mp4")),
            MediaClass::Video
        );
        assert_eq!(
            MediaClass::from_path(Path::new("/tmp/a.wav")),
            MediaClass::Audio
        );
        // Unknown extensions default to audio
        assert_eq!(
            MediaClass::from_path(Path::new("/tmp/a.unknown")),
            MediaClass::Audio
        );
    }

    #[test]
    fn test_provider_info_language_and_size_limits() {
        let mut info = ProviderInfo {
            name: "test".to_string(),
            display_name: "Test".to_string(),
            provider_type: ProviderType::Local,
            version: "1.0".to_string(),
            supported_formats: AudioFormat::all(),
            supported_languages: vec![],
            max_file_size_mb: 25,
            max_duration_secs: 0,
            features: ProviderFeatures::default(),
            requirements: ProviderRequirements::default(),
            default_model: "base".to_string(),
            available_models: vec!["base".to_string()],
            latency_hint_ms: 100,
            cost_hint: "free".to_string(),
            config_schema: HashMap::new(),
        };

        // Empty supported list means every language
        assert!(info.supports_language("en"));
        assert!(info.supports_language(""));

        info.supported_languages = vec!["en".to_string(), "zh".to_string()];
        assert!(info.supports_language("zh"));
        assert!(!info.supports_language("fr"));

        assert!(info.accepts_file_size(25 * 1024 * 1024));
        assert!(!info.accepts_file_size(25 * 1024 * 1024 + 1));

        info.max_file_size_mb = 0;
        assert!(info.accepts_file_size(u64::MAX));
    }

    #[test]
    fn test_request_temperature_clamping() {
        let request = TranscriptionRequest::new("/tmp/a.wav").with_temperature(1.7);
        assert_eq!(request.clamped_temperature(), Some(1.0));

        let request = TranscriptionRequest::new("/tmp/a.wav").with_temperature(-0.3);
        assert_eq!(request.clamped_temperature(), Some(0.0));

        let request = TranscriptionRequest::new("/tmp/a.wav");
        assert_eq!(request.clamped_temperature(), None);
    }

    #[test]
    fn test_request_serde_round_trip() {
        let request = TranscriptionRequest::new("/tmp/a.wav")
            .with_language("en")
            .with_model("base")
            .with_response_format(ResponseFormat::VerboseJson)
            .with_option("beam_size", serde_json::json!(5));

        let json = serde_json::to_string(&request).unwrap();
        let back: TranscriptionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.file_path, PathBuf::from("/tmp/a.wav"));
        assert_eq!(back.language.as_deref(), Some("en"));
        assert_eq!(back.response_format, Some(ResponseFormat::VerboseJson));
        assert_eq!(back.options["beam_size"], serde_json::json!(5));
    }
}
