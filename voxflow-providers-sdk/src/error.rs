//! # Error Handling Module
//!
//! A single flat error type crosses every layer of the pipeline:
//! [`TranscriptionError`] carries a machine-readable [`ErrorCode`], a human
//! message, the provider that produced it, and a retryability flag the
//! orchestrator and workflow retry policies key off.
//!
//! ## Retryability
//!
//! An error is retryable iff the underlying failure class is transient:
//! network failures, rate limits, 5xx responses, timeouts, and transfer
//! failures. Validation and authentication failures are terminal; retrying
//! them only burns quota.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable failure classes surfaced in logs, metrics histograms
/// and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidInput,
    FileNotFound,
    FileTooLarge,
    FileOpenError,
    FileTransferFailed,
    AuthenticationFailed,
    RateLimitExceeded,
    ServerError,
    NetworkError,
    ResponseParseError,
    EmptyTranscription,
    TranscriptionFailed,
    UnknownError,
    // Orchestrator-level codes
    ProviderNotFound,
    AllProvidersFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::FileNotFound => "file_not_found",
            Self::FileTooLarge => "file_too_large",
            Self::FileOpenError => "file_open_error",
            Self::FileTransferFailed => "file_transfer_failed",
            Self::AuthenticationFailed => "authentication_failed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::ResponseParseError => "response_parse_error",
            Self::EmptyTranscription => "empty_transcription",
            Self::TranscriptionFailed => "transcription_failed",
            Self::UnknownError => "unknown_error",
            Self::ProviderNotFound => "provider_not_found",
            Self::AllProvidersFailed => "all_providers_failed",
        }
    }

    /// Default retryability for this failure class. Constructors use this;
    /// providers can still override per error.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::RateLimitExceeded
                | Self::ServerError
                | Self::FileTransferFailed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error every provider and the orchestrator return.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{provider}] {code}: {message}")]
pub struct TranscriptionError {
    pub code: ErrorCode,
    pub message: String,
    /// Name of the provider (or "orchestrator") that produced the error
    pub provider: String,
    /// Whether the caller may resubmit without data loss
    pub retryable: bool,
    /// Optional operator hints, e.g. "set OPENAI_API_KEY"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl TranscriptionError {
    /// Build an error with the code's default retryability.
    pub fn new(code: ErrorCode, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: code.default_retryable(),
            code,
            message: message.into(),
            provider: provider.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn invalid_input(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, provider, message)
    }

    pub fn file_not_found(provider: impl Into<String>, path: impl AsRef<std::path::Path>) -> Self {
        Self::new(
            ErrorCode::FileNotFound,
            provider,
            format!("input file not found: {}", path.as_ref().display()),
        )
    }

    pub fn file_too_large(provider: impl Into<String>, size_bytes: u64, limit_mb: u64) -> Self {
        Self::new(
            ErrorCode::FileTooLarge,
            provider,
            format!(
                "input is {:.1} MB, provider limit is {limit_mb} MB",
                size_bytes as f64 / (1024.0 * 1024.0)
            ),
        )
    }

    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, provider, message)
    }

    pub fn server(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, provider, message)
    }

    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthenticationFailed, provider, message)
    }

    pub fn parse(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResponseParseError, provider, message)
    }

    pub fn empty_transcription(provider: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::EmptyTranscription,
            provider,
            "provider returned an empty transcription",
        )
    }

    pub fn provider_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::ProviderNotFound,
            "orchestrator",
            format!("provider not registered: {name}"),
        )
    }
}
