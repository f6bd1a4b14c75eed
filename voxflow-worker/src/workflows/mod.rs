//! # Workflows Module
//!
//! The durable execution graphs: single-file transcription, batch with
//! bounded parallelism, batch-with-retry, and the fallback family. Workflow
//! code performs external effects only through activities and
//! `side_effect`, takes time from the workflow clock, and sleeps through
//! the workflow sleep primitive, so each graph stays replay-friendly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use voxflow_providers_sdk::models::ResponseFormat;

pub mod batch;
pub mod fallback;
pub mod single_file;

/// Fixed workflow names as registered on the task queue.
pub mod names {
    pub const SINGLE_FILE: &str = "SingleFileTranscription";
    pub const BATCH: &str = "BatchTranscription";
    pub const BATCH_WITH_RETRY: &str = "BatchWithRetry";
    pub const FALLBACK: &str = "TranscriptionWithFallback";
    pub const SMART_FALLBACK: &str = "SmartFallback";
}

/// Per-file lifecycle. Retries stay within the current state; `Done` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileState {
    Init,
    Downloading,
    Transcribing,
    Persisting,
    Done,
    Failed,
}

pub(crate) fn trace_state(workflow_id: &str, file_id: &str, state: FileState) {
    tracing::debug!(workflow_id, file_id, state = ?state, "file state transition");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleFileRequest {
    pub file_id: String,
    /// Local path or a `store://` URL
    pub file_path: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub output_format: Option<ResponseFormat>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub use_object_store: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleFileResult {
    pub file_id: String,
    /// Where the transcription landed: a `store://` URL or a local path
    pub location: String,
    pub provider: String,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SingleFileResult {
    pub(crate) fn failed(file_id: String, error: String) -> Self {
        Self {
            file_id,
            location: String::new(),
            provider: String::new(),
            processing_time_ms: 0,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFile {
    pub file_id: String,
    pub file_path: String,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_id: String,
    pub files: Vec<BatchFile>,
    /// Batch-wide provider; a per-file provider wins over this
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub use_object_store: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub total_files: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Vec<SingleFileResult>,
    pub total_processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackRequest {
    pub file_id: String,
    pub file_path: String,
    /// Ordered candidates; empty uses the default triplet
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub output_format: Option<ResponseFormat>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub use_object_store: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackResult {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_provider: Option<String>,
    /// Every provider tried, in order; on success the last entry is the
    /// one that succeeded
    pub attempted_providers: Vec<String>,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
