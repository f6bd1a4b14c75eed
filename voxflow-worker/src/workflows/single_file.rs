//! Single-file transcription workflow: optionally stage the input from the
//! object store, transcribe it, persist the text, and clean up anything
//! staged along the way. Every external step is an activity; the two
//! filesystem writes go through the side-effect hook.

use super::{trace_state, FileState, SingleFileRequest, SingleFileResult};
use crate::activities::{names as activity_names, Activities, TranscribeFileRequest};
use crate::engine::{ActivityOptions, WorkflowContext, WorkflowError};
use crate::storage::parse_store_url;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub async fn run(
    ctx: WorkflowContext,
    activities: Arc<Activities>,
    request: SingleFileRequest,
) -> Result<SingleFileResult, WorkflowError> {
    trace_state(ctx.workflow_id(), &request.file_id, FileState::Init);

    let mut staged: Option<PathBuf> = None;
    let outcome = execute(&ctx, &activities, &request, &mut staged).await;

    // The staged download is removed on every exit path, success or not.
    if let Some(path) = staged {
        let cleanup = ctx
            .execute_activity(
                activity_names::CLEANUP_TEMP_FILE,
                &ActivityOptions::quick(),
                |_actx| {
                    let activities = activities.clone();
                    let path = path.clone();
                    async move { activities.cleanup_temp_file(&path).await }
                },
            )
            .await;
        if let Err(err) = cleanup {
            tracing::warn!(workflow_id = %ctx.workflow_id(), error = %err, "staged-input cleanup failed");
        }
    }

    match &outcome {
        Ok(_) => trace_state(ctx.workflow_id(), &request.file_id, FileState::Done),
        Err(_) => trace_state(ctx.workflow_id(), &request.file_id, FileState::Failed),
    }
    outcome
}

async fn execute(
    ctx: &WorkflowContext,
    activities: &Arc<Activities>,
    request: &SingleFileRequest,
    staged: &mut Option<PathBuf>,
) -> Result<SingleFileResult, WorkflowError> {
    let started = ctx.now();

    let local_path = match parse_store_url(&request.file_path) {
        Some(key) if request.use_object_store => {
            trace_state(ctx.workflow_id(), &request.file_id, FileState::Downloading);
            let key = key.to_string();
            let path = ctx
                .execute_activity(
                    activity_names::DOWNLOAD_FILE,
                    &ActivityOptions::default(),
                    |actx| {
                        let activities = activities.clone();
                        let key = key.clone();
                        async move { activities.download_file(&actx, &key, None).await }
                    },
                )
                .await?;
            *staged = Some(path.clone());
            path
        }
        _ => PathBuf::from(&request.file_path),
    };

    trace_state(ctx.workflow_id(), &request.file_id, FileState::Transcribing);
    let transcription = ctx
        .execute_activity(
            activity_names::TRANSCRIBE_FILE,
            &ActivityOptions::default(),
            |actx| {
                let activities = activities.clone();
                let transcribe_request = TranscribeFileRequest {
                    file_id: request.file_id.clone(),
                    file_path: local_path.clone(),
                    provider: request.provider.clone(),
                    language: request.language.clone(),
                    response_format: request.output_format,
                    options: request.options.clone(),
                };
                async move { activities.transcribe_file(&actx, transcribe_request).await }
            },
        )
        .await?;

    trace_state(ctx.workflow_id(), &request.file_id, FileState::Persisting);
    let location = persist(
        ctx,
        activities,
        request,
        &local_path,
        &transcription.provider,
        &transcription.text,
    )
    .await
        .map_err(|err| {
            // The transcription succeeded; keep the text in the error
            // payload so an operator can recover it.
            let retryable = err.retryable();
            WorkflowError::ActivityFailed {
                activity: "PersistTranscription".to_string(),
                message: format!(
                    "{err}; transcription text preserved in payload: {}",
                    transcription.text
                ),
                retryable,
            }
        })?;

    let elapsed = (ctx.now() - started).num_milliseconds().max(0) as u64;
    Ok(SingleFileResult {
        file_id: request.file_id.clone(),
        location,
        provider: transcription.provider,
        processing_time_ms: elapsed,
        error: None,
    })
}

async fn persist(
    ctx: &WorkflowContext,
    activities: &Arc<Activities>,
    request: &SingleFileRequest,
    local_path: &Path,
    provider: &str,
    text: &str,
) -> Result<String, WorkflowError> {
    if request.use_object_store {
        let key = format!(
            "transcriptions/{}/{}.txt",
            ctx.now().format("%Y-%m-%d"),
            request.file_id
        );

        let temp_path = ctx
            .side_effect(|| {
                let path = activities
                    .temp_dir()
                    .join(format!("{}.txt", uuid::Uuid::new_v4()));
                std::fs::create_dir_all(activities.temp_dir())?;
                std::fs::write(&path, text)?;
                Ok::<_, std::io::Error>(path)
            })
            .map_err(|e| WorkflowError::ActivityFailed {
                activity: activity_names::UPLOAD_FILE.to_string(),
                message: format!("failed to stage transcription text: {e}"),
                retryable: true,
            })?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("file_id".to_string(), request.file_id.clone());
        metadata.insert("provider".to_string(), provider.to_string());
        if let Some(language) = &request.language {
            metadata.insert("language".to_string(), language.clone());
        }

        let upload = ctx
            .execute_activity(
                activity_names::UPLOAD_FILE,
                &ActivityOptions::default(),
                |actx| {
                    let activities = activities.clone();
                    let temp_path = temp_path.clone();
                    let key = key.clone();
                    let metadata = metadata.clone();
                    async move {
                        activities
                            .upload_file(&actx, &temp_path, &key, metadata)
                            .await
                    }
                },
            )
            .await;

        let cleanup = ctx
            .execute_activity(
                activity_names::CLEANUP_TEMP_FILE,
                &ActivityOptions::quick(),
                |_actx| {
                    let activities = activities.clone();
                    let temp_path = temp_path.clone();
                    async move { activities.cleanup_temp_file(&temp_path).await }
                },
            )
            .await;
        if let Err(err) = cleanup {
            tracing::warn!(workflow_id = %ctx.workflow_id(), error = %err, "staged-output cleanup failed");
        }

        upload
    } else {
        let stem = local_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.file_id.clone());
        let target = local_path.with_file_name(format!("{stem}_transcription.txt"));
        ctx.side_effect(|| std::fs::write(&target, text))
            .map_err(|e| WorkflowError::ActivityFailed {
                activity: "WriteTranscription".to_string(),
                message: format!("failed to write {}: {e}", target.display()),
                retryable: true,
            })?;
        Ok(target.to_string_lossy().into_owned())
    }
}
