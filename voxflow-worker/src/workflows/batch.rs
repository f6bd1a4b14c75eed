//! Batch transcription workflows: a bounded-parallel fan-out of child
//! single-file workflows, plus a retry variant that reruns the failures
//! after a pause, switching a local primary for a remote one.

use super::{single_file, BatchRequest, BatchResult, SingleFileRequest, SingleFileResult};
use crate::activities::Activities;
use crate::engine::{WorkflowContext, WorkflowError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// Children in flight at once when the request does not say.
const DEFAULT_MAX_PARALLEL: usize = 5;
/// Attempts per child before its failure is recorded in the batch result.
const CHILD_MAX_ATTEMPTS: u32 = 2;
/// Pause before the retry pass of [`run_with_retry`].
const RETRY_PASS_DELAY: Duration = Duration::from_secs(30);
/// Progress is logged every this many completions.
const PROGRESS_EVERY: usize = 10;

pub async fn run(
    ctx: WorkflowContext,
    activities: Arc<Activities>,
    request: BatchRequest,
) -> Result<BatchResult, WorkflowError> {
    let started = ctx.now();
    let total_files = request.files.len();
    let max_parallel = request.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL).max(1);
    tracing::info!(
        batch_id = %request.batch_id,
        total_files,
        max_parallel,
        "starting batch transcription"
    );

    // The semaphore is the batch's parallelism bound; providers never
    // enforce it themselves.
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let (tx, mut rx) = mpsc::channel::<SingleFileResult>(total_files.max(1));

    for file in request.files.clone() {
        let child_id = format!("{}-{}", request.batch_id, file.file_id);
        let child_ctx = ctx.child(&child_id);
        let activities = activities.clone();
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        let child_request = SingleFileRequest {
            file_id: file.file_id,
            file_path: file.file_path,
            // Per-file override wins over the batch-wide provider
            provider: file.provider.or_else(|| request.provider.clone()),
            language: request.language.clone(),
            output_format: None,
            options: std::collections::HashMap::new(),
            use_object_store: request.use_object_store,
        };

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let result = run_child_with_retry(child_ctx, activities, child_request).await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(total_files);
    while let Some(result) = rx.recv().await {
        results.push(result);
        if results.len() % PROGRESS_EVERY == 0 {
            tracing::info!(
                batch_id = %request.batch_id,
                completed = results.len(),
                total_files,
                "batch progress"
            );
        }
    }

    if ctx.is_cancelled() {
        return Err(WorkflowError::Cancelled);
    }

    let success_count = results.iter().filter(|r| r.error.is_none()).count();
    let total_processing_time_ms = (ctx.now() - started).num_milliseconds().max(0) as u64;
    tracing::info!(
        batch_id = %request.batch_id,
        success_count,
        failure_count = total_files - success_count,
        total_processing_time_ms,
        "batch complete"
    );

    Ok(BatchResult {
        batch_id: request.batch_id,
        total_files,
        success_count,
        failure_count: total_files - success_count,
        results,
        total_processing_time_ms,
    })
}

/// One child with its own retry budget. A failed child becomes a per-file
/// error entry; the batch keeps going.
async fn run_child_with_retry(
    ctx: WorkflowContext,
    activities: Arc<Activities>,
    request: SingleFileRequest,
) -> SingleFileResult {
    let mut last_err: Option<WorkflowError> = None;
    for attempt in 1..=CHILD_MAX_ATTEMPTS {
        match single_file::run(ctx.clone(), activities.clone(), request.clone()).await {
            Ok(result) => return result,
            Err(WorkflowError::Cancelled) => {
                last_err = Some(WorkflowError::Cancelled);
                break;
            }
            Err(err) => {
                tracing::warn!(
                    workflow_id = %ctx.workflow_id(),
                    file_id = %request.file_id,
                    attempt,
                    error = %err,
                    "child workflow attempt failed"
                );
                last_err = Some(err);
            }
        }
    }
    SingleFileResult::failed(
        request.file_id,
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string()),
    )
}

/// Run the batch; when anything failed, wait, then rerun just the failures.
/// A local primary is swapped for the first remote provider on the second
/// pass.
pub async fn run_with_retry(
    ctx: WorkflowContext,
    activities: Arc<Activities>,
    request: BatchRequest,
) -> Result<BatchResult, WorkflowError> {
    let started = ctx.now();
    let first = run(ctx.clone(), activities.clone(), request.clone()).await?;
    if first.failure_count == 0 {
        return Ok(first);
    }

    tracing::info!(
        batch_id = %request.batch_id,
        failures = first.failure_count,
        "batch had failures, scheduling retry pass"
    );
    ctx.sleep(RETRY_PASS_DELAY).await?;

    let failed_ids: HashSet<&str> = first
        .results
        .iter()
        .filter(|r| r.error.is_some())
        .map(|r| r.file_id.as_str())
        .collect();
    let failed_files: Vec<_> = request
        .files
        .iter()
        .filter(|f| failed_ids.contains(f.file_id.as_str()))
        .cloned()
        .map(|mut file| {
            // Clear per-file overrides so the switched primary applies
            file.provider = None;
            file
        })
        .collect();

    // Registry state is nondeterministic across runs; snapshot the switch
    // decision through the side-effect hook.
    let retry_provider = ctx.side_effect(|| {
        let primary_is_local = request
            .provider
            .as_deref()
            .map(|name| activities.is_local_provider(name))
            .unwrap_or(false);
        if primary_is_local {
            activities.first_remote_provider()
        } else {
            None
        }
    });
    if let Some(switched) = &retry_provider {
        tracing::info!(
            batch_id = %request.batch_id,
            from = request.provider.as_deref().unwrap_or(""),
            to = %switched,
            "switching primary provider for the retry pass"
        );
    }

    let retry_request = BatchRequest {
        batch_id: format!("{}-retry", request.batch_id),
        files: failed_files,
        provider: retry_provider.or_else(|| request.provider.clone()),
        language: request.language.clone(),
        max_parallel: request.max_parallel,
        use_object_store: request.use_object_store,
    };
    let second = run(ctx.clone(), activities, retry_request).await?;

    // Merge: first-pass successes plus everything from the retry pass
    let mut results: Vec<SingleFileResult> = first
        .results
        .into_iter()
        .filter(|r| r.error.is_none())
        .collect();
    results.extend(second.results);
    let success_count = results.iter().filter(|r| r.error.is_none()).count();
    let total_files = first.total_files;

    Ok(BatchResult {
        batch_id: request.batch_id,
        total_files,
        success_count,
        failure_count: total_files - success_count,
        results,
        total_processing_time_ms: (ctx.now() - started).num_milliseconds().max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_env, MockBehavior};
    use crate::workflows::BatchFile;

    fn batch_request(env: &crate::testutil::TestEnv, count: usize, max_parallel: usize) -> BatchRequest {
        let files = (0..count)
            .map(|i| {
                let path = env.dir.path().join(format!("file-{i}.wav"));
                std::fs::write(&path, b"RIFF").unwrap();
                BatchFile {
                    file_id: format!("file-{i}"),
                    file_path: path.to_string_lossy().into_owned(),
                    provider: None,
                }
            })
            .collect();
        BatchRequest {
            batch_id: "batch-1".to_string(),
            files,
            provider: None,
            language: None,
            max_parallel: Some(max_parallel),
            use_object_store: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_parallelism() {
        let env = test_env(vec![(
            "mock",
            MockBehavior::succeed("ok").with_delay(Duration::from_millis(50)),
        )])
        .await;
        let request = batch_request(&env, 7, 3);

        let result = run(env.workflow_ctx("wf-batch"), env.activities.clone(), request)
            .await
            .unwrap();

        assert_eq!(result.total_files, 7);
        assert_eq!(result.success_count, 7);
        assert_eq!(result.failure_count, 0);
        assert_eq!(result.results.len(), 7);

        let mock = env.provider("mock");
        assert_eq!(mock.calls(), 7);
        assert!(
            mock.max_concurrency() <= 3,
            "parallelism exceeded the bound: {}",
            mock.max_concurrency()
        );
        assert_eq!(mock.max_concurrency(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_batch() {
        let env = test_env(vec![
            ("bad", MockBehavior::fail_always("invalid_input", false)),
        ])
        .await;
        let mut request = batch_request(&env, 3, 2);
        // Middle file succeeds through a different path: give it no
        // provider, the default (and only) provider still fails; so expect
        // every file to carry an error but all to be reported.
        request.provider = Some("bad".to_string());

        let result = run(env.workflow_ctx("wf-batch"), env.activities.clone(), request)
            .await
            .unwrap();
        assert_eq!(result.total_files, 3);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.failure_count, 3);
        assert!(result.results.iter().all(|r| r.error.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_retry_budget_recovers_flaky_files() {
        // Each file fails once then succeeds: one child retry absorbs it.
        let env = test_env(vec![(
            "flaky",
            MockBehavior::fail_first(1, "network_error", true),
        )])
        .await;
        let mut request = batch_request(&env, 1, 1);
        request.provider = Some("flaky".to_string());

        let result = run(env.workflow_ctx("wf-batch"), env.activities.clone(), request)
            .await
            .unwrap();
        assert_eq!(result.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_pass_switches_local_to_remote() {
        let env = test_env(vec![
            ("local-whisper", MockBehavior::fail_always("transcription_failed", false)),
            ("openai-api", MockBehavior::succeed("rescued").remote()),
        ])
        .await;
        let mut request = batch_request(&env, 2, 2);
        request.provider = Some("local-whisper".to_string());

        let result = run_with_retry(env.workflow_ctx("wf-batch"), env.activities.clone(), request)
            .await
            .unwrap();

        assert_eq!(result.batch_id, "batch-1");
        assert_eq!(result.total_files, 2);
        assert_eq!(result.success_count, 2, "results: {:?}", result.results);
        assert!(result
            .results
            .iter()
            .all(|r| r.provider == "openai-api" && r.error.is_none()));
        assert!(env.provider("openai-api").calls() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_pass_skipped_when_all_succeed() {
        let env = test_env(vec![("mock", MockBehavior::succeed("ok"))]).await;
        let request = batch_request(&env, 2, 2);

        let result = run_with_retry(env.workflow_ctx("wf-batch"), env.activities.clone(), request)
            .await
            .unwrap();
        assert_eq!(result.success_count, 2);
        assert_eq!(env.provider("mock").calls(), 2);
    }
}
