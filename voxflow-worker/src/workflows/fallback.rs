//! Fallback transcription workflows: walk an ordered provider list, probing
//! health before each attempt and running a child single-file workflow per
//! candidate. The smart variant asks the orchestrator for its top pick and
//! front-loads it.

use super::{single_file, FallbackRequest, FallbackResult, SingleFileRequest};
use crate::activities::{names as activity_names, Activities};
use crate::engine::{ActivityOptions, WorkflowContext, WorkflowError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Per-child execution bound.
const CHILD_EXECUTION_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Pause between candidates after a failed attempt.
const DELAY_BETWEEN_ATTEMPTS: Duration = Duration::from_secs(10);

/// Candidates used when the request does not name any.
pub fn default_providers() -> Vec<String> {
    vec![
        "local-whisper".to_string(),
        "openai-api".to_string(),
        "whisper-server".to_string(),
    ]
}

pub async fn run(
    ctx: WorkflowContext,
    activities: Arc<Activities>,
    request: FallbackRequest,
) -> Result<FallbackResult, WorkflowError> {
    let started = ctx.now();
    let providers = if request.providers.is_empty() {
        default_providers()
    } else {
        request.providers.clone()
    };

    let mut attempted: Vec<String> = Vec::new();
    let mut last_error: Option<String> = None;

    for (index, provider) in providers.iter().enumerate() {
        attempted.push(provider.clone());

        // Health probe, no activity retries
        let status = ctx
            .execute_activity(
                activity_names::GET_PROVIDER_STATUS,
                &ActivityOptions::quick().no_retries(),
                |_actx| {
                    let activities = activities.clone();
                    let name = provider.clone();
                    async move { activities.get_provider_status(&name).await }
                },
            )
            .await;
        match status {
            Ok(status) if status.healthy => {}
            Ok(status) => {
                let reason = status.error.unwrap_or_else(|| "unhealthy".to_string());
                tracing::warn!(provider = %provider, reason = %reason, "skipping unhealthy provider");
                last_error = Some(reason);
                continue;
            }
            Err(WorkflowError::Cancelled) => return Err(WorkflowError::Cancelled),
            Err(err) => {
                tracing::warn!(provider = %provider, error = %err, "provider status probe failed");
                last_error = Some(err.to_string());
                continue;
            }
        }

        let child_id = format!(
            "{}-{}-{}",
            request.file_id,
            provider,
            ctx.now().timestamp()
        );
        let child_request = SingleFileRequest {
            file_id: request.file_id.clone(),
            file_path: request.file_path.clone(),
            provider: Some(provider.clone()),
            language: request.language.clone(),
            output_format: request.output_format,
            options: request.options.clone(),
            use_object_store: request.use_object_store,
        };

        let outcome = tokio::time::timeout(
            CHILD_EXECUTION_TIMEOUT,
            single_file::run(ctx.child(&child_id), activities.clone(), child_request),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => {
                tracing::info!(
                    file_id = %request.file_id,
                    provider = %provider,
                    attempted = ?attempted,
                    "fallback transcription succeeded"
                );
                return Ok(FallbackResult {
                    file_id: request.file_id,
                    location: Some(result.location),
                    successful_provider: Some(provider.clone()),
                    attempted_providers: attempted,
                    processing_time_ms: (ctx.now() - started).num_milliseconds().max(0) as u64,
                    error: None,
                });
            }
            Ok(Err(WorkflowError::Cancelled)) => return Err(WorkflowError::Cancelled),
            Ok(Err(err)) => {
                tracing::warn!(provider = %provider, error = %err, "fallback attempt failed");
                last_error = Some(err.to_string());
            }
            Err(_) => {
                let message = format!(
                    "child workflow exceeded {}s execution timeout",
                    CHILD_EXECUTION_TIMEOUT.as_secs()
                );
                tracing::warn!(provider = %provider, "{message}");
                last_error = Some(message);
            }
        }

        if index + 1 < providers.len() {
            ctx.sleep(DELAY_BETWEEN_ATTEMPTS).await?;
        }
    }

    Ok(FallbackResult {
        file_id: request.file_id,
        location: None,
        successful_provider: None,
        attempted_providers: attempted,
        processing_time_ms: (ctx.now() - started).num_milliseconds().max(0) as u64,
        error: last_error.or_else(|| Some("no providers were attempted".to_string())),
    })
}

/// Ask the orchestrator for its recommended provider and, when it appears
/// in the candidate list, move it to the front before delegating.
pub async fn run_smart(
    ctx: WorkflowContext,
    activities: Arc<Activities>,
    mut request: FallbackRequest,
) -> Result<FallbackResult, WorkflowError> {
    let file_path = PathBuf::from(&request.file_path);
    let recommended = ctx
        .execute_activity(
            activity_names::GET_RECOMMENDED_PROVIDER,
            &ActivityOptions::quick(),
            |_actx| {
                let activities = activities.clone();
                let path = file_path.clone();
                async move { Ok(activities.get_recommended_provider(&path).await) }
            },
        )
        .await?;

    let mut providers = if request.providers.is_empty() {
        default_providers()
    } else {
        request.providers.clone()
    };
    if let Some(name) = recommended {
        if let Some(position) = providers.iter().position(|p| p == &name) {
            let name = providers.remove(position);
            tracing::info!(provider = %name, "front-loading recommended provider");
            providers.insert(0, name);
        }
    }
    request.providers = providers;

    run(ctx, activities, request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_env, MockBehavior};
    use std::collections::HashMap;

    fn request(env: &crate::testutil::TestEnv, providers: Vec<&str>) -> FallbackRequest {
        let input = env.dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        FallbackRequest {
            file_id: "f1".to_string(),
            file_path: input.to_string_lossy().into_owned(),
            providers: providers.into_iter().map(str::to_string).collect(),
            language: Some("en".to_string()),
            output_format: None,
            options: HashMap::new(),
            use_object_store: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_primary_falls_through() {
        let env = test_env(vec![
            ("local", MockBehavior::unhealthy("never used")),
            ("remote", MockBehavior::succeed("world").remote()),
        ])
        .await;
        let req = request(&env, vec!["local", "remote"]);

        let result = run(env.workflow_ctx("wf-fb"), env.activities.clone(), req)
            .await
            .unwrap();

        assert_eq!(result.attempted_providers, vec!["local", "remote"]);
        assert_eq!(result.successful_provider.as_deref(), Some("remote"));
        assert!(result.error.is_none());
        // The unhealthy provider was never asked to transcribe
        assert_eq!(env.provider("local").calls(), 0);

        let location = result.location.unwrap();
        assert_eq!(std::fs::read_to_string(&location).unwrap(), "world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_after_first_provider() {
        let env = test_env(vec![
            ("a", MockBehavior::succeed("from a")),
            ("b", MockBehavior::succeed("from b")),
        ])
        .await;
        let req = request(&env, vec!["a", "b"]);

        let result = run(env.workflow_ctx("wf-fb"), env.activities.clone(), req)
            .await
            .unwrap();
        assert_eq!(result.attempted_providers, vec!["a"]);
        assert_eq!(result.successful_provider.as_deref(), Some("a"));
        assert_eq!(env.provider("b").calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_every_attempt() {
        let env = test_env(vec![
            ("a", MockBehavior::fail_always("network_error", true)),
            ("b", MockBehavior::fail_always("server_error", true)),
        ])
        .await;
        let req = request(&env, vec!["a", "b"]);

        let result = run(env.workflow_ctx("wf-fb"), env.activities.clone(), req)
            .await
            .unwrap();
        assert_eq!(result.attempted_providers, vec!["a", "b"]);
        assert!(result.successful_provider.is_none());
        assert!(result.location.is_none());
        assert!(result.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_list_uses_default_triplet() {
        let env = test_env(vec![("unrelated", MockBehavior::succeed("x"))]).await;
        let req = request(&env, vec![]);

        let result = run(env.workflow_ctx("wf-fb"), env.activities.clone(), req)
            .await
            .unwrap();
        // None of the defaults are registered: all attempted, none succeed
        assert_eq!(
            result.attempted_providers,
            vec!["local-whisper", "openai-api", "whisper-server"]
        );
        assert!(result.successful_provider.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_fallback_front_loads_recommendation() {
        // Registration order makes "fast" the registry default and thus the
        // orchestrator's top pick.
        let env = test_env(vec![
            ("fast", MockBehavior::succeed("fast text")),
            ("slow", MockBehavior::succeed("slow text")),
        ])
        .await;
        let req = request(&env, vec!["slow", "fast"]);

        let result = run_smart(env.workflow_ctx("wf-smart"), env.activities.clone(), req)
            .await
            .unwrap();
        assert_eq!(result.successful_provider.as_deref(), Some("fast"));
        assert_eq!(result.attempted_providers, vec!["fast"]);
        assert_eq!(env.provider("slow").calls(), 0);
    }
}
