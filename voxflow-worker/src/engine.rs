//! # Workflow Runtime Module
//!
//! The in-process durable execution layer the workflows run on. It gives
//! workflow code the primitives the rest of this crate is written against:
//!
//! - **Activities**: every external effect goes through
//!   [`WorkflowContext::execute_activity`], which applies a per-attempt
//!   start-to-close timeout, a heartbeat-staleness watchdog and a
//!   policy-driven retry loop with exponential backoff and jitter
//! - **Sleep and clock**: workflows take time from
//!   [`WorkflowContext::now`] and wait with the cancellation-aware
//!   [`WorkflowContext::sleep`]
//! - **Side effects**: filesystem writes and other nondeterminism are
//!   funneled through [`WorkflowContext::side_effect`]
//! - **Child workflows**: [`WorkflowContext::child`] derives a context
//!   whose cancellation token is linked to the parent
//! - **Runtime**: a named task queue holding the registered workflow
//!   handlers, dispatching JSON inputs to them
//!
//! Cancellation is cooperative: cancelling the root token aborts every
//! in-flight sleep, activity attempt and child workflow.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use voxflow_providers_sdk::TranscriptionError;

/// Backoff shape for activity retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            maximum_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts.max(1);
        self
    }

    /// Delay before the next attempt, with up to 10% jitter.
    fn delay_for(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1);
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(exponent as i32);
        let capped = base.min(self.maximum_interval.as_secs_f64());
        let jitter = 1.0 + rand::Rng::gen_range(&mut rand::thread_rng(), 0.0..0.1);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Options for one activity invocation.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(30 * 60),
            heartbeat_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    /// Short options for quick registry/status queries.
    pub fn quick() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn no_retries(mut self) -> Self {
        self.retry_policy = RetryPolicy::no_retries();
        self
    }
}

/// Failures surfaced by the runtime.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error("activity {activity} timed out after {seconds}s")]
    ActivityTimeout { activity: String, seconds: u64 },

    #[error("activity {activity} missed its heartbeat")]
    HeartbeatMissed { activity: String },

    #[error("workflow cancelled")]
    Cancelled,

    #[error(transparent)]
    Transcription(#[from] TranscriptionError),

    #[error("activity {activity} failed: {message}")]
    ActivityFailed {
        activity: String,
        message: String,
        retryable: bool,
    },

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("invalid workflow payload: {0}")]
    Payload(String),
}

impl WorkflowError {
    pub fn retryable(&self) -> bool {
        match self {
            Self::ActivityTimeout { .. } | Self::HeartbeatMissed { .. } => true,
            Self::Cancelled | Self::UnknownWorkflow(_) | Self::Payload(_) => false,
            Self::Transcription(err) => err.retryable,
            Self::ActivityFailed { retryable, .. } => *retryable,
        }
    }
}

/// Handle an activity receives: heartbeats and cancellation.
#[derive(Clone)]
pub struct ActivityContext {
    heartbeat: watch::Sender<tokio::time::Instant>,
    cancel: CancellationToken,
}

impl ActivityContext {
    /// A context not bound to any workflow: heartbeats go nowhere and
    /// cancellation never fires. For direct activity invocation and tests.
    pub fn detached() -> Self {
        let (heartbeat, _) = watch::channel(tokio::time::Instant::now());
        Self {
            heartbeat,
            cancel: CancellationToken::new(),
        }
    }

    /// Record liveness; long-running activities must call this at least
    /// every half heartbeat-timeout.
    pub fn record_heartbeat(&self) {
        let _ = self.heartbeat.send(tokio::time::Instant::now());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// The context a workflow function runs with.
#[derive(Clone)]
pub struct WorkflowContext {
    workflow_id: String,
    run_id: uuid::Uuid,
    task_queue: String,
    cancel: CancellationToken,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>, task_queue: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: uuid::Uuid::new_v4(),
            task_queue: task_queue.into(),
            cancel,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// The workflow clock.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancellation-aware sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(WorkflowError::Cancelled),
        }
    }

    /// Run a nondeterministic computation (filesystem writes, random ids).
    /// Workflow code never touches the outside world except through
    /// activities and this hook.
    pub fn side_effect<T>(&self, f: impl FnOnce() -> T) -> T {
        f()
    }

    /// Derive a child workflow context whose cancellation follows this one.
    pub fn child(&self, child_workflow_id: impl Into<String>) -> WorkflowContext {
        WorkflowContext {
            workflow_id: child_workflow_id.into(),
            run_id: uuid::Uuid::new_v4(),
            task_queue: self.task_queue.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    /// Execute an activity under `options`: per-attempt start-to-close
    /// timeout, heartbeat watchdog, and retries per the policy. Retries
    /// stop early on non-retryable failures and on cancellation.
    pub async fn execute_activity<T, F, Fut>(
        &self,
        activity: &str,
        options: &ActivityOptions,
        run: F,
    ) -> Result<T, WorkflowError>
    where
        F: Fn(ActivityContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkflowError>>,
    {
        let policy = &options.retry_policy;
        let mut last_err: Option<WorkflowError> = None;

        for attempt in 1..=policy.maximum_attempts.max(1) {
            if self.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            if attempt > 1 {
                self.sleep(policy.delay_for(attempt - 1)).await?;
            }

            match self.run_attempt(activity, options, &run).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::debug!(
                        activity,
                        workflow_id = %self.workflow_id,
                        attempt,
                        max_attempts = policy.maximum_attempts,
                        error = %err,
                        "activity attempt failed"
                    );
                    let retryable = err.retryable();
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(WorkflowError::Cancelled))
    }

    async fn run_attempt<T, F, Fut>(
        &self,
        activity: &str,
        options: &ActivityOptions,
        run: &F,
    ) -> Result<T, WorkflowError>
    where
        F: Fn(ActivityContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkflowError>>,
    {
        let (heartbeat_tx, heartbeat_rx) = watch::channel(tokio::time::Instant::now());
        let context = ActivityContext {
            heartbeat: heartbeat_tx,
            cancel: self.cancel.child_token(),
        };

        tokio::select! {
            result = tokio::time::timeout(options.start_to_close_timeout, run(context)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(WorkflowError::ActivityTimeout {
                        activity: activity.to_string(),
                        seconds: options.start_to_close_timeout.as_secs(),
                    }),
                }
            }
            _ = heartbeat_watchdog(heartbeat_rx, options.heartbeat_timeout) => {
                Err(WorkflowError::HeartbeatMissed {
                    activity: activity.to_string(),
                })
            }
            _ = self.cancel.cancelled() => Err(WorkflowError::Cancelled),
        }
    }
}

/// Resolves once no heartbeat has been recorded for `timeout`. The initial
/// stamp counts as a heartbeat, so short activities never trip it.
async fn heartbeat_watchdog(mut last: watch::Receiver<tokio::time::Instant>, timeout: Duration) {
    loop {
        let stamp = *last.borrow();
        tokio::select! {
            _ = tokio::time::sleep_until(stamp + timeout) => {
                if *last.borrow() == stamp {
                    return;
                }
            }
            changed = last.changed() => {
                if changed.is_err() {
                    // Activity finished and dropped its handle; never fire.
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

type WorkflowHandler = Arc<
    dyn Fn(
            WorkflowContext,
            serde_json::Value,
        ) -> futures::future::BoxFuture<'static, Result<serde_json::Value, WorkflowError>>
        + Send
        + Sync,
>;

/// The worker-side runtime: a named task queue with registered workflow
/// handlers.
pub struct Runtime {
    task_queue: String,
    worker_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
    cancel: CancellationToken,
    handlers: RwLock<HashMap<String, WorkflowHandler>>,
}

impl Runtime {
    pub fn new(task_queue: impl Into<String>) -> Self {
        let task_queue = task_queue.into();
        Self {
            worker_id: format!("{}@{}", task_queue, uuid::Uuid::new_v4()),
            task_queue,
            started_at: chrono::Utc::now(),
            cancel: CancellationToken::new(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        (chrono::Utc::now() - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Root cancellation token; child workflow tokens derive from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the runtime: every in-flight workflow sees cancellation.
    pub fn shutdown(&self) {
        tracing::info!(worker_id = %self.worker_id, "shutting down workflow runtime");
        self.cancel.cancel();
    }

    /// Register a typed workflow function under its fixed name.
    pub fn register_workflow<Req, Res, F, Fut>(&self, name: &str, handler: F)
    where
        Req: serde::de::DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(WorkflowContext, Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Res, WorkflowError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: WorkflowHandler = Arc::new(move |ctx, input| {
            let handler = handler.clone();
            Box::pin(async move {
                let request: Req = serde_json::from_value(input)
                    .map_err(|e| WorkflowError::Payload(e.to_string()))?;
                let response = (handler.as_ref())(ctx, request).await?;
                serde_json::to_value(response).map_err(|e| WorkflowError::Payload(e.to_string()))
            })
        });
        self.handlers
            .write()
            .expect("handler table poisoned")
            .insert(name.to_string(), boxed);
        tracing::debug!(workflow = name, task_queue = %self.task_queue, "registered workflow");
    }

    pub fn registered_workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .expect("handler table poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Dispatch a workflow by name with a JSON input.
    pub async fn start_workflow(
        &self,
        name: &str,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError> {
        let handler = {
            let handlers = self.handlers.read().expect("handler table poisoned");
            handlers
                .get(name)
                .cloned()
                .ok_or_else(|| WorkflowError::UnknownWorkflow(name.to_string()))?
        };
        let context = WorkflowContext::new(workflow_id, &self.task_queue, self.cancel.child_token());
        tracing::info!(workflow = name, workflow_id, "starting workflow");
        (handler.as_ref())(context, input).await
    }
}
