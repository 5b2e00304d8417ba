//! Exactly-once hand-off of a complete task to the action executor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use cadence_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink, TracingAuditSink};
use cadence_core::dialogue::canonical::canonical_entities;
use cadence_core::domain::dialogue::{DialogueState, TaskId, TaskStatus, UserId};
use cadence_core::domain::execution::{ActionRequest, ExecutionRecord, ExecutorOutcome};
use cadence_core::templates::{TemplateError, TemplateLoader};
use cadence_db::repositories::{DialogueStateRepository, ExecutionHistoryRepository, RepositoryError};

use crate::executor::ActionExecutor;

pub const LAST_ERROR_KEY: &str = "last_error";
pub const LAST_OUTCOME_KEY: &str = "last_outcome";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// The action ran and the active task was cleared.
    Executed { task_id: TaskId, request: ActionRequest, message: String, data: Value },
    /// The executor refused the request; the task stays open as `failed`.
    Rejected { task_id: TaskId, message: String, error: Value },
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("no active task for user `{user_id}`")]
    NoActiveTask { user_id: String },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("executor failed transiently for task `{task_id}` (attempt {retry_count}): {message}")]
    Transient {
        task_id: TaskId,
        message: String,
        retry_count: u32,
        rollback_attempted: bool,
        rollback_error: Option<String>,
    },
    /// The action already ran; it must not be retried.
    #[error("task `{task_id}` executed but its state could not be written: {source}")]
    Persistence {
        task_id: TaskId,
        #[source]
        source: RepositoryError,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct TaskTrigger {
    templates: Arc<TemplateLoader>,
    states: Arc<dyn DialogueStateRepository>,
    history: Arc<dyn ExecutionHistoryRepository>,
    executor: Arc<dyn ActionExecutor>,
    audit: Arc<dyn AuditSink>,
    history_limit: usize,
}

impl TaskTrigger {
    pub fn new(
        templates: Arc<TemplateLoader>,
        states: Arc<dyn DialogueStateRepository>,
        history: Arc<dyn ExecutionHistoryRepository>,
        executor: Arc<dyn ActionExecutor>,
        history_limit: usize,
    ) -> Self {
        Self { templates, states, history, executor, audit: Arc::new(TracingAuditSink), history_limit }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    pub async fn execute(
        &self,
        user_id: &UserId,
        state: DialogueState,
    ) -> Result<TriggerOutcome, TriggerError> {
        self.execute_at(user_id, state, Utc::now(), "trigger").await
    }

    /// Runs the executor once for the user's active task. `state` must be
    /// the stored document (its `version` is the compare-and-swap base).
    pub async fn execute_at(
        &self,
        user_id: &UserId,
        state: DialogueState,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<TriggerOutcome, TriggerError> {
        let Some(task) = state.active_task.clone() else {
            return Err(TriggerError::NoActiveTask { user_id: user_id.0.clone() });
        };
        let template = self.templates.get_template(&task.template_id)?;
        let request = ActionRequest {
            intent: task.intent.clone(),
            canonical_entities: canonical_entities(&task.slot_state, &template),
            user_id: user_id.clone(),
        };
        let audit = AuditContext::new(user_id.clone(), Some(task.task_id.clone()), correlation_id, "task-trigger");

        info!(
            event_name = "dialogue.execution.started",
            correlation_id,
            user_id = %user_id,
            task_id = %task.task_id,
            executor = self.executor.name(),
            fingerprint = %request.fingerprint(),
            "executing complete task"
        );
        let outcome = self.executor.execute(&request).await;
        let record = ExecutionRecord::from_request(task.task_id.clone(), &request, &outcome, now);

        match outcome {
            ExecutorOutcome::Success { message, data } => {
                let mut cleared = state;
                cleared.active_task = None;
                cleared.updated_at = now;
                self.states
                    .save(&cleared)
                    .await
                    .map_err(|source| TriggerError::Persistence { task_id: task.task_id.clone(), source })?;
                self.append_history(&record, correlation_id).await;

                self.audit.emit(
                    audit
                        .event("execution.succeeded", AuditCategory::Execution, AuditOutcome::Success)
                        .with_metadata("intent", task.intent.as_str())
                        .with_metadata("status", TaskStatus::Completed.as_str()),
                );
                Ok(TriggerOutcome::Executed { task_id: task.task_id, request, message, data })
            }
            ExecutorOutcome::BusinessRejected { message, error } => {
                let mut rejected = state;
                if let Some(active) = rejected.active_task.as_mut() {
                    active.status = TaskStatus::Failed;
                    active.metadata.insert(LAST_ERROR_KEY.to_string(), message.clone());
                    active.metadata.insert(LAST_OUTCOME_KEY.to_string(), record.outcome.as_str().to_string());
                    active.updated_at = now;
                }
                rejected.updated_at = now;
                self.states.save(&rejected).await?;
                self.append_history(&record, correlation_id).await;

                self.audit.emit(
                    audit
                        .event("execution.rejected", AuditCategory::Execution, AuditOutcome::Rejected)
                        .with_metadata("message", message.as_str()),
                );
                Ok(TriggerOutcome::Rejected { task_id: task.task_id, message, error })
            }
            ExecutorOutcome::TransientFailure { message } => {
                let retry_count = task.retry_count + 1;
                let mut rolled_back = state;
                if let Some(active) = rolled_back.active_task.as_mut() {
                    active.status = TaskStatus::ExecutionFailed;
                    active.retry_count = retry_count;
                    active.metadata.insert(LAST_ERROR_KEY.to_string(), message.clone());
                    active.metadata.insert(LAST_OUTCOME_KEY.to_string(), record.outcome.as_str().to_string());
                    active.updated_at = now;
                }
                rolled_back.updated_at = now;

                let rollback_error = match self.states.save(&rolled_back).await {
                    Ok(_) => None,
                    Err(error) => {
                        warn!(
                            event_name = "dialogue.execution.rollback_failed",
                            correlation_id,
                            user_id = %user_id,
                            task_id = %task.task_id,
                            error = %error,
                            "could not roll back task after transient failure"
                        );
                        Some(error.to_string())
                    }
                };
                self.append_history(&record, correlation_id).await;

                let mut event = audit
                    .event("execution.rolled_back", AuditCategory::Execution, AuditOutcome::Failed)
                    .with_metadata("message", message.as_str())
                    .with_metadata("retry_count", retry_count.to_string());
                if let Some(error) = &rollback_error {
                    event = event.with_metadata("rollback_error", error.as_str());
                }
                self.audit.emit(event);

                Err(TriggerError::Transient {
                    task_id: task.task_id,
                    message,
                    retry_count,
                    rollback_attempted: true,
                    rollback_error,
                })
            }
        }
    }

    /// The history log is best effort: a failed append never undoes an executed action.
    async fn append_history(&self, record: &ExecutionRecord, correlation_id: &str) {
        if let Err(error) = self.history.append(record, self.history_limit).await {
            warn!(
                event_name = "dialogue.execution.history_append_failed",
                correlation_id,
                user_id = %record.user_id,
                task_id = %record.task_id,
                error = %error,
                "could not append execution record"
            );
        }
    }
}
