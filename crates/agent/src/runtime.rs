//! Per-turn orchestration of the dialogue engine.
//!
//! One call to [`DialogueRuntime::handle_turn`] takes a user's extraction
//! through the whole pipeline under that user's lock:
//!
//! 1. load the stored state and seed the extraction from any pending state
//! 2. resolve the intent's template (unknown intents are reported, not failed)
//! 3. canonicalize alias keys and merge into the active task
//! 4. repair mixed labels and normalize relative dates and informal times
//! 5. detect structural problems and validate
//! 6. either persist and trigger the action, or persist and ask a question
//!
//! A fresh task so broken that it needs a full restate is not persisted; its
//! usable slots are parked in the pending store for the next turn instead.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cadence_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink, TracingAuditSink};
use cadence_core::config::DialogueConfig;
use cadence_core::dialogue::merger::{MergeOutcome, SlotMerger};
use cadence_core::dialogue::problems::{ProblemDetector, ProblemReport};
use cadence_core::dialogue::questions::{Question, QuestionContext, QuestionGenerator, QuestionKind};
use cadence_core::dialogue::temporal::{
    parse_clock_time, resolve_relative_date, TemporalVocabulary, DATE_FORMAT, TIME_FORMAT,
};
use cadence_core::dialogue::validator::{SlotValidator, ValidationResult};
use cadence_core::domain::dialogue::{
    Conflict, DialogueState, Extraction, TaskId, TaskStatus, UserId,
};
use cadence_core::domain::pending::PendingState;
use cadence_core::domain::slot::{is_empty_value, SlotState};
use cadence_core::domain::template::{SlotTemplate, SlotType};
use cadence_core::errors::{ApplicationError, DomainError};
use cadence_core::templates::{TemplateError, TemplateLoader};
use cadence_db::pending::PendingStateStore;
use cadence_db::repositories::{
    DialogueStateRepository, ExecutionHistoryRepository, InMemoryDialogueStateRepository,
    InMemoryExecutionHistoryRepository, RepositoryError,
};

use crate::executor::ActionExecutor;
use crate::locks::UserLocks;
use crate::trigger::{TaskTrigger, TriggerError, TriggerOutcome};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Question {
        task_id: TaskId,
        question: Question,
        completion_score: f64,
        missing_slots: Vec<String>,
        conflicts: Vec<Conflict>,
    },
    Executed {
        task_id: TaskId,
        message: String,
        data: Value,
    },
    Rejected {
        task_id: TaskId,
        message: String,
        error: Value,
    },
    RetryLater {
        task_id: TaskId,
        retry_count: u32,
        message: String,
    },
    /// The turn was parked; the user is asked to restate the request.
    Pending {
        temp_id: String,
        question: Question,
    },
    UnsupportedIntent {
        intent: String,
    },
}

impl TurnOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Question { .. } => "question",
            Self::Executed { .. } => "executed",
            Self::Rejected { .. } => "rejected",
            Self::RetryLater { .. } => "retry_later",
            Self::Pending { .. } => "pending",
            Self::UnsupportedIntent { .. } => "unsupported_intent",
        }
    }

    /// What to say back to the user.
    pub fn reply_text(&self) -> String {
        match self {
            Self::Question { question, .. } | Self::Pending { question, .. } => question.text.clone(),
            Self::Executed { message, .. } => message.clone(),
            Self::Rejected { message, .. } => {
                format!("That didn't go through: {message}. You can change the details and try again.")
            }
            Self::RetryLater { .. } => {
                "The booking service is busy right now. Reply again and I'll retry.".to_string()
            }
            Self::UnsupportedIntent { intent } => format!("I can't help with `{intent}` yet."),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("rollback of task `{task_id}` failed: {message}")]
    RollbackFailed { task_id: TaskId, message: String },
    #[error("task `{task_id}` failed {retry_count} times: {message}")]
    RetriesExhausted { task_id: TaskId, retry_count: u32, message: String },
    #[error("task `{task_id}` executed but the dialogue state was not cleared: {source}")]
    ExecutedNotCleared {
        task_id: TaskId,
        #[source]
        source: RepositoryError,
    },
    #[error(transparent)]
    Trigger(TriggerError),
}

impl RuntimeError {
    pub fn into_application(self) -> ApplicationError {
        match self {
            Self::Domain(error) => ApplicationError::Domain(error),
            Self::Template(error) => ApplicationError::from(error),
            Self::Repository(_)
            | Self::RollbackFailed { .. }
            | Self::ExecutedNotCleared { .. } => ApplicationError::Persistence(self.to_string()),
            Self::RetriesExhausted { .. } | Self::Trigger(_) => {
                ApplicationError::Integration(self.to_string())
            }
        }
    }
}

impl From<TriggerError> for RuntimeError {
    fn from(value: TriggerError) -> Self {
        match value {
            TriggerError::NoActiveTask { user_id } => Self::Domain(DomainError::NoActiveTask { user_id }),
            TriggerError::Template(error) => Self::Template(error),
            TriggerError::Repository(error) => Self::Repository(error),
            TriggerError::Persistence { task_id, source } => Self::ExecutedNotCleared { task_id, source },
            other => Self::Trigger(other),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pending_evicted: usize,
    pub tasks_expired: usize,
    pub locks_pruned: usize,
}

#[derive(Clone)]
pub struct RuntimeStores {
    pub states: Arc<dyn DialogueStateRepository>,
    pub history: Arc<dyn ExecutionHistoryRepository>,
}

impl RuntimeStores {
    pub fn in_memory() -> Self {
        Self {
            states: Arc::new(InMemoryDialogueStateRepository::default()),
            history: Arc::new(InMemoryExecutionHistoryRepository::default()),
        }
    }
}

#[derive(Clone, Debug)]
struct RuntimeSettings {
    task_timeout: Duration,
    pending_ttl: Duration,
    default_utc_offset_minutes: i32,
    max_execution_retries: u32,
}

pub struct DialogueRuntime {
    templates: Arc<TemplateLoader>,
    stores: RuntimeStores,
    pending: PendingStateStore,
    merger: SlotMerger,
    detector: ProblemDetector,
    validator: SlotValidator,
    questions: QuestionGenerator,
    trigger: TaskTrigger,
    locks: UserLocks,
    audit: Arc<dyn AuditSink>,
    settings: RuntimeSettings,
}

impl DialogueRuntime {
    pub fn new(
        config: &DialogueConfig,
        templates: Arc<TemplateLoader>,
        stores: RuntimeStores,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let trigger = TaskTrigger::new(
            templates.clone(),
            stores.states.clone(),
            stores.history.clone(),
            executor,
            config.execution_history_limit,
        );
        Self {
            validator: SlotValidator::with_config(templates.clone(), config.validator_config()),
            templates,
            stores,
            pending: PendingStateStore::with_capacity(config.pending_capacity),
            merger: SlotMerger::new(config.merger_config()),
            detector: ProblemDetector::default(),
            questions: QuestionGenerator::new(config.question_config()),
            trigger,
            locks: UserLocks::default(),
            audit: Arc::new(TracingAuditSink),
            settings: RuntimeSettings {
                task_timeout: config.task_timeout(),
                pending_ttl: config.pending_ttl(),
                default_utc_offset_minutes: config.default_utc_offset_minutes,
                max_execution_retries: config.max_execution_retries,
            },
        }
    }

    /// In-memory stores, for the simulator and tests.
    pub fn in_memory(
        config: &DialogueConfig,
        templates: Arc<TemplateLoader>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self::new(config, templates, RuntimeStores::in_memory(), executor)
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.trigger = self.trigger.with_audit_sink(audit.clone());
        self.audit = audit;
        self
    }

    pub fn with_problem_detector(mut self, detector: ProblemDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn templates(&self) -> &Arc<TemplateLoader> {
        &self.templates
    }

    pub fn stores(&self) -> &RuntimeStores {
        &self.stores
    }

    pub fn pending(&self) -> &PendingStateStore {
        &self.pending
    }

    pub fn executor_name(&self) -> &'static str {
        self.trigger.executor_name()
    }

    pub async fn handle_turn(
        &self,
        user_id: &UserId,
        extraction: Extraction,
    ) -> Result<TurnOutcome, RuntimeError> {
        let correlation_id = format!("turn-{}", Uuid::new_v4());
        self.handle_turn_at(user_id, extraction, Utc::now(), &correlation_id).await
    }

    pub async fn handle_turn_at(
        &self,
        user_id: &UserId,
        mut extraction: Extraction,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<TurnOutcome, RuntimeError> {
        let _guard = self.locks.acquire(user_id).await;

        let current = self
            .stores
            .states
            .load(user_id)
            .await?
            .unwrap_or_else(|| DialogueState::new(user_id.clone(), now));

        // Consumed only once this turn is persisted, so a failed save keeps it.
        let pending = self.pending.peek(user_id, now);
        let resumed = pending.is_some();
        if let Some(pending) = pending {
            if pending.intent == extraction.intent {
                debug!(
                    event_name = "dialogue.pending.resumed",
                    correlation_id,
                    user_id = %user_id,
                    temp_id = %pending.temp_id,
                    "seeding turn from pending state"
                );
                extraction.slot_state = seed_from_pending(pending.valid_slots, extraction.slot_state);
            }
        }

        let template = match self.templates.get_template_by_intent(&extraction.intent) {
            Ok(template) => template,
            Err(error) if error.is_not_found() => {
                info!(
                    event_name = "dialogue.turn.unsupported_intent",
                    correlation_id,
                    user_id = %user_id,
                    intent = %extraction.intent,
                    "no template serves this intent"
                );
                if resumed {
                    self.pending.discard(user_id);
                }
                return Ok(TurnOutcome::UnsupportedIntent { intent: extraction.intent });
            }
            Err(error) => return Err(error.into()),
        };
        extraction.slot_state = canonical_slot_keys(&extraction.slot_state, &template);

        let MergeOutcome { mut state, started_new_task, replaced, conflicts } =
            self.merger.merge_at(&current, &extraction, &template.template_id, now);
        let offset = state.settings.utc_offset_minutes.unwrap_or(self.settings.default_utc_offset_minutes);
        let today = (now + Duration::minutes(i64::from(offset))).date_naive();

        let Some(task) = state.active_task.as_mut() else {
            return Err(DomainError::InvariantViolation("merge produced no active task".to_string()).into());
        };
        let audit = AuditContext::new(user_id.clone(), Some(task.task_id.clone()), correlation_id, "dialogue-runtime");
        if let Some(replaced) = &replaced {
            self.audit.emit(
                audit
                    .event("dialogue.task_replaced", AuditCategory::Dialogue, AuditOutcome::Success)
                    .with_metadata("replaced_task_id", replaced.task_id.0.as_str())
                    .with_metadata("reason", replaced.reason.as_str()),
            );
        }
        for conflict in &conflicts {
            self.audit.emit(
                audit
                    .event("dialogue.slot_conflict", AuditCategory::Dialogue, AuditOutcome::Success)
                    .with_metadata("slot", conflict.slot.as_str())
                    .with_metadata("strategy", conflict.resolution_strategy.as_str()),
            );
        }

        task.slot_state = self.detector.separate_mixed_slots_with(&task.slot_state, &template.fields);
        normalize_temporal(&mut task.slot_state, &template, today, self.detector.vocabulary());

        let problems = self.detector.detect_problems(&task.slot_state, &template);
        let validation = self.validator.validate_template_at(&task.slot_state, &template, now, offset);
        let ready = validation.is_ready() && problems.problem_slots().is_empty();

        task.completion_score = validation.completion_score;
        task.missing_slots = validation.missing_slot_names();
        task.status = if ready { TaskStatus::Complete } else { TaskStatus::Incomplete };
        let task_id = task.task_id.clone();

        info!(
            event_name = "dialogue.turn.merged",
            correlation_id,
            user_id = %user_id,
            task_id = %task_id,
            intent = %template.intent,
            started_new_task,
            conflicts = conflicts.len(),
            completion_score = validation.completion_score,
            ready,
            "turn merged"
        );

        if ready {
            state.version = self.stores.states.save(&state).await?;
            if resumed {
                self.pending.discard(user_id);
            }
            return self.trigger_task(user_id, state, now, correlation_id).await;
        }

        let context = QuestionContext::new(problems.clone(), today).with_history(&task.history);
        let Some(question) = self.questions.generate(&validation, &template, &context) else {
            return Err(DomainError::InvariantViolation("incomplete task left nothing to ask".to_string()).into());
        };

        if started_new_task && question.kind == QuestionKind::Restate {
            let pending = PendingState::new(
                user_id.clone(),
                &template.intent,
                usable_slots(&task.slot_state, &validation, &problems),
                problems,
                now + self.settings.pending_ttl,
            );
            let temp_id = pending.temp_id.clone();
            self.pending.put(pending);
            self.audit.emit(
                AuditContext::new(user_id.clone(), None, correlation_id, "dialogue-runtime")
                    .event("dialogue.pending_stored", AuditCategory::Dialogue, AuditOutcome::Success)
                    .with_metadata("temp_id", temp_id.as_str()),
            );
            return Ok(TurnOutcome::Pending { temp_id, question });
        }

        let completion_score = validation.completion_score;
        let missing_slots = validation.missing_slot_names();
        state.version = self.stores.states.save(&state).await?;
        if resumed {
            self.pending.discard(user_id);
        }

        let mut event = audit
            .event("dialogue.question_asked", AuditCategory::Dialogue, AuditOutcome::Success)
            .with_metadata("kind", question_kind(&question));
        if let Some(slot) = &question.slot {
            event = event.with_metadata("slot", slot.as_str());
        }
        self.audit.emit(event);

        Ok(TurnOutcome::Question { task_id, question, completion_score, missing_slots, conflicts })
    }

    async fn trigger_task(
        &self,
        user_id: &UserId,
        state: DialogueState,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<TurnOutcome, RuntimeError> {
        match self.trigger.execute_at(user_id, state, now, correlation_id).await {
            Ok(TriggerOutcome::Executed { task_id, message, data, .. }) => {
                Ok(TurnOutcome::Executed { task_id, message, data })
            }
            Ok(TriggerOutcome::Rejected { task_id, message, error }) => {
                Ok(TurnOutcome::Rejected { task_id, message, error })
            }
            Err(TriggerError::Transient { task_id, rollback_error: Some(error), .. }) => {
                Err(RuntimeError::RollbackFailed { task_id, message: error })
            }
            Err(TriggerError::Transient { task_id, message, retry_count, .. })
                if retry_count >= self.settings.max_execution_retries =>
            {
                self.abandon_task(user_id, &task_id, now, correlation_id).await?;
                Err(RuntimeError::RetriesExhausted { task_id, retry_count, message })
            }
            Err(TriggerError::Transient { task_id, message, retry_count, .. }) => {
                Ok(TurnOutcome::RetryLater { task_id, retry_count, message })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Clears a task whose executor kept failing so the next turn starts over.
    async fn abandon_task(
        &self,
        user_id: &UserId,
        task_id: &TaskId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<(), RuntimeError> {
        let Some(mut state) = self.stores.states.load(user_id).await? else {
            return Ok(());
        };
        if state.active_task.as_ref().map(|task| &task.task_id) != Some(task_id) {
            return Ok(());
        }
        state.active_task = None;
        state.updated_at = now;
        self.stores.states.save(&state).await?;

        warn!(
            event_name = "dialogue.execution.retries_exhausted",
            correlation_id,
            user_id = %user_id,
            task_id = %task_id,
            "giving up on task after repeated transient failures"
        );
        self.audit.emit(
            AuditContext::new(user_id.clone(), Some(task_id.clone()), correlation_id, "dialogue-runtime")
                .event("execution.retries_exhausted", AuditCategory::Execution, AuditOutcome::Failed),
        );
        Ok(())
    }

    pub async fn cancel(&self, user_id: &UserId) -> Result<TaskId, RuntimeError> {
        let correlation_id = format!("cancel-{}", Uuid::new_v4());
        self.cancel_at(user_id, Utc::now(), &correlation_id).await
    }

    /// Marks the user's active task cancelled and clears it. Any pending
    /// restate state is dropped as well.
    pub async fn cancel_at(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<TaskId, RuntimeError> {
        let _guard = self.locks.acquire(user_id).await;
        self.pending.discard(user_id);

        let no_active_task = || DomainError::NoActiveTask { user_id: user_id.0.clone() };
        let mut state = self.stores.states.load(user_id).await?.ok_or_else(no_active_task)?;
        let task = state.active_task.take().ok_or_else(no_active_task)?;
        if task.status.is_closed() {
            return Err(DomainError::InvalidTaskTransition { from: task.status, to: TaskStatus::Cancelled }.into());
        }
        state.updated_at = now;
        self.stores.states.save(&state).await?;

        info!(
            event_name = "dialogue.task.cancelled",
            correlation_id,
            user_id = %user_id,
            task_id = %task.task_id,
            "task cancelled"
        );
        self.audit.emit(
            AuditContext::new(user_id.clone(), Some(task.task_id.clone()), correlation_id, "dialogue-runtime")
                .event("dialogue.task_cancelled", AuditCategory::Dialogue, AuditOutcome::Success)
                .with_metadata("status", TaskStatus::Cancelled.as_str())
                .with_metadata("previous_status", task.status.as_str()),
        );
        Ok(task.task_id)
    }

    /// Drops expired pending entries and clears tasks idle past the timeout.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, RuntimeError> {
        let pending_evicted = self.pending.sweep(now);
        let idle = self.stores.states.list_idle(now - self.settings.task_timeout).await?;

        let mut tasks_expired = 0;
        for user_id in idle {
            let _guard = self.locks.acquire(&user_id).await;
            let Some(mut state) = self.stores.states.load(&user_id).await? else {
                continue;
            };
            let Some(task) = state.active_task.take() else {
                continue;
            };
            if !task.is_expired(now, self.settings.task_timeout) {
                continue;
            }
            state.updated_at = now;
            match self.stores.states.save(&state).await {
                Ok(_) => {
                    tasks_expired += 1;
                    self.audit.emit(
                        AuditContext::new(user_id.clone(), Some(task.task_id.clone()), "sweeper", "sweeper")
                            .event("dialogue.task_expired", AuditCategory::System, AuditOutcome::Success)
                            .with_metadata("status", task.status.as_str()),
                    );
                }
                Err(error) if error.is_version_conflict() => {
                    debug!(user_id = %user_id, "task touched during sweep; skipping");
                }
                Err(error) => return Err(error.into()),
            }
        }

        let report = SweepReport { pending_evicted, tasks_expired, locks_pruned: self.locks.prune() };
        if report.pending_evicted > 0 || report.tasks_expired > 0 {
            info!(
                event_name = "system.sweep.completed",
                correlation_id = "sweeper",
                pending_evicted = report.pending_evicted,
                tasks_expired = report.tasks_expired,
                locks_pruned = report.locks_pruned,
                "expired dialogue state swept"
            );
        }
        Ok(report)
    }
}

fn question_kind(question: &Question) -> &'static str {
    match question.kind {
        QuestionKind::Restate => "restate",
        QuestionKind::Fix => "fix",
        QuestionKind::Clarify => "clarify",
        QuestionKind::Ask => "ask",
    }
}

/// Pending slots first, then this turn's non-empty values on top.
fn seed_from_pending(pending: SlotState, incoming: SlotState) -> SlotState {
    let mut seeded = pending;
    for (slot, value) in incoming {
        if !is_empty_value(&value) {
            seeded.insert(slot, value);
        }
    }
    seeded
}

/// Rewrites alias keys to slot names. When a turn carries both an alias and
/// the slot's own name, the exact name wins.
fn canonical_slot_keys(slots: &SlotState, template: &SlotTemplate) -> SlotState {
    let mut canonical = SlotState::new();
    for (key, value) in slots {
        match template.resolve_slot_name(key) {
            Some(name) if name != key => {
                canonical.insert(name.to_string(), value.clone());
            }
            _ => {}
        }
    }
    for (key, value) in slots {
        let exact = template.resolve_slot_name(key).map_or(true, |name| name == key);
        if exact && !(is_empty_value(value) && canonical.contains_key(key)) {
            canonical.insert(key.clone(), value.clone());
        }
    }
    canonical
}

/// Relative dates become `YYYY-MM-DD` and informal clock times `HH:MM`.
/// Values that do not parse are left for the detector and validator.
fn normalize_temporal(
    slots: &mut SlotState,
    template: &SlotTemplate,
    today: NaiveDate,
    vocabulary: &TemporalVocabulary,
) {
    for (name, definition) in &template.slots {
        let Some(Value::String(text)) = slots.get(name) else {
            continue;
        };
        let normalized = match definition.slot_type {
            SlotType::Date => resolve_relative_date(text, today).map(|date| date.format(DATE_FORMAT).to_string()),
            SlotType::Time => parse_clock_time(text, vocabulary).map(|time| time.format(TIME_FORMAT).to_string()),
            _ => None,
        };
        if let Some(normalized) = normalized {
            slots.insert(name.clone(), Value::String(normalized));
        }
    }
}

/// Slots worth keeping from a turn that must be restated.
fn usable_slots(slots: &SlotState, validation: &ValidationResult, problems: &ProblemReport) -> SlotState {
    let broken = QuestionGenerator::independent_problems(validation, problems);
    slots
        .iter()
        .filter(|(slot, value)| !broken.contains(slot.as_str()) && !is_empty_value(value))
        .map(|(slot, value)| (slot.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;

    use cadence_core::audit::InMemoryAuditSink;
    use cadence_core::config::DialogueConfig;
    use cadence_core::dialogue::questions::QuestionKind;
    use cadence_core::domain::dialogue::{DialogueState, Extraction, TaskStatus, UserId};
    use cadence_core::domain::execution::{ExecutionOutcomeKind, ExecutorOutcome};
    use cadence_core::domain::slot::SlotState;
    use cadence_core::errors::DomainError;
    use cadence_core::templates::TemplateLoader;
    use cadence_db::repositories::{
        DialogueStateRepository, ExecutionHistoryRepository, InMemoryDialogueStateRepository,
        InMemoryExecutionHistoryRepository, RepositoryError,
    };

    use super::{canonical_slot_keys, DialogueRuntime, RuntimeError, RuntimeStores, TurnOutcome};
    use crate::trigger::tests::ScriptedExecutor;

    /// In-memory states whose next save can be made to fail.
    #[derive(Default)]
    struct FlakyStates {
        inner: InMemoryDialogueStateRepository,
        fail_next_save: AtomicBool,
    }

    #[async_trait]
    impl DialogueStateRepository for FlakyStates {
        async fn load(&self, user_id: &UserId) -> Result<Option<DialogueState>, RepositoryError> {
            self.inner.load(user_id).await
        }

        async fn save(&self, state: &DialogueState) -> Result<u64, RepositoryError> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                return Err(RepositoryError::Decode("disk full".to_string()));
            }
            self.inner.save(state).await
        }

        async fn list_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserId>, RepositoryError> {
            self.inner.list_idle(cutoff).await
        }
    }

    fn now() -> DateTime<Utc> {
        // A Wednesday.
        Utc.with_ymd_and_hms(2030, 5, 1, 9, 0, 0).single().expect("valid timestamp")
    }

    fn slots(pairs: &[(&str, serde_json::Value)]) -> SlotState {
        pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    fn turn(pairs: &[(&str, serde_json::Value)]) -> Extraction {
        Extraction::new("book_lesson", slots(pairs))
    }

    fn runtime(outcomes: Vec<ExecutorOutcome>) -> (DialogueRuntime, Arc<ScriptedExecutor>, InMemoryAuditSink) {
        let templates = Arc::new(TemplateLoader::builtin().expect("builtin templates"));
        let executor = Arc::new(ScriptedExecutor::with_outcomes(outcomes));
        let audit = InMemoryAuditSink::default();
        let runtime = DialogueRuntime::in_memory(&DialogueConfig::default(), templates, executor.clone())
            .with_audit_sink(Arc::new(audit.clone()));
        (runtime, executor, audit)
    }

    #[tokio::test]
    async fn multi_turn_booking_asks_then_executes_once() {
        let (runtime, executor, _) = runtime(Vec::new());
        let user = UserId("u-1".to_string());

        let first = runtime
            .handle_turn_at(&user, turn(&[("label", json!("tomorrow cello lesson"))]), now(), "req-1")
            .await
            .expect("first turn");
        let TurnOutcome::Question { question, missing_slots, .. } = first else {
            panic!("expected a question, got {first:?}");
        };
        assert_eq!(question.slot.as_deref(), Some("time"));
        assert_eq!(missing_slots, vec!["time".to_string()]);

        let stored = runtime.stores().states.load(&user).await.expect("load").expect("stored");
        let task = stored.active_task.expect("active task");
        assert_eq!(task.slot_state["label"], json!("cello lesson"));
        assert_eq!(task.slot_state["date"], json!("2030-05-02"));

        let second = runtime
            .handle_turn_at(&user, turn(&[("time", json!("3pm"))]), now() + Duration::minutes(2), "req-2")
            .await
            .expect("second turn");
        assert!(matches!(second, TurnOutcome::Executed { .. }), "got {second:?}");

        let requests = executor.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].canonical_entities["interval"]["start"], json!("2030-05-02T15:00"));
        assert!(runtime.stores().states.load(&user).await.expect("load").expect("stored").active_task.is_none());

        let log = runtime.stores().history.list_for_user(&user).await.expect("history");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, ExecutionOutcomeKind::Succeeded);
    }

    #[tokio::test]
    async fn vague_time_is_clarified_with_daypart_suggestions() {
        let (runtime, executor, _) = runtime(Vec::new());
        let user = UserId("u-2".to_string());

        let outcome = runtime
            .handle_turn_at(&user, turn(&[("label", json!("tomorrow afternoon cello lesson"))]), now(), "req-1")
            .await
            .expect("turn");
        let TurnOutcome::Question { question, .. } = outcome else {
            panic!("expected a question, got {outcome:?}");
        };
        assert_eq!(question.kind, QuestionKind::Clarify);
        assert_eq!(question.slot.as_deref(), Some("time"));
        assert_eq!(question.suggestions, vec!["14:00", "15:00", "16:00"]);
        assert!(executor.requests().is_empty());
    }

    #[tokio::test]
    async fn broken_first_turn_is_parked_and_seeds_the_next_one() {
        let (runtime, executor, audit) = runtime(Vec::new());
        let user = UserId("u-3".to_string());

        let outcome = runtime
            .handle_turn_at(
                &user,
                turn(&[("label", json!("cello lesson")), ("date", json!("someday")), ("time", json!("evening"))]),
                now(),
                "req-1",
            )
            .await
            .expect("turn");
        let TurnOutcome::Pending { question, .. } = outcome else {
            panic!("expected pending, got {outcome:?}");
        };
        assert_eq!(question.kind, QuestionKind::Restate);
        assert!(runtime.stores().states.load(&user).await.expect("load").is_none());
        assert!(audit.event_types().contains(&"dialogue.pending_stored".to_string()));

        let resumed = runtime
            .handle_turn_at(
                &user,
                turn(&[("date", json!("2030-05-03")), ("time", json!("18:30"))]),
                now() + Duration::minutes(1),
                "req-2",
            )
            .await
            .expect("resumed turn");
        assert!(matches!(resumed, TurnOutcome::Executed { .. }), "got {resumed:?}");
        assert_eq!(executor.requests()[0].canonical_entities["label"], json!("cello lesson"));
        assert!(runtime.pending().is_empty());
    }

    #[tokio::test]
    async fn pending_state_survives_a_failed_save() {
        let templates = Arc::new(TemplateLoader::builtin().expect("builtin templates"));
        let states = Arc::new(FlakyStates::default());
        let stores = RuntimeStores {
            states: states.clone(),
            history: Arc::new(InMemoryExecutionHistoryRepository::default()),
        };
        let executor = Arc::new(ScriptedExecutor::with_outcomes(Vec::new()));
        let runtime = DialogueRuntime::new(&DialogueConfig::default(), templates, stores, executor.clone());
        let user = UserId("u-9".to_string());

        let parked = runtime
            .handle_turn_at(
                &user,
                turn(&[("label", json!("cello lesson")), ("date", json!("someday")), ("time", json!("evening"))]),
                now(),
                "req-1",
            )
            .await
            .expect("turn");
        assert!(matches!(parked, TurnOutcome::Pending { .. }), "got {parked:?}");

        let resume = || turn(&[("date", json!("2030-05-03")), ("time", json!("18:30"))]);
        states.fail_next_save.store(true, Ordering::SeqCst);
        let error = runtime
            .handle_turn_at(&user, resume(), now() + Duration::minutes(1), "req-2")
            .await
            .expect_err("save fails");
        assert!(matches!(error, RuntimeError::Repository(_)), "got {error:?}");
        assert_eq!(runtime.pending().len(), 1);
        assert!(executor.requests().is_empty());

        let retried = runtime
            .handle_turn_at(&user, resume(), now() + Duration::minutes(2), "req-3")
            .await
            .expect("retried turn");
        assert!(matches!(retried, TurnOutcome::Executed { .. }), "got {retried:?}");
        assert_eq!(executor.requests()[0].canonical_entities["label"], json!("cello lesson"));
        assert!(runtime.pending().is_empty());
    }

    #[tokio::test]
    async fn completion_score_never_drops_across_additive_turns() {
        let (runtime, executor, _) = runtime(Vec::new());
        let user = UserId("u-10".to_string());
        let turns = [
            ("label", json!("cello lesson")),
            ("person", json!("Mia")),
            ("repeat", json!({ "pattern": "weekly" })),
            ("date", json!("2030-05-03")),
            ("repeat_until", json!("2030-07-26")),
            ("location", json!("Room 4")),
        ];

        let mut previous = 0.0;
        for (minute, (slot, value)) in turns.into_iter().enumerate() {
            let outcome = runtime
                .handle_turn_at(&user, turn(&[(slot, value)]), now() + Duration::minutes(minute as i64), "req")
                .await
                .expect("turn");
            let TurnOutcome::Question { completion_score, .. } = outcome else {
                panic!("expected a question after `{slot}`, got {outcome:?}");
            };
            assert!(
                completion_score >= previous,
                "adding `{slot}` lowered the score from {previous} to {completion_score}"
            );
            previous = completion_score;
        }
        assert!(previous > 0.53, "optional fields should count, got {previous}");
        assert!(executor.requests().is_empty());
    }

    #[tokio::test]
    async fn business_rejection_keeps_task_open_for_changes() {
        let (runtime, executor, _) = runtime(vec![ExecutorOutcome::BusinessRejected {
            message: "instructor unavailable".to_string(),
            error: json!({ "code": "UNAVAILABLE" }),
        }]);
        let user = UserId("u-4".to_string());
        let booking = turn(&[("label", json!("cello")), ("date", json!("2030-05-03")), ("time", json!("10:00"))]);

        let outcome = runtime.handle_turn_at(&user, booking, now(), "req-1").await.expect("turn");
        assert!(matches!(outcome, TurnOutcome::Rejected { .. }), "got {outcome:?}");
        let task = runtime.stores().states.load(&user).await.expect("load").expect("stored").active_task.expect("task");
        assert_eq!(task.status, TaskStatus::Failed);

        let retry = runtime
            .handle_turn_at(&user, turn(&[("time", json!("11:00"))]), now() + Duration::minutes(1), "req-2")
            .await
            .expect("second turn");
        assert!(matches!(retry, TurnOutcome::Executed { .. }), "got {retry:?}");
        assert_eq!(executor.requests()[1].canonical_entities["interval"]["start"], json!("2030-05-03T11:00"));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_the_limit() {
        let failure = || ExecutorOutcome::TransientFailure { message: "gateway timeout".to_string() };
        let (runtime, executor, _) = runtime(vec![failure(), failure(), failure()]);
        let user = UserId("u-5".to_string());
        let booking = || turn(&[("label", json!("cello")), ("date", json!("2030-05-03")), ("time", json!("10:00"))]);

        for attempt in 1..=2 {
            let outcome = runtime
                .handle_turn_at(&user, booking(), now() + Duration::minutes(attempt), "req")
                .await
                .expect("turn");
            assert!(
                matches!(outcome, TurnOutcome::RetryLater { retry_count, .. } if retry_count == attempt as u32),
                "got {outcome:?}"
            );
        }

        let error = runtime
            .handle_turn_at(&user, booking(), now() + Duration::minutes(3), "req")
            .await
            .expect_err("retries exhausted");
        assert!(matches!(error, RuntimeError::RetriesExhausted { retry_count: 3, .. }));
        assert_eq!(executor.requests().len(), 3);
        assert!(runtime.stores().states.load(&user).await.expect("load").expect("stored").active_task.is_none());
    }

    #[tokio::test]
    async fn unsupported_intent_is_reported_without_touching_state() {
        let (runtime, _, _) = runtime(Vec::new());
        let user = UserId("u-6".to_string());

        let outcome = runtime
            .handle_turn_at(&user, Extraction::new("order_pizza", SlotState::new()), now(), "req-1")
            .await
            .expect("turn");
        assert_eq!(outcome, TurnOutcome::UnsupportedIntent { intent: "order_pizza".to_string() });
        assert!(runtime.stores().states.load(&user).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn cancel_clears_task_and_reports_nothing_left() {
        let (runtime, _, audit) = runtime(Vec::new());
        let user = UserId("u-7".to_string());
        runtime
            .handle_turn_at(&user, turn(&[("label", json!("cello"))]), now(), "req-1")
            .await
            .expect("turn");

        runtime.cancel_at(&user, now(), "req-2").await.expect("cancel");
        assert!(audit.event_types().contains(&"dialogue.task_cancelled".to_string()));
        let error = runtime.cancel_at(&user, now(), "req-3").await.expect_err("nothing to cancel");
        assert!(matches!(error, RuntimeError::Domain(DomainError::NoActiveTask { .. })));
    }

    #[tokio::test]
    async fn sweep_expires_idle_tasks() {
        let (runtime, _, audit) = runtime(Vec::new());
        let idle = UserId("idle".to_string());
        let active = UserId("active".to_string());
        runtime.handle_turn_at(&idle, turn(&[("label", json!("cello"))]), now(), "req-1").await.expect("turn");
        runtime
            .handle_turn_at(&active, turn(&[("label", json!("piano"))]), now() + Duration::minutes(20), "req-2")
            .await
            .expect("turn");

        let report = runtime.sweep(now() + Duration::minutes(31)).await.expect("sweep");
        assert_eq!(report.tasks_expired, 1);
        assert!(runtime.stores().states.load(&idle).await.expect("load").expect("stored").active_task.is_none());
        assert!(runtime.stores().states.load(&active).await.expect("load").expect("stored").active_task.is_some());
        assert!(audit.event_types().contains(&"dialogue.task_expired".to_string()));
    }

    #[tokio::test]
    async fn intent_switch_discards_previous_slots() {
        let (runtime, _, audit) = runtime(Vec::new());
        let user = UserId("u-8".to_string());
        runtime
            .handle_turn_at(&user, turn(&[("label", json!("cello")), ("date", json!("2030-05-03"))]), now(), "req-1")
            .await
            .expect("turn");

        let outcome = runtime
            .handle_turn_at(
                &user,
                Extraction::new("cancel_lesson", slots(&[("label", json!("piano"))])),
                now() + Duration::minutes(1),
                "req-2",
            )
            .await
            .expect("turn");
        assert!(matches!(outcome, TurnOutcome::Question { .. }), "got {outcome:?}");

        let task = runtime.stores().states.load(&user).await.expect("load").expect("stored").active_task.expect("task");
        assert_eq!(task.intent, "cancel_lesson");
        assert!(!task.slot_state.contains_key("date"));
        assert!(audit.event_types().contains(&"dialogue.task_replaced".to_string()));
    }

    #[test]
    fn alias_keys_resolve_and_exact_names_win() {
        let loader = TemplateLoader::builtin().expect("builtin templates");
        let template = loader.get_template_by_intent("book_lesson").expect("template");

        let canonical = canonical_slot_keys(
            &slots(&[("course", json!("viola")), ("label", json!("cello")), ("start_time", json!("15:00")), ("mood", json!("happy"))]),
            &template,
        );
        assert_eq!(canonical["label"], json!("cello"));
        assert_eq!(canonical["time"], json!("15:00"));
        assert_eq!(canonical["mood"], json!("happy"));
        assert!(!canonical.contains_key("course"));
    }
}
