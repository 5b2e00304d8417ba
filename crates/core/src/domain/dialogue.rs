use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::slot::SlotState;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Incomplete,
    Complete,
    Completed,
    Cancelled,
    Failed,
    ExecutionFailed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::ExecutionFailed => "execution_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "incomplete" => Some(Self::Incomplete),
            "complete" => Some(Self::Complete),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            "execution_failed" => Some(Self::ExecutionFailed),
            _ => None,
        }
    }

    /// A closed task never absorbs another turn; the next extraction starts over.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Complete | Self::Completed | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    Overwrite,
    KeepExisting,
    Union,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::KeepExisting => "keep_existing",
            Self::Union => "union",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "overwrite" => Some(Self::Overwrite),
            "keep_existing" => Some(Self::KeepExisting),
            "union" => Some(Self::Union),
            _ => None,
        }
    }
}

/// A field that already held a value and received a different one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub slot: String,
    pub current_value: Value,
    pub new_value: Value,
    pub resolved_value: Value,
    pub confidence: f64,
    pub resolution_strategy: ConflictStrategy,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub turn: u32,
    pub raw_text: String,
    pub extracted: SlotState,
    pub conflicts: Vec<Conflict>,
    pub strategy: ConflictStrategy,
    pub confidence: f64,
    pub started_new_task: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub intent: String,
    pub template_id: String,
    pub status: TaskStatus,
    pub slot_state: SlotState,
    pub completion_score: f64,
    pub missing_slots: Vec<String>,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActiveTask {
    pub fn new(intent: impl Into<String>, template_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: TaskId::generate(),
            intent: intent.into(),
            template_id: template_id.into(),
            status: TaskStatus::Incomplete,
            slot_state: SlotState::new(),
            completion_score: 0.0,
            missing_slots: Vec::new(),
            history: Vec::new(),
            retry_count: 0,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Strictly greater than the timeout: a task idle for exactly the timeout is still live.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now.signed_duration_since(self.updated_at) > timeout
    }

    pub fn next_turn(&self) -> u32 {
        self.history.last().map(|entry| entry.turn + 1).unwrap_or(1)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub conflict_strategy: Option<ConflictStrategy>,
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

/// The per-user persisted document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DialogueState {
    pub user_id: UserId,
    pub active_task: Option<ActiveTask>,
    #[serde(default)]
    pub settings: UserSettings,
    /// Revision of the stored document; `0` means never written.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DialogueState {
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            active_task: None,
            settings: UserSettings::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The active task when it can still absorb turns at `now`.
    pub fn live_task(&self, now: DateTime<Utc>, timeout: Duration) -> Option<&ActiveTask> {
        self.active_task
            .as_ref()
            .filter(|task| !task.status.is_closed() && !task.is_expired(now, timeout))
    }
}

/// One turn's output from the upstream entity extractor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub intent: String,
    #[serde(default, alias = "slotState")]
    pub slot_state: SlotState,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, alias = "rawText")]
    pub raw_text: String,
}

fn default_confidence() -> f64 {
    1.0
}

impl Extraction {
    pub fn new(intent: impl Into<String>, slot_state: SlotState) -> Self {
        Self { intent: intent.into(), slot_state, confidence: 1.0, raw_text: String::new() }
    }

    pub fn with_raw_text(mut self, raw_text: impl Into<String>) -> Self {
        self.raw_text = raw_text.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}
