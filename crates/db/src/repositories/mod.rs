use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use cadence_core::domain::dialogue::{DialogueState, UserId};
use cadence_core::domain::execution::ExecutionRecord;

pub mod dialogue_state;
pub mod execution_history;
pub mod memory;

pub use dialogue_state::SqlDialogueStateRepository;
pub use execution_history::SqlExecutionHistoryRepository;
pub use memory::{InMemoryDialogueStateRepository, InMemoryExecutionHistoryRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("dialogue state for `{user_id}` changed since version {expected}")]
    VersionConflict { user_id: String, expected: u64 },
}

impl RepositoryError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Per-user dialogue documents with optimistic concurrency.
///
/// `save` writes the document only when the stored version still equals
/// `state.version` (`0` meaning "not stored yet") and returns the new version.
#[async_trait]
pub trait DialogueStateRepository: Send + Sync {
    async fn load(&self, user_id: &UserId) -> Result<Option<DialogueState>, RepositoryError>;

    async fn save(&self, state: &DialogueState) -> Result<u64, RepositoryError>;

    /// Users holding a task last touched strictly before `cutoff`.
    async fn list_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserId>, RepositoryError>;
}

#[async_trait]
pub trait ExecutionHistoryRepository: Send + Sync {
    /// Appends `record` and prunes the user's log down to the newest `limit` entries.
    async fn append(&self, record: &ExecutionRecord, limit: usize) -> Result<(), RepositoryError>;

    /// Newest first.
    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<ExecutionRecord>, RepositoryError>;
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid timestamp `{value}`: {error}")))
}
