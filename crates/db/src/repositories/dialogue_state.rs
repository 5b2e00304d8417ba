use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use cadence_core::domain::dialogue::{DialogueState, UserId};

use super::{format_timestamp, DialogueStateRepository, RepositoryError};
use crate::DbPool;

/// Stores each user's [`DialogueState`] as one JSON document. The task
/// columns are denormalized copies used by the idle sweep.
pub struct SqlDialogueStateRepository {
    pool: DbPool,
}

impl SqlDialogueStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

struct TaskColumns {
    task_id: Option<String>,
    intent: Option<String>,
    task_status: Option<String>,
    task_updated_at: Option<String>,
}

impl TaskColumns {
    fn of(state: &DialogueState) -> Self {
        match &state.active_task {
            Some(task) => Self {
                task_id: Some(task.task_id.0.clone()),
                intent: Some(task.intent.clone()),
                task_status: Some(task.status.as_str().to_string()),
                task_updated_at: Some(format_timestamp(task.updated_at)),
            },
            None => Self { task_id: None, intent: None, task_status: None, task_updated_at: None },
        }
    }
}

#[async_trait::async_trait]
impl DialogueStateRepository for SqlDialogueStateRepository {
    async fn load(&self, user_id: &UserId) -> Result<Option<DialogueState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT document_json, version
             FROM dialogue_state
             WHERE user_id = ?",
        )
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(state_from_row).transpose()
    }

    async fn save(&self, state: &DialogueState) -> Result<u64, RepositoryError> {
        let expected = state.version;
        let next = expected + 1;
        let mut stored = state.clone();
        stored.version = next;

        let document = serde_json::to_string(&stored)
            .map_err(|error| RepositoryError::Decode(format!("encode dialogue state: {error}")))?;
        let columns = TaskColumns::of(state);
        let version = i64::try_from(next)
            .map_err(|_| RepositoryError::Decode(format!("version {next} exceeds i64")))?;

        let result = if expected == 0 {
            sqlx::query(
                "INSERT INTO dialogue_state (
                    user_id,
                    task_id,
                    intent,
                    task_status,
                    task_updated_at,
                    document_json,
                    version,
                    created_at,
                    updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id) DO NOTHING",
            )
            .bind(&state.user_id.0)
            .bind(&columns.task_id)
            .bind(&columns.intent)
            .bind(&columns.task_status)
            .bind(&columns.task_updated_at)
            .bind(&document)
            .bind(version)
            .bind(format_timestamp(state.created_at))
            .bind(format_timestamp(state.updated_at))
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE dialogue_state SET
                    task_id = ?,
                    intent = ?,
                    task_status = ?,
                    task_updated_at = ?,
                    document_json = ?,
                    version = ?,
                    updated_at = ?
                 WHERE user_id = ? AND version = ?",
            )
            .bind(&columns.task_id)
            .bind(&columns.intent)
            .bind(&columns.task_status)
            .bind(&columns.task_updated_at)
            .bind(&document)
            .bind(version)
            .bind(format_timestamp(state.updated_at))
            .bind(&state.user_id.0)
            .bind(version - 1)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(RepositoryError::VersionConflict {
                user_id: state.user_id.0.clone(),
                expected,
            });
        }
        Ok(next)
    }

    async fn list_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserId>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT user_id
             FROM dialogue_state
             WHERE task_id IS NOT NULL AND task_updated_at < ?
             ORDER BY task_updated_at ASC",
        )
        .bind(format_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(UserId(row.try_get::<String, _>("user_id")?)))
            .collect()
    }
}

fn state_from_row(row: SqliteRow) -> Result<DialogueState, RepositoryError> {
    let document: String = row.try_get("document_json")?;
    let version: i64 = row.try_get("version")?;

    let mut state: DialogueState = serde_json::from_str(&document)
        .map_err(|error| RepositoryError::Decode(format!("invalid dialogue document: {error}")))?;
    state.version = u64::try_from(version)
        .map_err(|_| RepositoryError::Decode(format!("invalid version `{version}`")))?;
    Ok(state)
}
