use sqlx::{sqlite::SqliteRow, Row};

use cadence_core::domain::dialogue::{TaskId, UserId};
use cadence_core::domain::execution::{ExecutionOutcomeKind, ExecutionRecord};

use super::{format_timestamp, parse_timestamp, ExecutionHistoryRepository, RepositoryError};
use crate::DbPool;

pub struct SqlExecutionHistoryRepository {
    pool: DbPool,
}

impl SqlExecutionHistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ExecutionHistoryRepository for SqlExecutionHistoryRepository {
    async fn append(&self, record: &ExecutionRecord, limit: usize) -> Result<(), RepositoryError> {
        let entities = serde_json::to_string(&record.canonical_entities)
            .map_err(|error| RepositoryError::Decode(format!("encode canonical entities: {error}")))?;
        let keep = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO execution_history (
                user_id,
                task_id,
                intent,
                canonical_entities_json,
                fingerprint,
                outcome,
                message,
                executed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.user_id.0)
        .bind(&record.task_id.0)
        .bind(&record.intent)
        .bind(entities)
        .bind(&record.fingerprint)
        .bind(record.outcome.as_str())
        .bind(&record.message)
        .bind(format_timestamp(record.executed_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM execution_history
             WHERE user_id = ? AND id NOT IN (
                SELECT id FROM execution_history
                WHERE user_id = ?
                ORDER BY executed_at DESC, id DESC
                LIMIT ?
             )",
        )
        .bind(&record.user_id.0)
        .bind(&record.user_id.0)
        .bind(keep)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                user_id,
                task_id,
                intent,
                canonical_entities_json,
                fingerprint,
                outcome,
                message,
                executed_at
             FROM execution_history
             WHERE user_id = ?
             ORDER BY executed_at DESC, id DESC",
        )
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: SqliteRow) -> Result<ExecutionRecord, RepositoryError> {
    let entities: String = row.try_get("canonical_entities_json")?;
    let outcome: String = row.try_get("outcome")?;
    let executed_at: String = row.try_get("executed_at")?;

    Ok(ExecutionRecord {
        task_id: TaskId(row.try_get("task_id")?),
        user_id: UserId(row.try_get("user_id")?),
        intent: row.try_get("intent")?,
        canonical_entities: serde_json::from_str(&entities).map_err(|error| {
            RepositoryError::Decode(format!("invalid canonical entities: {error}"))
        })?,
        fingerprint: row.try_get("fingerprint")?,
        outcome: ExecutionOutcomeKind::parse(&outcome)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown outcome `{outcome}`")))?,
        message: row.try_get("message")?,
        executed_at: parse_timestamp(&executed_at)?,
    })
}
