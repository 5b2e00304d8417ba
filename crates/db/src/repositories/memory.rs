use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use cadence_core::domain::dialogue::{DialogueState, UserId};
use cadence_core::domain::execution::ExecutionRecord;

use super::{DialogueStateRepository, ExecutionHistoryRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryDialogueStateRepository {
    states: RwLock<HashMap<String, DialogueState>>,
}

#[async_trait::async_trait]
impl DialogueStateRepository for InMemoryDialogueStateRepository {
    async fn load(&self, user_id: &UserId) -> Result<Option<DialogueState>, RepositoryError> {
        let states = self.states.read().await;
        Ok(states.get(&user_id.0).cloned())
    }

    async fn save(&self, state: &DialogueState) -> Result<u64, RepositoryError> {
        let mut states = self.states.write().await;
        let stored = states.get(&state.user_id.0).map(|current| current.version).unwrap_or(0);
        if stored != state.version {
            return Err(RepositoryError::VersionConflict {
                user_id: state.user_id.0.clone(),
                expected: state.version,
            });
        }

        let mut next = state.clone();
        next.version = stored + 1;
        states.insert(state.user_id.0.clone(), next);
        Ok(stored + 1)
    }

    async fn list_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserId>, RepositoryError> {
        let states = self.states.read().await;
        let mut idle: Vec<(DateTime<Utc>, UserId)> = states
            .values()
            .filter_map(|state| {
                let task = state.active_task.as_ref()?;
                (task.updated_at < cutoff).then(|| (task.updated_at, state.user_id.clone()))
            })
            .collect();
        idle.sort();
        Ok(idle.into_iter().map(|(_, user_id)| user_id).collect())
    }
}

#[derive(Default)]
pub struct InMemoryExecutionHistoryRepository {
    records: RwLock<HashMap<String, Vec<ExecutionRecord>>>,
}

#[async_trait::async_trait]
impl ExecutionHistoryRepository for InMemoryExecutionHistoryRepository {
    async fn append(&self, record: &ExecutionRecord, limit: usize) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let log = records.entry(record.user_id.0.clone()).or_default();
        log.push(record.clone());
        let overflow = log.len().saturating_sub(limit.max(1));
        log.drain(..overflow);
        Ok(())
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&user_id.0).map(|log| log.iter().rev().cloned().collect()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use cadence_core::domain::dialogue::{ActiveTask, DialogueState, UserId};

    use super::InMemoryDialogueStateRepository;
    use crate::repositories::DialogueStateRepository;

    #[tokio::test]
    async fn in_memory_repository_enforces_versions() {
        let repo = InMemoryDialogueStateRepository::default();
        let now = Utc.with_ymd_and_hms(2030, 3, 1, 10, 0, 0).single().expect("valid timestamp");
        let mut state = DialogueState::new(UserId("u-1".to_string()), now);
        state.active_task = Some(ActiveTask::new("book_lesson", "book_lesson", now));

        assert_eq!(repo.save(&state).await.expect("insert"), 1);
        assert!(repo.save(&state).await.expect_err("stale").is_version_conflict());

        let loaded = repo.load(&state.user_id).await.expect("load").expect("stored");
        assert_eq!(repo.save(&loaded).await.expect("update"), 2);

        let idle = repo.list_idle(now + Duration::minutes(1)).await.expect("idle");
        assert_eq!(idle, vec![UserId("u-1".to_string())]);
        assert!(repo.list_idle(now).await.expect("idle").is_empty());
    }
}
