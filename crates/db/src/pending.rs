//! Short-lived store for turns that were too broken to open a task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use cadence_core::cache::{Cache, LruCache};
use cadence_core::domain::dialogue::UserId;
use cadence_core::domain::pending::PendingState;

#[derive(Clone)]
pub struct PendingStateStore {
    cache: Arc<dyn Cache<UserId, PendingState>>,
}

impl PendingStateStore {
    pub fn new(cache: Arc<dyn Cache<UserId, PendingState>>) -> Self {
        Self { cache }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Arc::new(LruCache::new(capacity)))
    }

    /// Replaces any pending state the user already had.
    pub fn put(&self, pending: PendingState) {
        let expires_at = pending.expires_at;
        debug!(user_id = %pending.user_id, temp_id = %pending.temp_id, "storing pending state");
        self.cache.set(pending.user_id.clone(), pending, expires_at);
    }

    pub fn peek(&self, user_id: &UserId, now: DateTime<Utc>) -> Option<PendingState> {
        self.cache.get(user_id, now)
    }

    /// Removes the user's entry once the turn it seeded has been persisted.
    pub fn discard(&self, user_id: &UserId) -> bool {
        self.cache.evict(user_id).is_some()
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.cache.sweep(now)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use cadence_core::dialogue::problems::ProblemReport;
    use cadence_core::domain::dialogue::UserId;
    use cadence_core::domain::pending::PendingState;
    use cadence_core::domain::slot::SlotState;

    use super::PendingStateStore;

    fn pending(user: &str, expires_at: chrono::DateTime<Utc>) -> PendingState {
        let mut slots = SlotState::new();
        slots.insert("label".to_string(), json!("cello"));
        PendingState::new(UserId(user.to_string()), "book_lesson", slots, ProblemReport::default(), expires_at)
    }

    #[test]
    fn peek_keeps_pending_state_until_discarded() {
        let store = PendingStateStore::with_capacity(4);
        let now = Utc.with_ymd_and_hms(2030, 3, 1, 10, 0, 0).single().expect("valid timestamp");
        let user = UserId("u-1".to_string());
        store.put(pending("u-1", now + Duration::minutes(10)));

        let seen = store.peek(&user, now).expect("pending state");
        assert_eq!(seen.valid_slots["label"], json!("cello"));
        assert!(store.peek(&user, now).is_some());

        assert!(store.discard(&user));
        assert!(store.peek(&user, now).is_none());
        assert!(!store.discard(&user));
    }

    #[test]
    fn expired_pending_state_is_ignored_and_swept() {
        let store = PendingStateStore::with_capacity(4);
        let now = Utc.with_ymd_and_hms(2030, 3, 1, 10, 0, 0).single().expect("valid timestamp");
        store.put(pending("u-1", now + Duration::minutes(10)));
        store.put(pending("u-2", now + Duration::minutes(1)));

        assert!(store.peek(&UserId("u-2".to_string()), now + Duration::minutes(1)).is_none());
        assert_eq!(store.sweep(now + Duration::minutes(10)), 1);
        assert!(store.is_empty());
    }
}
