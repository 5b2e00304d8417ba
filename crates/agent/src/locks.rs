use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use cadence_core::domain::dialogue::UserId;

/// One async mutex per user; turns for the same user run one at a time while
/// different users proceed concurrently.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub async fn acquire(&self, user_id: &UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(user_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops lock entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use cadence_core::domain::dialogue::UserId;

    use super::UserLocks;

    #[tokio::test]
    async fn same_user_waits_and_other_users_do_not() {
        let locks = Arc::new(UserLocks::default());
        let alice = UserId("alice".to_string());
        let guard = locks.acquire(&alice).await;

        let contender = {
            let locks = locks.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&alice).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        let _bob = tokio::time::timeout(Duration::from_millis(200), locks.acquire(&UserId("bob".to_string())))
            .await
            .expect("other user is not blocked");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender finishes")
            .expect("join");
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = UserLocks::default();
        let held = locks.acquire(&UserId("held".to_string())).await;
        drop(locks.acquire(&UserId("idle".to_string())).await);

        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
