use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dialogue::problems::ProblemReport;
use crate::domain::dialogue::UserId;
use crate::domain::slot::SlotState;

/// Slots salvaged from a turn that was too broken to open a task with.
/// The next turn from the same user starts from `valid_slots`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingState {
    pub temp_id: String,
    pub user_id: UserId,
    pub intent: String,
    pub valid_slots: SlotState,
    pub problems: ProblemReport,
    pub expires_at: DateTime<Utc>,
}

impl PendingState {
    pub fn new(
        user_id: UserId,
        intent: impl Into<String>,
        valid_slots: SlotState,
        problems: ProblemReport,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            temp_id: format!("pending-{}", Uuid::new_v4()),
            user_id,
            intent: intent.into(),
            valid_slots,
            problems,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
