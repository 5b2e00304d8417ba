use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::dialogue::{TaskId, UserId};

/// What the downstream action executor receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub intent: String,
    pub canonical_entities: Map<String, Value>,
    pub user_id: UserId,
}

impl ActionRequest {
    /// Stable hash of the canonical input, used to spot duplicate executions
    /// in the history log.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(&(&self.intent, &self.canonical_entities, &self.user_id))
            .unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

/// Typed executor result. Branching on this replaces exception matching.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutorOutcome {
    Success {
        message: String,
        #[serde(default)]
        data: Value,
    },
    /// The domain refused a complete and valid request.
    BusinessRejected {
        message: String,
        #[serde(default)]
        error: Value,
    },
    /// Infrastructure failure; the same request may succeed later.
    TransientFailure { message: String },
}

impl ExecutorOutcome {
    pub fn kind(&self) -> ExecutionOutcomeKind {
        match self {
            Self::Success { .. } => ExecutionOutcomeKind::Succeeded,
            Self::BusinessRejected { .. } => ExecutionOutcomeKind::Rejected,
            Self::TransientFailure { .. } => ExecutionOutcomeKind::TransientFailure,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success { message, .. }
            | Self::BusinessRejected { message, .. }
            | Self::TransientFailure { message } => message,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcomeKind {
    Succeeded,
    Rejected,
    TransientFailure,
}

impl ExecutionOutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Rejected => "rejected",
            Self::TransientFailure => "transient_failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "succeeded" => Some(Self::Succeeded),
            "rejected" => Some(Self::Rejected),
            "transient_failure" => Some(Self::TransientFailure),
            _ => None,
        }
    }
}

/// One line of a user's bounded execution log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub intent: String,
    pub canonical_entities: Map<String, Value>,
    pub fingerprint: String,
    pub outcome: ExecutionOutcomeKind,
    pub message: String,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn from_request(
        task_id: TaskId,
        request: &ActionRequest,
        outcome: &ExecutorOutcome,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            user_id: request.user_id.clone(),
            intent: request.intent.clone(),
            canonical_entities: request.canonical_entities.clone(),
            fingerprint: request.fingerprint(),
            outcome: outcome.kind(),
            message: outcome.message().to_string(),
            executed_at,
        }
    }
}
