//! Port to the downstream system that performs the booked action.

use async_trait::async_trait;
use serde_json::json;

use cadence_core::domain::execution::{ActionRequest, ExecutorOutcome};

/// Performs one [`ActionRequest`]. Implementations report failures through
/// [`ExecutorOutcome`] instead of an error type so the trigger can branch on
/// business rejection versus transient failure.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, request: &ActionRequest) -> ExecutorOutcome;
}

/// Accepts every request. Used by the simulator and as the fallback when no
/// executor endpoint is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcknowledgingExecutor;

#[async_trait]
impl ActionExecutor for AcknowledgingExecutor {
    fn name(&self) -> &'static str {
        "acknowledging"
    }

    async fn execute(&self, request: &ActionRequest) -> ExecutorOutcome {
        ExecutorOutcome::Success {
            message: format!("{} accepted", request.intent),
            data: json!({ "fingerprint": request.fingerprint() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use cadence_core::domain::dialogue::UserId;
    use cadence_core::domain::execution::{ActionRequest, ExecutorOutcome};

    use super::{AcknowledgingExecutor, ActionExecutor};

    #[tokio::test]
    async fn acknowledging_executor_accepts_and_echoes_fingerprint() {
        let request = ActionRequest {
            intent: "book_lesson".to_string(),
            canonical_entities: Map::new(),
            user_id: UserId("u-1".to_string()),
        };

        match AcknowledgingExecutor.execute(&request).await {
            ExecutorOutcome::Success { message, data } => {
                assert_eq!(message, "book_lesson accepted");
                assert_eq!(data["fingerprint"], request.fingerprint());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
