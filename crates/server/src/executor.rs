//! Action executor that forwards complete requests to a downstream HTTP
//! endpoint.
//!
//! The endpoint answers `{success, message, data | error}`. A reply with
//! `success = false` is a business rejection; transport errors, timeouts and
//! 5xx/429 statuses are transient and the task is rolled back for a retry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use cadence_agent::executor::ActionExecutor;
use cadence_core::domain::execution::{ActionRequest, ExecutorOutcome};

pub struct HttpActionExecutor {
    client: Client,
    endpoint: String,
    auth_token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct ExecutorReply {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Value,
}

impl HttpActionExecutor {
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: endpoint.into(), auth_token })
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, request: &ActionRequest) -> ExecutorOutcome {
        let mut call = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.auth_token {
            call = call.bearer_auth(token.expose_secret());
        }

        let response = match call.send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    event_name = "execution.http.transport_error",
                    intent = %request.intent,
                    timeout = error.is_timeout(),
                    error = %error,
                    "action endpoint unreachable"
                );
                return ExecutorOutcome::TransientFailure {
                    message: format!("action endpoint unreachable: {error}"),
                };
            }
        };

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return ExecutorOutcome::TransientFailure {
                message: format!("action endpoint returned {status}"),
            };
        }

        match response.json::<ExecutorReply>().await {
            Ok(reply) if reply.success => {
                ExecutorOutcome::Success { message: reply.message, data: reply.data }
            }
            Ok(reply) => ExecutorOutcome::BusinessRejected { message: reply.message, error: reply.error },
            Err(error) if status.is_success() => ExecutorOutcome::TransientFailure {
                message: format!("action endpoint sent an unreadable reply: {error}"),
            },
            Err(_) => ExecutorOutcome::BusinessRejected {
                message: format!("action endpoint returned {status}"),
                error: Value::Null,
            },
        }
    }
}
