//! Bounded-retry HTTP calls to node services.
//!
//! Every outbound node call goes through [`RetryingClient`], which applies
//! one [`RetryPolicy`] and folds the many ways a call can go wrong into a
//! [`FailureKind`].

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::RetrySettings;

/// Attempts, per-attempt timeout and the first backoff delay.
///
/// The delay doubles after each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            timeout: Duration::from_millis(settings.timeout_ms),
            backoff: Duration::from_millis(settings.backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << shift)
    }
}

/// Why a node call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureKind {
    #[error("timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("rejected by node: {0}")]
    Rejected(String),

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl FailureKind {
    /// Client errors and garbage bodies will not improve on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) | Self::Rejected(_) => true,
            Self::Status(code) => *code >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Tagged result of a node call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Decoded JSON body (`Null` for an empty body).
    Success(Value),
    Failure(FailureKind),
}

impl CallOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self) -> Result<Value, FailureKind> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(kind) => Err(kind),
        }
    }
}

/// `reqwest::Client` plus a retry policy.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    /// Builds a client whose connect timeout matches the policy timeout.
    ///
    /// # Errors
    ///
    /// The TLS backend failed to initialise.
    pub fn new(policy: RetryPolicy) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(policy.timeout)
            .build()?;
        Ok(Self::with_client(http, policy))
    }

    pub fn with_client(http: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { http, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn get(&self, url: &str) -> CallOutcome {
        self.execute(Method::GET, url, None).await
    }

    pub async fn post(&self, url: &str, body: Option<&Value>) -> CallOutcome {
        self.execute(Method::POST, url, body).await
    }

    async fn execute(&self, method: Method, url: &str, body: Option<&Value>) -> CallOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            let mut request = self.http.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let kind = match self.attempt(request).await {
                Ok(value) => {
                    debug!(%method, url, attempt, "Node call succeeded");
                    return CallOutcome::Success(value);
                }
                Err(kind) => kind,
            };

            if !kind.is_retryable() || attempt >= max_attempts {
                warn!(%method, url, attempt, error = %kind, "Node call failed");
                return CallOutcome::Failure(kind);
            }

            let delay = self.policy.delay_after(attempt);
            debug!(
                %method,
                url,
                attempt,
                error = %kind,
                delay_ms = delay.as_millis() as u64,
                "Node call failed, retrying"
            );
            sleep(delay).await;
        }
    }

    async fn attempt(&self, request: reqwest::RequestBuilder) -> Result<Value, FailureKind> {
        let response = match timeout(self.policy.timeout, request.send()).await {
            Err(_) => return Err(FailureKind::Timeout),
            Ok(Err(e)) if e.is_timeout() => return Err(FailureKind::Timeout),
            Ok(Err(e)) => return Err(FailureKind::Transport(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FailureKind::Status(status.as_u16()));
        }

        let text = match timeout(self.policy.timeout, response.text()).await {
            Err(_) => return Err(FailureKind::Timeout),
            Ok(Err(e)) => return Err(FailureKind::Transport(e.to_string())),
            Ok(Ok(text)) => text,
        };
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        let value: Value =
            serde_json::from_str(&text).map_err(|e| FailureKind::Decode(e.to_string()))?;
        if value.get("status").and_then(Value::as_str) == Some("failure") {
            let reason = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("node reported failure");
            return Err(FailureKind::Rejected(reason.to_string()));
        }
        Ok(value)
    }
}
