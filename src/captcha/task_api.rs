//! Create/poll task protocol shared by the supported vendors
//!
//! ```text
//! POST /createTask     {clientKey, softId|appId, task:{type, websiteURL, websiteKey, isInvisible}}
//!                   -> {errorId, taskId}
//! POST /getTaskResult  {clientKey, taskId}
//!                   -> {errorId, status: processing|ready, solution:{gRecaptchaResponse|token}}
//! POST /getBalance     {clientKey} -> {errorId, balance}
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CaptchaError, CaptchaSolver, CaptchaTask, KeyValidation, ProviderKind, TaskStatus};
use crate::config::{CaptchaConfig, ProviderConfig};
use crate::metrics;

/// Bounded poll loop parameters
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Sleep before each poll
    pub interval: Duration,

    /// Poll round trips before giving up
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 6,
        }
    }
}

/// One poll round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    Pending,
    Ready(String),
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest<'a> {
    client_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    soft_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_id: Option<&'a str>,
    task: TaskPayload<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskPayload<'a> {
    #[serde(rename = "type")]
    task_type: &'a str,
    #[serde(rename = "websiteURL")]
    website_url: &'a str,
    website_key: &'a str,
    is_invisible: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultRequest<'a> {
    client_key: &'a str,
    task_id: &'a serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceRequest<'a> {
    client_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorResponse {
    #[serde(default)]
    error_id: i64,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<Solution>,
    #[serde(default)]
    balance: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Solution {
    #[serde(default)]
    g_recaptcha_response: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

impl VendorResponse {
    fn error(&self, creating: bool) -> Option<CaptchaError> {
        if self.error_id == 0 {
            return None;
        }
        let code = self.error_code.as_deref().unwrap_or("ERROR_UNKNOWN");
        let description = self.error_description.as_deref().unwrap_or("");
        Some(CaptchaError::from_vendor_code(code, description, creating))
    }
}

// ============================================================================
// Solver
// ============================================================================

/// Task-protocol client for one vendor credential
pub struct TaskApiSolver {
    kind: ProviderKind,
    client: Client,
    base_url: String,
    api_key: String,
    app_id: Option<String>,
    poll: PollSettings,
}

impl std::fmt::Debug for TaskApiSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskApiSolver")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl TaskApiSolver {
    pub fn new(
        kind: ProviderKind,
        api_key: impl Into<String>,
        poll: PollSettings,
        timeout: Duration,
    ) -> Result<Self, CaptchaError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CaptchaError::Network(e.to_string()))?;

        Ok(Self {
            kind,
            client,
            base_url: kind.default_base_url().to_string(),
            api_key: api_key.into(),
            app_id: None,
            poll,
        })
    }

    /// Build from an operator credential entry
    pub fn from_config(provider: &ProviderConfig, captcha: &CaptchaConfig) -> Result<Self, CaptchaError> {
        let mut solver = Self::new(
            provider.kind,
            provider.api_key.clone(),
            PollSettings {
                interval: captcha.poll_interval(),
                max_attempts: captcha.max_poll_attempts,
            },
            Duration::from_secs(captcha.request_timeout_secs),
        )?;
        if let Some(base_url) = &provider.base_url {
            solver = solver.with_base_url(base_url);
        }
        solver.app_id = provider.app_id.clone();
        Ok(solver)
    }

    /// Point at a different API root (for testing)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Step 1: submit the challenge
    pub async fn create_task(&self, site_key: &str, page_url: &str) -> Result<CaptchaTask, CaptchaError> {
        let (soft_id, app_id) = match self.kind {
            ProviderKind::AntiCaptcha => (self.app_id.as_deref().and_then(|id| id.parse().ok()), None),
            ProviderKind::CapSolver => (None, self.app_id.as_deref()),
        };

        let request = CreateTaskRequest {
            client_key: &self.api_key,
            soft_id,
            app_id,
            task: TaskPayload {
                task_type: self.kind.task_type(),
                website_url: page_url,
                website_key: site_key,
                is_invisible: true,
            },
        };

        let response = self.post("createTask", &request).await?;
        if let Some(err) = response.error(true) {
            return Err(err);
        }

        let task_id = match response.task_id {
            Some(serde_json::Value::String(id)) if !id.is_empty() => id,
            Some(serde_json::Value::Number(id)) => id.to_string(),
            _ => return Err(CaptchaError::MalformedResponse("missing taskId".to_string())),
        };

        debug!(provider = %self.kind, task_id = %task_id, "Captcha task created");
        Ok(CaptchaTask::new(self.kind, task_id))
    }

    /// Step 2: one poll round trip
    pub async fn poll_task(&self, task: &mut CaptchaTask) -> Result<TaskPoll, CaptchaError> {
        let task_id = task_id_value(&task.task_id);
        let request = TaskResultRequest {
            client_key: &self.api_key,
            task_id: &task_id,
        };

        task.polls += 1;
        let response = self.post("getTaskResult", &request).await?;
        if let Some(err) = response.error(false) {
            task.status = TaskStatus::Failed;
            return Err(err);
        }

        match response.status.as_deref() {
            Some("ready") => {
                let token = response
                    .solution
                    .and_then(|s| s.g_recaptcha_response.or(s.token))
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        CaptchaError::MalformedResponse("ready without a token".to_string())
                    })?;
                task.status = TaskStatus::Ready;
                task.token = Some(token.clone());
                Ok(TaskPoll::Ready(token))
            }
            Some("failed") => {
                task.status = TaskStatus::Failed;
                Err(CaptchaError::VendorError {
                    code: "TASK_FAILED".to_string(),
                    description: "vendor marked the task failed".to_string(),
                })
            }
            _ => Ok(TaskPoll::Pending),
        }
    }

    async fn post<T: Serialize>(&self, method: &str, body: &T) -> Result<VendorResponse, CaptchaError> {
        let url = format!("{}/{}", self.base_url, method);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CaptchaError::Network(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CaptchaError::Network(format!("{method} returned HTTP {status}")));
        }

        response
            .json::<VendorResponse>()
            .await
            .map_err(|e| CaptchaError::MalformedResponse(e.without_url().to_string()))
    }
}

/// Numeric ids go back as numbers, anything else as a string
fn task_id_value(task_id: &str) -> serde_json::Value {
    task_id
        .parse::<u64>()
        .map(serde_json::Value::from)
        .unwrap_or_else(|_| serde_json::Value::String(task_id.to_string()))
}

#[async_trait]
impl CaptchaSolver for TaskApiSolver {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    async fn solve(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        let timer = metrics::Timer::captcha(self.kind.as_str());
        let result = self.solve_inner(site_key, page_url).await;

        let outcome = match &result {
            Ok(_) => "ready",
            Err(e) => e.label(),
        };
        metrics::record_captcha_solve(self.kind.as_str(), outcome);
        drop(timer);
        result
    }

    async fn validate_key(&self) -> Result<KeyValidation, CaptchaError> {
        let response = self
            .post("getBalance", &BalanceRequest {
                client_key: &self.api_key,
            })
            .await?;

        match response.error(false) {
            None => {
                let balance = response.balance.unwrap_or(0.0);
                info!(provider = %self.kind, balance = balance, "Solver balance checked");
                Ok(KeyValidation {
                    valid: true,
                    balance,
                })
            }
            Some(CaptchaError::InvalidCredential { code }) => {
                warn!(provider = %self.kind, code = %code, "Solver credential rejected");
                Ok(KeyValidation {
                    valid: false,
                    balance: 0.0,
                })
            }
            Some(CaptchaError::InsufficientBalance { .. }) => Ok(KeyValidation {
                valid: true,
                balance: 0.0,
            }),
            Some(other) => Err(other),
        }
    }
}

impl TaskApiSolver {
    async fn solve_inner(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        let mut task = self.create_task(site_key, page_url).await?;

        for attempt in 1..=self.poll.max_attempts {
            tokio::time::sleep(self.poll.interval).await;

            match self.poll_task(&mut task).await? {
                TaskPoll::Ready(token) => {
                    debug!(
                        provider = %self.kind,
                        task_id = %task.task_id,
                        attempt = attempt,
                        "Captcha solved"
                    );
                    return Ok(token);
                }
                TaskPoll::Pending => {
                    debug!(task_id = %task.task_id, attempt = attempt, "Captcha still pending");
                }
            }
        }

        warn!(
            provider = %self.kind,
            task_id = %task.task_id,
            attempts = self.poll.max_attempts,
            "Captcha polling exhausted"
        );
        Err(CaptchaError::PollingTimeout {
            attempts: self.poll.max_attempts,
        })
    }
}
