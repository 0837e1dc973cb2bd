//! Agent service client.
//!
//! Wraps the remote autonomous coding agent's session API: create a session
//! from a prompt, poll its status, cancel it. The remote status vocabulary is
//! open-ended; anything unrecognized parses as `RemoteStatus::Unknown` and is
//! treated as a transient condition upstream, so new remote statuses degrade
//! safely rather than failing records.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AdapterError;
use crate::session::Phase;

/// Status reported by the agent service for a remote session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    /// Session is actively working
    Working,
    /// Session is waiting on something (user input, environment)
    Blocked,
    /// Session finished; the service uses both spellings
    Finished,
    Completed,
    /// Session failed on the remote side
    Failed,
    Error,
    /// Session was cancelled on the remote side
    Cancelled,
    /// Anything the service says that we do not recognize
    #[serde(untagged)]
    Unknown(String),
}

impl RemoteStatus {
    /// The remote session completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finished | Self::Completed)
    }

    /// The remote session itself failed (a fatal condition locally).
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }

    /// The remote session is still in flight.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Working | Self::Blocked)
    }
}

impl FromStr for RemoteStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "working" => Self::Working,
            "blocked" => Self::Blocked,
            "finished" => Self::Finished,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Working => f.write_str("working"),
            Self::Blocked => f.write_str("blocked"),
            Self::Finished => f.write_str("finished"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::Error => f.write_str("error"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// One poll's worth of remote session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: RemoteStatus,
    /// Confidence score from the agent's structured output, if present.
    pub confidence: Option<f64>,
    /// Free-form summary from the agent's structured output.
    pub summary: Option<String>,
    /// Pull request URL, once the agent has opened one.
    pub change_request: Option<String>,
}

impl StatusReport {
    pub fn in_progress() -> Self {
        Self {
            status: RemoteStatus::Working,
            confidence: None,
            summary: None,
            change_request: None,
        }
    }
}

/// Result of creating a remote session.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub remote_session_id: String,
    pub url: Option<String>,
}

/// Abstraction over the remote agent service for testability.
/// Real implementation: `HttpAgentClient`. Tests use scripted doubles.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn create_session(
        &self,
        phase: Phase,
        title: &str,
        prompt: &str,
    ) -> Result<CreatedSession, AdapterError>;

    async fn poll_status(&self, remote_session_id: &str) -> Result<StatusReport, AdapterError>;

    async fn cancel_session(&self, remote_session_id: &str) -> Result<(), AdapterError>;
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    prompt: &'a str,
    title: &'a str,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session_id: String,
    url: Option<String>,
}

/// Session detail payload (subset of fields we care about).
#[derive(Debug, Deserialize)]
struct SessionDetailResponse {
    status_enum: Option<String>,
    structured_output: Option<serde_json::Value>,
    pull_request: Option<PullRequestRef>,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    url: Option<String>,
}

impl SessionDetailResponse {
    fn into_report(self) -> StatusReport {
        let status = self
            .status_enum
            .as_deref()
            .unwrap_or("working")
            .parse()
            .unwrap_or(RemoteStatus::Working);

        let output = self.structured_output.unwrap_or(serde_json::Value::Null);
        let confidence = output.get("confidence_score").and_then(|v| v.as_f64());
        let summary = output
            .get("result_summary")
            .or_else(|| output.get("issue_summary"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        // The PR can surface in either place; prefer the session-level field.
        let change_request = self
            .pull_request
            .and_then(|pr| pr.url)
            .or_else(|| {
                output
                    .get("pull_request_url")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            });

        StatusReport {
            status,
            confidence,
            summary,
            change_request,
        }
    }
}

// ── HTTP client ──────────────────────────────────────────────────────

/// HTTP implementation of `AgentClient` against a Devin-style session API.
pub struct HttpAgentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
        resp.headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = Self::retry_after(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Transient {
                message: format!("agent service rate limited: {body}"),
                retry_after,
            });
        }
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, &body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn create_session(
        &self,
        phase: Phase,
        title: &str,
        prompt: &str,
    ) -> Result<CreatedSession, AdapterError> {
        let payload = CreateSessionRequest {
            prompt,
            title,
            tags: vec!["conductor".to_string(), phase.to_string()],
        };
        let resp = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body: CreateSessionResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::transient(format!("malformed create response: {e}")))?;
        Ok(CreatedSession {
            remote_session_id: body.session_id,
            url: body.url,
        })
    }

    async fn poll_status(&self, remote_session_id: &str) -> Result<StatusReport, AdapterError> {
        let resp = self
            .http
            .get(format!("{}/sessions/{}", self.base_url, remote_session_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body: SessionDetailResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::transient(format!("malformed session detail: {e}")))?;
        Ok(body.into_report())
    }

    async fn cancel_session(&self, remote_session_id: &str) -> Result<(), AdapterError> {
        let resp = self
            .http
            .post(format!(
                "{}/sessions/{}/cancel",
                self.base_url, remote_session_id
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
