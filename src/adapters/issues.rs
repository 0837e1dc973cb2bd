//! Issue tracker client.
//!
//! Wraps the GitHub REST API for the pieces the orchestrator needs: listing
//! open issues, reading one issue with recent comments for prompt context,
//! detecting or opening change requests, and reading combined check status.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AdapterError;
use crate::session::IssueRef;

const GITHUB_API: &str = "https://api.github.com";
/// How many trailing comments to include in prompt context.
const COMMENT_CONTEXT_LIMIT: usize = 10;

/// Combined status of a change request's checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksStatus {
    Pending,
    Passing,
    Failing,
}

impl ChecksStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passing => "passing",
            Self::Failing => "failing",
        }
    }
}

impl fmt::Display for ChecksStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "passing" => Ok(Self::Passing),
            "failing" => Ok(Self::Failing),
            _ => Err(format!("Invalid checks status: {}", s)),
        }
    }
}

/// Issue list entry for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSummary {
    pub issue_ref: IssueRef,
    pub title: String,
    pub labels: Vec<String>,
    pub updated_at: String,
}

/// Full issue context used to build session prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueDetails {
    pub issue_ref: IssueRef,
    pub title: String,
    pub body: String,
    /// Recent comments as "author: body" lines, oldest first.
    pub comments: Vec<String>,
    pub html_url: String,
}

/// Abstraction over the issue tracker for testability.
/// Real implementation: `GitHubIssueSource`. Tests use scripted doubles.
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// List open issues, pull requests excluded.
    async fn list_issues(&self) -> Result<Vec<IssueSummary>, AdapterError>;

    /// Fetch one issue with recent comment context.
    async fn fetch_issue(&self, issue: &IssueRef) -> Result<IssueDetails, AdapterError>;

    /// Find an open change request whose head branch references the issue.
    async fn find_change_request(&self, issue: &IssueRef)
        -> Result<Option<String>, AdapterError>;

    /// Open a change request from an existing branch. Returns its URL.
    async fn open_change_request(
        &self,
        issue: &IssueRef,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String, AdapterError>;

    /// Combined check status for a change request URL.
    async fn get_checks_status(&self, change_request: &str)
        -> Result<ChecksStatus, AdapterError>;
}

// ── Wire types (subset of fields we care about) ──────────────────────

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: i64,
    title: String,
    body: Option<String>,
    labels: Vec<GitHubLabel>,
    updated_at: String,
    html_url: String,
    /// Pull requests also come through the issues endpoint; filter them out.
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitHubComment {
    user: Option<GitHubUser>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubPull {
    html_url: String,
    head: GitHubPullHead,
}

#[derive(Debug, Deserialize)]
struct GitHubPullHead {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct CombinedStatusResponse {
    state: String,
}

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedPull {
    html_url: String,
}

// ── HTTP client ──────────────────────────────────────────────────────

/// GitHub-backed `IssueSource` for a single repository.
pub struct GitHubIssueSource {
    http: reqwest::Client,
    owner: String,
    repo: String,
    token: String,
    base_branch: String,
}

impl GitHubIssueSource {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
            base_branch: "main".to_string(),
        }
    }

    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = branch.into();
        self
    }

    /// The tracker name used in `IssueRef`s produced by this source.
    pub fn tracker(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{GITHUB_API}/repos/{}/{}{path}", self.owner, self.repo)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, AdapterError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "conductor")
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, &body));
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::transient(format!("malformed GitHub response: {e}")))
    }
}

#[async_trait]
impl IssueSource for GitHubIssueSource {
    async fn list_issues(&self) -> Result<Vec<IssueSummary>, AdapterError> {
        let issues: Vec<GitHubIssue> =
            self.get_json(self.repo_url("/issues?state=open")).await?;
        let tracker = self.tracker();
        Ok(issues
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(|i| IssueSummary {
                issue_ref: IssueRef::new(tracker.clone(), i.number),
                title: i.title,
                labels: i.labels.into_iter().map(|l| l.name).collect(),
                updated_at: i.updated_at,
            })
            .collect())
    }

    async fn fetch_issue(&self, issue: &IssueRef) -> Result<IssueDetails, AdapterError> {
        let detail: GitHubIssue = self
            .get_json(self.repo_url(&format!("/issues/{}", issue.number)))
            .await?;
        let comments: Vec<GitHubComment> = self
            .get_json(self.repo_url(&format!("/issues/{}/comments", issue.number)))
            .await?;
        let start = comments.len().saturating_sub(COMMENT_CONTEXT_LIMIT);
        let comments = comments[start..]
            .iter()
            .map(|c| {
                format!(
                    "{}: {}",
                    c.user.as_ref().map_or("unknown", |u| u.login.as_str()),
                    c.body.as_deref().unwrap_or("")
                )
            })
            .collect();
        Ok(IssueDetails {
            issue_ref: issue.clone(),
            title: detail.title,
            body: detail.body.unwrap_or_default(),
            comments,
            html_url: detail.html_url,
        })
    }

    async fn find_change_request(
        &self,
        issue: &IssueRef,
    ) -> Result<Option<String>, AdapterError> {
        let pulls: Vec<GitHubPull> = self.get_json(self.repo_url("/pulls?state=open")).await?;
        let needle = format!("issue-{}", issue.number);
        Ok(pulls
            .into_iter()
            .find(|pr| pr.head.branch.contains(&needle))
            .map(|pr| pr.html_url))
    }

    async fn open_change_request(
        &self,
        issue: &IssueRef,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String, AdapterError> {
        let _ = issue;
        let payload = CreatePullRequest {
            title,
            head: branch,
            base: &self.base_branch,
            body,
        };
        let resp = self
            .http
            .post(self.repo_url("/pulls"))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "conductor")
            .json(&payload)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, &text));
        }
        let created: CreatedPull = resp
            .json()
            .await
            .map_err(|e| AdapterError::transient(format!("malformed GitHub response: {e}")))?;
        Ok(created.html_url)
    }

    async fn get_checks_status(
        &self,
        change_request: &str,
    ) -> Result<ChecksStatus, AdapterError> {
        // PR URL → head ref via the pulls endpoint, then the combined status.
        let number = change_request
            .rsplit('/')
            .next()
            .and_then(|n| n.parse::<i64>().ok())
            .ok_or_else(|| {
                AdapterError::fatal(format!("unparseable change request URL: {change_request}"))
            })?;
        #[derive(Deserialize)]
        struct PullDetail {
            head: PullHead,
        }
        #[derive(Deserialize)]
        struct PullHead {
            sha: String,
        }
        let pull: PullDetail = self
            .get_json(self.repo_url(&format!("/pulls/{number}")))
            .await?;
        let combined: CombinedStatusResponse = self
            .get_json(self.repo_url(&format!("/commits/{}/status", pull.head.sha)))
            .await?;
        Ok(match combined.state.as_str() {
            "success" => ChecksStatus::Passing,
            "failure" | "error" => ChecksStatus::Failing,
            _ => ChecksStatus::Pending,
        })
    }
}
