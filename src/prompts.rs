//! Prompt builders for the three session phases.
//!
//! Each phase sends the agent service a prompt that pins a structured-output
//! JSON schema; the poller later reads confidence scores, summaries, and pull
//! request URLs back out of that structured output.

use crate::adapters::issues::{ChecksStatus, IssueDetails};
use crate::session::IssueRef;

const TRIAGE_SCHEMA: &str = r#"{
  "issue_summary": "string",
  "acceptance_criteria": ["string"],
  "confidence_score": 0.0,
  "confidence_rationale": "string",
  "key_risks": ["string"],
  "proposed_plan": [
    {"step": 1, "action": "string", "files": ["string"], "tests": ["string"]}
  ],
  "recommended_next_action": "execute|needs_human|needs_info",
  "questions_for_reporter": ["string"]
}"#;

const EXECUTE_SCHEMA: &str = r#"{
  "result_summary": "string",
  "files_changed": ["string"],
  "tests_run": ["string"],
  "test_results": "string",
  "pull_request_url": "string",
  "confidence_score": 0.0,
  "notes_for_reviewer": ["string"]
}"#;

const VERIFY_SCHEMA: &str = r#"{
  "result_summary": "string",
  "checks_reviewed": ["string"],
  "verdict": "approve|request_changes|needs_human",
  "confidence_score": 0.0,
  "findings": ["string"]
}"#;

/// Branch an execute session is told to push its work to. The orchestrator
/// uses the same name when it has to open the change request itself.
pub fn work_branch(issue: &IssueRef) -> String {
    format!("conductor/issue-{}", issue.number)
}

fn comment_block(details: &IssueDetails) -> String {
    if details.comments.is_empty() {
        "(no comments)".to_string()
    } else {
        details
            .comments
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Triage: summarize, plan, and score the issue without changing code.
pub fn triage_prompt(details: &IssueDetails) -> String {
    format!(
        "You are an autonomous engineer. Triage the issue below.\n\
         \n\
         Goals:\n\
         1) Summarize the issue and infer clear acceptance criteria.\n\
         2) Propose a concrete step-by-step implementation plan.\n\
         3) Assign a confidence score from 0.0 to 1.0 for completing this issue automatically.\n\
         4) Identify risks and any questions needed before execution.\n\
         \n\
         IMPORTANT: maintain the following JSON schema as STRUCTURED OUTPUT and\n\
         update it as soon as you determine the plan and confidence score.\n\
         \n\
         STRUCTURED OUTPUT JSON SCHEMA:\n{schema}\n\
         \n\
         ISSUE {issue}: {title}\n{url}\n\
         \n\
         ISSUE BODY:\n{body}\n\
         \n\
         RECENT COMMENTS:\n{comments}\n",
        schema = TRIAGE_SCHEMA,
        issue = details.issue_ref,
        title = details.title,
        url = details.html_url,
        body = details.body,
        comments = comment_block(details),
    )
}

/// Execute: implement the triaged plan end-to-end and open a pull request.
pub fn execute_prompt(details: &IssueDetails, plan_summary: Option<&str>) -> String {
    format!(
        "You are an autonomous engineer. Implement the issue below end-to-end\n\
         and open a pull request.\n\
         \n\
         ISSUE {issue}: {title}\n{url}\n\
         \n\
         TRIAGE PLAN (use as plan input, do not restate it):\n{plan}\n\
         \n\
         Requirements:\n\
         - Create a new branch named {branch}.\n\
         - Implement the fix with tests.\n\
         - Run the test suite locally.\n\
         - Push the branch and open a pull request against the default branch.\n\
         - Include the pull request link in STRUCTURED OUTPUT.\n\
         \n\
         IMPORTANT: maintain the following JSON schema as STRUCTURED OUTPUT and\n\
         populate it once the pull request is created.\n\
         \n\
         STRUCTURED OUTPUT JSON SCHEMA:\n{schema}\n",
        issue = details.issue_ref,
        title = details.title,
        url = details.html_url,
        plan = plan_summary.unwrap_or("(no triage plan recorded)"),
        branch = work_branch(&details.issue_ref),
        schema = EXECUTE_SCHEMA,
    )
}

/// Verify: review the opened change request against its checks.
pub fn verify_prompt(
    issue: &IssueRef,
    change_request: &str,
    checks: Option<ChecksStatus>,
) -> String {
    let checks = checks.map_or_else(|| "unknown".to_string(), |c| c.to_string());
    format!(
        "You are an autonomous reviewer. Verify the change request below\n\
         resolves issue {issue}.\n\
         \n\
         CHANGE REQUEST: {change_request}\n\
         CURRENT CHECK STATUS: {checks}\n\
         \n\
         Goals:\n\
         1) Review the diff against the issue's acceptance criteria.\n\
         2) Inspect CI check results; investigate any failures.\n\
         3) Produce a verdict: approve, request_changes, or needs_human.\n\
         \n\
         IMPORTANT: maintain the following JSON schema as STRUCTURED OUTPUT.\n\
         \n\
         STRUCTURED OUTPUT JSON SCHEMA:\n{schema}\n",
        schema = VERIFY_SCHEMA,
    )
}

/// Session title shown in the agent service's UI, truncated for sanity.
pub fn session_title(phase: &str, issue: &IssueRef, issue_title: &str) -> String {
    let mut title = issue_title.to_string();
    if title.len() > 80 {
        let mut end = 80;
        while !title.is_char_boundary(end) {
            end -= 1;
        }
        title.truncate(end);
    }
    format!("{phase} {issue}: {title}")
}
