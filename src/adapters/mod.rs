//! Capability interfaces over external collaborators.
//!
//! The orchestrator core never talks to the network directly; it goes through
//! the `AgentClient` (remote agent service) and `IssueSource` (issue tracker)
//! traits defined here. Production implementations use HTTP; tests substitute
//! scripted doubles.

pub mod agent;
pub mod issues;

pub use agent::{AgentClient, CreatedSession, HttpAgentClient, RemoteStatus, StatusReport};
pub use issues::{ChecksStatus, GitHubIssueSource, IssueDetails, IssueSource, IssueSummary};
