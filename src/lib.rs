//! Conductor: a session orchestrator that drives GitHub issues through
//! triage, execution, and verification phases on a remote autonomous coding
//! agent service.
//!
//! The core is a pure state machine ([`machine`]) over an in-memory record
//! table ([`table`]) with a single-writer step loop ([`orchestrator`]). A
//! background [`poller`] feeds remote status back in as events, and every
//! committed change fans out to dashboard clients through the [`bus`] and
//! the WebSocket feed ([`ws`]).

pub mod adapters;
pub mod bus;
pub mod config;
pub mod errors;
pub mod machine;
pub mod orchestrator;
pub mod poller;
pub mod prompts;
pub mod server;
pub mod session;
pub mod table;
pub mod ws;
