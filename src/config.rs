//! Runtime configuration.
//!
//! `ConductorConfig` tunes the orchestrator core (poll cadence, retry budget,
//! backoff, chaining threshold). `Settings` layers an optional
//! `conductor.toml` under environment variables for credentials and
//! deployment knobs, following the env-over-file precedence the rest of the
//! stack expects.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Tuning for the orchestrator, poller, and event bus.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Poll interval while a session is `Dispatched` (awaiting confirmation).
    pub poll_fast: Duration,
    /// Base poll interval for `Running` sessions.
    pub poll_slow: Duration,
    /// Ceiling for the `Running` interval as sessions age.
    pub poll_max: Duration,
    /// Timeout applied to every remote call.
    pub poll_timeout: Duration,
    /// Process-wide cap on in-flight polls.
    pub max_concurrent_polls: usize,
    /// Fixed retry count per record; the transient error after this many
    /// retries fails the record.
    pub retry_budget: u32,
    /// Base delay for exponential retry backoff.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Triage confidence at or above this auto-chains to Execute.
    pub confidence_threshold: f64,
    /// Whether terminal phases chain automatically at all.
    pub auto_chain: bool,
    /// How long terminal records stay in the table before eviction.
    pub retention: Duration,
    /// Per-subscriber event buffer capacity.
    pub bus_capacity: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            poll_fast: Duration::from_secs(2),
            poll_slow: Duration::from_secs(15),
            poll_max: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(30),
            max_concurrent_polls: 8,
            retry_budget: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            confidence_threshold: 0.7,
            auto_chain: true,
            retention: Duration::from_secs(60 * 60),
            bus_capacity: 256,
        }
    }
}

impl ConductorConfig {
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_max_concurrent_polls(mut self, max: usize) -> Self {
        self.max_concurrent_polls = max;
        self
    }

    pub fn with_auto_chain(mut self, enabled: bool) -> Self {
        self.auto_chain = enabled;
        self
    }

    pub fn with_poll_intervals(mut self, fast: Duration, slow: Duration, max: Duration) -> Self {
        self.poll_fast = fast;
        self.poll_slow = slow;
        self.poll_max = max;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }
}

/// On-disk shape of `conductor.toml`. Every field is optional; the
/// environment wins where both are set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSettings {
    pub agent_base_url: Option<String>,
    pub github_owner: Option<String>,
    pub github_repo: Option<String>,
    pub port: Option<u16>,
    pub retry_budget: Option<u32>,
    pub confidence_threshold: Option<f64>,
    pub max_concurrent_polls: Option<usize>,
    pub auto_chain: Option<bool>,
    pub poll_fast_secs: Option<u64>,
    pub poll_slow_secs: Option<u64>,
    pub retention_secs: Option<u64>,
}

/// Fully resolved deployment settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub agent_base_url: String,
    pub agent_api_key: String,
    pub github_owner: String,
    pub github_repo: String,
    pub github_token: String,
    pub port: u16,
    pub conductor: ConductorConfig,
}

impl Settings {
    /// Load settings from an optional TOML file plus the environment.
    /// Secrets (API keys, tokens) come from the environment only.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            None => FileSettings::default(),
        };
        Self::resolve(file)
    }

    fn resolve(file: FileSettings) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let agent_base_url = env("AGENT_BASE_URL")
            .or(file.agent_base_url)
            .unwrap_or_else(|| "https://api.devin.ai/v1".to_string());
        let agent_api_key = env("AGENT_API_KEY").context("Missing AGENT_API_KEY")?;
        let github_owner = env("GITHUB_OWNER")
            .or(file.github_owner)
            .context("Missing GITHUB_OWNER")?;
        let github_repo = env("GITHUB_REPO")
            .or(file.github_repo)
            .context("Missing GITHUB_REPO")?;
        let github_token = env("GITHUB_TOKEN").context("Missing GITHUB_TOKEN")?;
        let port = env("CONDUCTOR_PORT")
            .and_then(|v| v.parse().ok())
            .or(file.port)
            .unwrap_or(3141);

        let mut conductor = ConductorConfig::default();
        if let Some(budget) = file.retry_budget {
            conductor = conductor.with_retry_budget(budget);
        }
        if let Some(threshold) = file.confidence_threshold {
            conductor = conductor.with_confidence_threshold(threshold);
        }
        if let Some(max) = file.max_concurrent_polls {
            conductor = conductor.with_max_concurrent_polls(max);
        }
        if let Some(enabled) = file.auto_chain {
            conductor = conductor.with_auto_chain(enabled);
        }
        if let Some(fast) = file.poll_fast_secs {
            conductor.poll_fast = Duration::from_secs(fast);
        }
        if let Some(slow) = file.poll_slow_secs {
            conductor.poll_slow = Duration::from_secs(slow);
        }
        if let Some(retention) = file.retention_secs {
            conductor.retention = Duration::from_secs(retention);
        }

        Ok(Self {
            agent_base_url,
            agent_api_key,
            github_owner,
            github_repo,
            github_token,
            port,
            conductor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sensible() {
        let config = ConductorConfig::default();
        // Fast polling must actually be faster than slow polling, and the
        // ceiling must sit above both.
        assert!(config.poll_fast < config.poll_slow);
        assert!(config.poll_slow <= config.poll_max);
        assert!(config.backoff_base < config.backoff_cap);
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.confidence_threshold, 0.7);
        assert!(config.auto_chain);
    }

    #[test]
    fn builders_override_defaults() {
        let config = ConductorConfig::default()
            .with_retry_budget(5)
            .with_confidence_threshold(0.9)
            .with_max_concurrent_polls(2)
            .with_auto_chain(false);
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.confidence_threshold, 0.9);
        assert_eq!(config.max_concurrent_polls, 2);
        assert!(!config.auto_chain);
    }

    #[test]
    fn file_settings_parse_partial_toml() {
        let raw = r#"
            github_owner = "octocat"
            retry_budget = 4
            confidence_threshold = 0.8
        "#;
        let file: FileSettings = toml::from_str(raw).unwrap();
        assert_eq!(file.github_owner.as_deref(), Some("octocat"));
        assert_eq!(file.retry_budget, Some(4));
        assert_eq!(file.confidence_threshold, Some(0.8));
        assert!(file.port.is_none());
    }

    #[test]
    fn file_settings_reject_malformed_toml() {
        assert!(toml::from_str::<FileSettings>("retry_budget = \"lots\"").is_err());
    }
}
