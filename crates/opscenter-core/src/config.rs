//! Office configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists. Pool size and interval
//! may be mutated live through the control surface; everything else is
//! fixed for the session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfficeConfig {
    /// The user's standing objective for the manager.
    pub master_prompt: String,
    /// Model id for the long-lived manager session.
    pub manager_model: String,
    /// Model id for assistant sessions.
    pub assistant_model: String,
    /// Maximum concurrent assistants (the pool semaphore size).
    pub max_assistants: usize,
    /// Rest interval between iterations, seconds.
    pub interval_secs: u64,
    /// Working directory inherited by every session.
    pub working_directory: PathBuf,
    /// Tool providers exposed to sessions, in order.
    pub enabled_tool_providers: Vec<String>,
    /// Skills withheld from sessions.
    pub disabled_skills: BTreeSet<String>,
    /// Per-assistant wall clock budget, seconds.
    pub assistant_timeout_secs: u64,
    /// Retries per failed task.
    pub max_retries: u32,
    /// Skip the plan approval gate.
    pub auto_approve_plan: bool,
    /// Queued tasks beyond this are cancelled at submission; 0 = unlimited.
    pub max_queue_depth: usize,
    /// Per-manager-LLM-call timeout, seconds.
    pub manager_llm_timeout_secs: u64,
    /// First retry backoff, seconds. Doubles per retry, capped at 30.
    pub retry_delay_secs: u64,
}

impl Default for OfficeConfig {
    fn default() -> Self {
        Self {
            master_prompt: String::new(),
            manager_model: "claude-opus-4-6".to_string(),
            assistant_model: "claude-haiku-4-5".to_string(),
            max_assistants: 3,
            interval_secs: 300,
            working_directory: PathBuf::from("."),
            enabled_tool_providers: Vec::new(),
            disabled_skills: BTreeSet::new(),
            assistant_timeout_secs: 600,
            max_retries: 1,
            auto_approve_plan: false,
            max_queue_depth: 0,
            manager_llm_timeout_secs: 120,
            retry_delay_secs: 2,
        }
    }
}

impl OfficeConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} — using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {} — using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Pool size, never below 1.
    pub fn pool_size(&self) -> usize {
        self.max_assistants.max(1)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn assistant_timeout(&self) -> Duration {
        Duration::from_secs(self.assistant_timeout_secs)
    }

    pub fn manager_llm_timeout(&self) -> Duration {
        Duration::from_secs(self.manager_llm_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = OfficeConfig::default();
        assert_eq!(config.max_assistants, 3);
        assert_eq!(config.interval(), Duration::from_secs(300));
        assert_eq!(config.assistant_timeout(), Duration::from_secs(600));
        assert_eq!(config.manager_llm_timeout(), Duration::from_secs(120));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.max_queue_depth, 0);
        assert!(!config.auto_approve_plan);
    }

    #[test]
    fn pool_size_never_zero() {
        let config = OfficeConfig {
            max_assistants: 0,
            ..Default::default()
        };
        assert_eq!(config.pool_size(), 1);
    }

    #[test]
    fn toml_round_trip() {
        let mut config = OfficeConfig::default();
        config.master_prompt = "watch the incident queue".to_string();
        config.max_assistants = 5;
        config.interval_secs = 60;
        let toml_text = config.to_toml();
        let parsed: OfficeConfig = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.master_prompt, config.master_prompt);
        assert_eq!(parsed.max_assistants, 5);
        assert_eq!(parsed.interval_secs, 60);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: OfficeConfig = toml::from_str("max_assistants = 7").unwrap();
        assert_eq!(parsed.max_assistants, 7);
        assert_eq!(parsed.interval_secs, 300);
        assert_eq!(parsed.manager_model, OfficeConfig::default().manager_model);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OfficeConfig::load(&dir.path().join("nope.toml"));
        assert_eq!(config.max_assistants, 3);
    }

    #[test]
    fn load_bad_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_assistants = \"many\"").unwrap();
        let config = OfficeConfig::load(&path);
        assert_eq!(config.max_assistants, 3);
    }
}
