use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Shell-command patterns rejected by the safety gate. Case-insensitive
/// regexes; a match blocks the command before dispatch.
pub fn default_denylist() -> Vec<String> {
    vec![
        r"rm\s+-[a-z]*r[a-z]*f?[a-z]*\s+/(\s|$)".to_string(), // recursive root deletion
        r":\(\)\s*\{.*\}".to_string(),                        // fork bomb
        r"dd\s+if=/dev/(zero|random|urandom)".to_string(),    // disk wipe
        r"mkfs\.".to_string(),                                // format filesystem
        r">\s*/dev/sd[a-z]".to_string(),                      // write to block device
        r"(curl|wget).*\|\s*(ba|z|da)?sh".to_string(),        // pipe download to shell
        r"chmod\s+(-[a-z]+\s+)?777".to_string(),
        r"\beval\s".to_string(),
        r"\bexec\s".to_string(),
    ]
}

fn default_max_iterations() -> u32 {
    10
}
fn default_run_timeout_secs() -> u64 {
    24 * 60 * 60
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_tool_timeout_secs() -> u64 {
    300
}
fn default_git_timeout_secs() -> u64 {
    15 * 60
}
fn default_max_read_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_plan_retries() -> u32 {
    2
}
fn default_max_malformed() -> u32 {
    3
}
fn default_transcript_budget() -> usize {
    96_000
}
fn default_subject_prefix() -> String {
    "muskox.workflows".to_string()
}
fn default_model() -> String {
    "openrouter/auto".to_string()
}

// ---------------------------------------------------------------------------
// AgentSettings
// ---------------------------------------------------------------------------

/// All tunables for a run. `Default` carries production defaults; a TOML
/// file may override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Hard cap on agent-loop iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock ceiling for the whole run.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Per-call timeout for LLM requests.
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    /// Default timeout for a single shell tool execution.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Timeout for a single git operation (clone is the long pole).
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,

    /// Ceiling on file reads through the read_file tool.
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,

    /// Corrective retries after a malformed plan response.
    #[serde(default = "default_plan_retries")]
    pub plan_retries: u32,

    /// Consecutive malformed loop responses before a hard failure.
    #[serde(default = "default_max_malformed")]
    pub max_malformed_responses: u32,

    /// Transcript size budget in characters.
    #[serde(default = "default_transcript_budget")]
    pub transcript_budget_chars: usize,

    /// Destructive shell patterns (regex, case-insensitive).
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,

    /// First segment of the notification subject.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Model identifier passed to the LLM provider.
    #[serde(default = "default_model")]
    pub model: String,

    /// Extra instructions appended to planner and implementer prompts.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        // serde defaults are the single source of truth
        toml::from_str("").expect("empty settings parse")
    }
}

impl AgentSettings {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let settings: AgentSettings = toml::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("max_iterations must be > 0".into()));
        }
        if self.max_read_bytes == 0 {
            return Err(ConfigError::Invalid("max_read_bytes must be > 0".into()));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
