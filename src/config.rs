//! Session configuration for the benchmark harness.
//!
//! Configuration is layered the same way throughout the crate: a YAML file
//! declares the session (dataset, directories, agent command table, judge
//! and OCR endpoints), and secrets are overlaid from the environment so
//! they never live in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::runner::AgentCommand;

/// Reasoning mode for the fine evaluation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    /// Verdict only: the judge replies with `Result: 1|0`.
    ResultOnly,
    /// Verdict plus justification: `Reason: ...` then `Result: 1|0`.
    Direct,
}

impl ReasoningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningMode::ResultOnly => "result_only",
            ReasoningMode::Direct => "direct",
        }
    }
}

impl std::str::FromStr for ReasoningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "result_only" => Ok(ReasoningMode::ResultOnly),
            "direct" => Ok(ReasoningMode::Direct),
            other => Err(format!("Unknown reasoning mode: {}", other)),
        }
    }
}

/// Action-annotation mode for the fine evaluation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    /// Raw screenshots only.
    NoAction,
    /// Screenshots with tap overlays and caption strips, when available.
    WithAction,
    /// Raw screenshots plus a textual action log appended to the prompt.
    TextAction,
}

impl ActionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionMode::NoAction => "no_action",
            ActionMode::WithAction => "with_action",
            ActionMode::TextAction => "text_action",
        }
    }
}

impl std::str::FromStr for ActionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_action" => Ok(ActionMode::NoAction),
            "with_action" => Ok(ActionMode::WithAction),
            "text_action" => Ok(ActionMode::TextAction),
            other => Err(format!("Unknown action mode: {}", other)),
        }
    }
}

/// Run mode selecting which half of the pipeline executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Execute agents and evaluate their traces.
    Full,
    /// Execute agents only.
    Exec,
    /// Evaluate existing traces only.
    Eval,
}

impl RunMode {
    pub fn executes(&self) -> bool {
        matches!(self, RunMode::Full | RunMode::Exec)
    }

    pub fn evaluates(&self) -> bool {
        matches!(self, RunMode::Full | RunMode::Eval)
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RunMode::Full),
            "exec" => Ok(RunMode::Exec),
            "eval" => Ok(RunMode::Eval),
            other => Err(format!("Unknown run mode: {}", other)),
        }
    }
}

/// Judge endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Base URL of the OpenAI-compatible chat completions API.
    #[serde(default = "default_judge_api_base")]
    pub api_base: String,
    /// Model identifier sent with every judge request.
    #[serde(default = "default_judge_model")]
    pub model: String,
    /// API key; normally overlaid from `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_judge_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_judge_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_judge_model() -> String {
    "gpt-4o".to_string()
}

fn default_judge_timeout_secs() -> u64 {
    120
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            api_base: default_judge_api_base(),
            model: default_judge_model(),
            api_key: None,
            timeout_secs: default_judge_timeout_secs(),
        }
    }
}

/// OCR service endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// URL of the OCR extraction service.
    #[serde(default)]
    pub endpoint: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ocr_timeout_secs() -> u64 {
    60
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

/// Emulator fleet configuration, used only with `--setup-emulator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Path to the emulator executable.
    #[serde(default)]
    pub emulator_path: String,
    /// Name of the source AVD the fleet instances are named after.
    #[serde(default)]
    pub source_avd_name: String,
    /// Number of emulator instances to launch.
    #[serde(default = "default_num_emulators")]
    pub num_of_emulators: usize,
    /// Maximum seconds to wait for each instance to finish booting.
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,
}

fn default_num_emulators() -> usize {
    1
}

fn default_boot_timeout_secs() -> u64 {
    300
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            emulator_path: String::new(),
            source_avd_name: String::new(),
            num_of_emulators: default_num_emulators(),
            boot_timeout_secs: default_boot_timeout_secs(),
        }
    }
}

/// Top-level benchmark configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Canonical dataset CSV the results table is seeded from.
    pub dataset_path: PathBuf,
    /// Directory holding per-session output directories.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Session identifier; the session directory is `session-<id>`.
    #[serde(default = "default_session_id")]
    pub session_id: String,
    /// Directory of pre-decomposed cross-app subtask files.
    #[serde(default = "default_split_dir")]
    pub cross_app_split_dir: PathBuf,
    /// Maximum number of concurrent evaluator subprocesses.
    #[serde(default = "default_max_eval_subprocess")]
    pub max_eval_subprocess: usize,
    /// Global step budget; when absent each task uses `golden_steps * 2 + 1`.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    /// IME package used when a task does not need the ADB keyboard.
    #[serde(default = "default_keyboard_package")]
    pub default_keyboard_package: String,
    /// Path to the adb executable.
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    /// Optional wall-clock cap on a single agent process, in seconds.
    #[serde(default)]
    pub agent_timeout_secs: Option<u64>,
    /// Model identifier forwarded to agents that accept one.
    #[serde(default)]
    pub agent_model: Option<String>,
    /// Agent command table; selected by agent name at run time.
    #[serde(default)]
    pub agents: Vec<AgentCommand>,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("./results")
}

fn default_session_id() -> String {
    "default".to_string()
}

fn default_split_dir() -> PathBuf {
    PathBuf::from("./data/cross-app-split")
}

fn default_max_eval_subprocess() -> usize {
    4
}

fn default_keyboard_package() -> String {
    "com.google.android.inputmethod.latin/com.android.inputmethod.latin.LatinIME".to_string()
}

fn default_adb_path() -> String {
    "adb".to_string()
}

impl BenchConfig {
    /// Loads configuration from a YAML file and overlays secrets from the
    /// environment (`OPENAI_API_KEY` for the judge).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config: BenchConfig =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;

        if config.judge.api_key.is_none() {
            config.judge.api_key = std::env::var("OPENAI_API_KEY").ok();
        }

        Ok(config)
    }

    /// Looks up the command template for a named agent.
    pub fn agent(&self, name: &str) -> Result<&AgentCommand, ConfigError> {
        self.agents
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| ConfigError::UnknownAgent(name.to_string()))
    }

    /// The output directory for this session.
    pub fn session_dir(&self) -> PathBuf {
        self.results_dir.join(format!("session-{}", self.session_id))
    }

    /// Agent process timeout as a `Duration`, if configured.
    pub fn agent_timeout(&self) -> Option<Duration> {
        self.agent_timeout_secs.map(Duration::from_secs)
    }
}
