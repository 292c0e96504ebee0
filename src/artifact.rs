//! Per-attempt artifact schemas.
//!
//! Agents write two JSON artifacts into their (task, agent) output
//! directory: `log.json`, an array of step entries terminated by a summary
//! record, and `error.json`, at most one entry describing an expected
//! failure. The ledger ingests the summary; the evaluators read the step
//! actions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Cost per prompt token at gpt-4o pricing, used for the ledger's token
/// cost column.
pub const PROMPT_TOKEN_COST: f64 = 5e-6;
/// Cost per completion token at gpt-4o pricing.
pub const COMPLETION_TOKEN_COST: f64 = 1.5e-5;

/// The action recorded for one step: `[type, {detail_type, detail}]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAction(pub String, pub ActionDetail);

/// Action payload; `detail` is a string for typed input/swipes and a
/// coordinate pair for taps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDetail {
    pub detail_type: ActionDetailType,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDetailType {
    String,
    Coordinates,
}

/// One agent step: the model response plus the action that transitions
/// screenshot `step` to `step + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStep {
    pub step: u32,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    pub action: StepAction,
}

/// Trailing summary record closing the log artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSummary {
    pub total_steps: u32,
    pub finish_signal: u8,
    pub elapsed_time_initial: f64,
    pub elapsed_time_exec: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogEntry {
    Step(LogStep),
    Summary(LogSummary),
}

/// A parsed `log.json`: the ordered steps and the summary.
#[derive(Debug, Clone)]
pub struct LogArtifact {
    pub steps: Vec<LogStep>,
    pub summary: LogSummary,
}

impl LogArtifact {
    /// Reads and validates a log artifact. Returns `None` when the file is
    /// absent or carries no summary record: a missing artifact leaves the
    /// ledger's numeric fields untouched.
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        let entries: Vec<LogEntry> = serde_json::from_str(&raw).ok()?;

        let mut steps = Vec::new();
        let mut summary = None;
        for entry in entries {
            match entry {
                LogEntry::Step(step) => steps.push(step),
                LogEntry::Summary(s) => summary = Some(s),
            }
        }
        summary.map(|summary| Self { steps, summary })
    }

    /// Total dollar cost of the attempt at the fixed judge pricing.
    pub fn token_cost(&self) -> f64 {
        PROMPT_TOKEN_COST * self.summary.total_prompt_tokens as f64
            + COMPLETION_TOKEN_COST * self.summary.total_completion_tokens as f64
    }

    /// The textual action log appended to `text_action`-mode prompts: one
    /// line per string-detail step describing the screenshot transition.
    pub fn action_text(&self) -> String {
        let mut lines = Vec::new();
        for step in &self.steps {
            if step.step >= self.summary.total_steps {
                continue;
            }
            if step.action.1.detail_type == ActionDetailType::String {
                let detail = step
                    .action
                    .1
                    .detail
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| step.action.1.detail.to_string());
                lines.push(format!(
                    "The action that changes from screenshot No.{} to screenshot No.{} is *{}*, with details: *{}*",
                    step.step,
                    step.step + 1,
                    step.action.0,
                    detail
                ));
            }
        }
        lines.join("\n")
    }
}

/// The single entry of `error.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorArtifact {
    pub error_message: String,
}

impl ErrorArtifact {
    /// Reads the error artifact, if the attempt produced one.
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        let mut entries: Vec<ErrorArtifact> = serde_json::from_str(&raw).ok()?;
        if entries.is_empty() {
            None
        } else {
            Some(entries.remove(0))
        }
    }
}

/// Path of a per-(task, agent) artifact file. An empty agent name (bare
/// evaluation sessions) collapses to the task directory.
pub fn artifact_path(session_dir: &Path, task_id: &str, agent: &str, file: &str) -> PathBuf {
    let mut dir = session_dir.join(task_id);
    if !agent.is_empty() {
        dir = dir.join(agent);
    }
    dir.join(file)
}

/// The (task, agent) output directory holding screenshots and artifacts.
pub fn attempt_dir(session_dir: &Path, task_id: &str, agent: &str) -> PathBuf {
    let mut dir = session_dir.join(task_id);
    if !agent.is_empty() {
        dir = dir.join(agent);
    }
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_log() -> &'static str {
        r#"[
            {"step": 0, "response": "tap the icon", "prompt_tokens": 100, "completion_tokens": 10,
             "action": ["tap", {"detail_type": "coordinates", "detail": [540, 960]}]},
            {"step": 1, "response": "type the query", "prompt_tokens": 120, "completion_tokens": 12,
             "action": ["input_text", {"detail_type": "string", "detail": "hello"}]},
            {"total_steps": 2, "finish_signal": 1, "elapsed_time_initial": 1.5,
             "elapsed_time_exec": 20.25, "total_prompt_tokens": 220, "total_completion_tokens": 22}
        ]"#
    }

    #[test]
    fn test_load_log_artifact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");
        std::fs::write(&path, sample_log()).unwrap();

        let log = LogArtifact::load(&path).unwrap();
        assert_eq!(log.steps.len(), 2);
        assert_eq!(log.summary.total_steps, 2);
        assert_eq!(log.summary.finish_signal, 1);
        assert!((log.token_cost() - (5e-6 * 220.0 + 1.5e-5 * 22.0)).abs() < 1e-12);
    }

    #[test]
    fn test_load_log_artifact_missing_or_unterminated() {
        let dir = TempDir::new().unwrap();
        assert!(LogArtifact::load(&dir.path().join("absent.json")).is_none());

        let path = dir.path().join("log.json");
        std::fs::write(
            &path,
            r#"[{"step": 0, "action": ["tap", {"detail_type": "coordinates", "detail": [1, 2]}]}]"#,
        )
        .unwrap();
        assert!(LogArtifact::load(&path).is_none());
    }

    #[test]
    fn test_action_text_skips_coordinate_steps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");
        std::fs::write(&path, sample_log()).unwrap();

        let log = LogArtifact::load(&path).unwrap();
        let text = log.action_text();
        assert!(text.contains("screenshot No.1 to screenshot No.2"));
        assert!(text.contains("*input_text*"));
        assert!(!text.contains("tap"));
    }

    #[test]
    fn test_error_artifact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("error.json");
        std::fs::write(&path, r#"[{"error_message": "login wall"}]"#).unwrap();
        assert_eq!(
            ErrorArtifact::load(&path).unwrap().error_message,
            "login wall"
        );
        assert!(ErrorArtifact::load(&dir.path().join("none.json")).is_none());
    }

    #[test]
    fn test_artifact_paths() {
        let session = Path::new("/tmp/session-1");
        assert_eq!(
            artifact_path(session, "clock_0", "AppAgent", "log.json"),
            PathBuf::from("/tmp/session-1/clock_0/AppAgent/log.json")
        );
        assert_eq!(
            artifact_path(session, "clock_0", "", "log.json"),
            PathBuf::from("/tmp/session-1/clock_0/log.json")
        );
    }
}
