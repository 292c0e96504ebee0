//! Durable results ledger.
//!
//! One CSV table per session, one row per task, keyed by
//! `task_identifier`. Per-agent execution columns and per-mode evaluation
//! columns are added on demand with sentinel defaults and never
//! overwritten by initialization. The table is the sole source of truth
//! for "has this (task, agent) pair run / been evaluated": nothing infers
//! state from screenshot directories or log files alone.
//!
//! Concurrency: the table is mutated by the main process and by evaluator
//! subprocesses. Every mutation takes an exclusive lock on a sibling
//! `.lock` file, fully re-reads the table, applies its change, writes, and
//! releases. Writers touch disjoint column sets per (agent, mode), so
//! last-writer-wins only matters for the identical cell, which no
//! supported flow produces.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::artifact::{artifact_path, ErrorArtifact, LogArtifact};
use crate::config::{ActionMode, ReasoningMode};
use crate::error::LedgerError;

/// Sentinel for unwritten text cells.
pub const SENTINEL_TEXT: &str = "N";
/// Sentinel for an unwritten exit code.
pub const SENTINEL_EXIT_CODE: &str = "-1";

/// Bounded retry policy for table writes.
const WRITE_RETRIES: u32 = 5;
const WRITE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Ternary evaluation verdict stored in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The trace satisfies the task (`S`).
    Success,
    /// The trace was judged and does not satisfy the task (`F`).
    Fail,
    /// No evidence to judge, or the evaluation itself failed (`E`).
    Error,
}

impl Verdict {
    pub fn letter(&self) -> &'static str {
        match self {
            Verdict::Success => "S",
            Verdict::Fail => "F",
            Verdict::Error => "E",
        }
    }
}

/// In-memory image of the results table.
#[derive(Debug, Clone)]
pub struct LedgerTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

impl LedgerTable {
    /// Reads a table from CSV, indexing rows by `task_identifier`.
    pub fn from_path(path: &Path) -> Result<Self, LedgerError> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let key_col = headers
            .iter()
            .position(|h| h == "task_identifier")
            .ok_or_else(|| LedgerError::MissingColumn("task_identifier".to_string()))?;

        let mut rows = Vec::new();
        let mut index = HashMap::new();
        for record in reader.records() {
            let record = record?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            // Short rows can appear when columns were appended since the
            // row was written; pad with empty cells.
            row.resize(headers.len(), String::new());
            index.insert(row[key_col].clone(), rows.len());
            rows.push(row);
        }

        Ok(Self {
            headers,
            rows,
            index,
        })
    }

    /// Appends a column with a default value unless it already exists.
    /// Existing data is never touched.
    pub fn ensure_column(&mut self, name: &str, default: &str) {
        if self.headers.iter().any(|h| h == name) {
            return;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(default.to_string());
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    pub fn task_ids(&self) -> Vec<String> {
        let key_col = self
            .headers
            .iter()
            .position(|h| h == "task_identifier")
            .unwrap_or(0);
        self.rows.iter().map(|row| row[key_col].clone()).collect()
    }

    /// Reads a cell; `None` when the task or column is unknown.
    pub fn get(&self, task_id: &str, column: &str) -> Option<&str> {
        let row = *self.index.get(task_id)?;
        let col = self.headers.iter().position(|h| h == column)?;
        Some(self.rows[row][col].as_str())
    }

    /// Writes a cell.
    pub fn set(&mut self, task_id: &str, column: &str, value: String) -> Result<(), LedgerError> {
        let row = *self
            .index
            .get(task_id)
            .ok_or_else(|| LedgerError::UnknownTask(task_id.to_string()))?;
        let col = self
            .headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| LedgerError::MissingColumn(column.to_string()))?;
        self.rows[row][col] = value;
        Ok(())
    }

    fn write_to(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Exclusive cross-process lock on the ledger's backing path. Held for the
/// duration of one reload-mutate-write cycle; released on drop on every
/// path.
struct LedgerLock {
    file: std::fs::File,
}

impl LedgerLock {
    fn acquire(lock_path: &Path) -> Result<Self, LedgerError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| LedgerError::Lock {
                path: lock_path.to_path_buf(),
                source: e,
            })?;
        file.lock_exclusive().map_err(|e| LedgerError::Lock {
            path: lock_path.to_path_buf(),
            source: e,
        })?;
        Ok(Self { file })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Durable, lock-protected results store.
#[derive(Debug, Clone)]
pub struct ResultLedger {
    session_dir: PathBuf,
    csv_path: PathBuf,
    lock_path: PathBuf,
}

impl ResultLedger {
    /// Opens (or creates) the ledger for a session and initializes columns
    /// for the given agents and evaluation mode. Re-running `init` with
    /// the same arguments is a no-op on existing data.
    pub async fn init(
        session_dir: impl Into<PathBuf>,
        dataset_path: &Path,
        agents: &[String],
        reasoning_mode: ReasoningMode,
        action_mode: ActionMode,
    ) -> Result<Self, LedgerError> {
        let session_dir = session_dir.into();
        std::fs::create_dir_all(&session_dir)?;
        let csv_path = session_dir.join("results.csv");
        let lock_path = session_dir.join("results.csv.lock");
        let ledger = Self {
            session_dir,
            csv_path,
            lock_path,
        };

        let _lock = LedgerLock::acquire(&ledger.lock_path)?;
        let mut table = if ledger.csv_path.exists() {
            info!(path = %ledger.csv_path.display(), "Loaded results table");
            LedgerTable::from_path(&ledger.csv_path)?
        } else {
            info!(
                dataset = %dataset_path.display(),
                "Seeding results table from dataset"
            );
            LedgerTable::from_path(dataset_path)?
        };

        for agent in agents {
            let prefix = column_prefix(agent);
            if !agent.is_empty() {
                for (field, default) in [
                    ("completion", SENTINEL_TEXT),
                    ("device", SENTINEL_TEXT),
                    ("exit_code", SENTINEL_EXIT_CODE),
                    ("total_steps", "0"),
                    ("total_token_cost", "0"),
                    ("total_time", "0"),
                    ("finish_signal", "0"),
                    ("step_ratio", "0"),
                    ("elapsed_time_initial", "0"),
                    ("elapsed_time_exec", "0"),
                    ("avg_prompt_tokens", "0"),
                    ("avg_completion_tokens", "0"),
                    ("exec_error", SENTINEL_TEXT),
                ] {
                    table.ensure_column(&format!("{}{}", prefix, field), default);
                }
            }
            let mode_prefix = evaluation_prefix(reasoning_mode, action_mode, agent);
            table.ensure_column(&format!("{}evaluation", mode_prefix), SENTINEL_TEXT);
            table.ensure_column(&format!("{}details", mode_prefix), "{}");
        }

        ledger.save_with_retries(&table).await?;
        Ok(ledger)
    }

    /// Opens an existing ledger without touching columns. Used by
    /// evaluator subprocesses, which must never race `init` column layout
    /// against the parent.
    pub fn open(session_dir: impl Into<PathBuf>) -> Self {
        let session_dir = session_dir.into();
        let csv_path = session_dir.join("results.csv");
        let lock_path = session_dir.join("results.csv.lock");
        Self {
            session_dir,
            csv_path,
            lock_path,
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// A point-in-time copy of the table, for scope decisions.
    pub fn snapshot(&self) -> Result<LedgerTable, LedgerError> {
        let _lock = LedgerLock::acquire(&self.lock_path)?;
        LedgerTable::from_path(&self.csv_path)
    }

    /// Records one execution attempt: completion flag, device, exit code,
    /// and everything derivable from the attempt's artifacts. A missing
    /// log artifact leaves the numeric fields unchanged; the completion
    /// flag only ever moves from the sentinel to `Y`.
    pub async fn upsert_execution(
        &self,
        task_id: &str,
        agent: &str,
        completed: bool,
        exit_code: i32,
        device_serial: &str,
    ) -> Result<(), LedgerError> {
        let _lock = LedgerLock::acquire(&self.lock_path)?;
        let mut table = LedgerTable::from_path(&self.csv_path)?;
        let prefix = column_prefix(agent);

        if completed {
            table.set(task_id, &format!("{}completion", prefix), "Y".to_string())?;
        }
        table.set(
            task_id,
            &format!("{}device", prefix),
            device_serial.to_string(),
        )?;
        table.set(
            task_id,
            &format!("{}exit_code", prefix),
            exit_code.to_string(),
        )?;

        let log_path = artifact_path(&self.session_dir, task_id, agent, "log.json");
        if let Some(log) = LogArtifact::load(&log_path) {
            let summary = &log.summary;
            table.set(
                task_id,
                &format!("{}total_steps", prefix),
                summary.total_steps.to_string(),
            )?;
            table.set(
                task_id,
                &format!("{}total_token_cost", prefix),
                round5(log.token_cost()).to_string(),
            )?;
            table.set(
                task_id,
                &format!("{}total_time", prefix),
                round5(summary.elapsed_time_initial + summary.elapsed_time_exec).to_string(),
            )?;
            table.set(
                task_id,
                &format!("{}finish_signal", prefix),
                summary.finish_signal.to_string(),
            )?;
            let golden_steps: f64 = table
                .get(task_id, "golden_steps")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            if golden_steps > 0.0 {
                table.set(
                    task_id,
                    &format!("{}step_ratio", prefix),
                    round5(summary.total_steps as f64 / golden_steps).to_string(),
                )?;
            }
            table.set(
                task_id,
                &format!("{}elapsed_time_initial", prefix),
                round5(summary.elapsed_time_initial).to_string(),
            )?;
            table.set(
                task_id,
                &format!("{}elapsed_time_exec", prefix),
                round5(summary.elapsed_time_exec).to_string(),
            )?;
            // The last step is discarded from total_steps, hence the +1.
            let steps = (summary.total_steps + 1) as f64;
            table.set(
                task_id,
                &format!("{}avg_prompt_tokens", prefix),
                round5(summary.total_prompt_tokens as f64 / steps).to_string(),
            )?;
            table.set(
                task_id,
                &format!("{}avg_completion_tokens", prefix),
                round5(summary.total_completion_tokens as f64 / steps).to_string(),
            )?;
        } else {
            debug!(task_id, agent, "No log artifact; numeric fields unchanged");
        }

        let error_path = artifact_path(&self.session_dir, task_id, agent, "error.json");
        let error_text = ErrorArtifact::load(&error_path)
            .map(|e| e.error_message)
            .unwrap_or_else(|| SENTINEL_TEXT.to_string());
        table.set(task_id, &format!("{}exec_error", prefix), error_text)?;

        self.save_with_retries(&table).await
    }

    /// Records one evaluation outcome for a (task, agent, mode) cell.
    pub async fn upsert_evaluation(
        &self,
        task_id: &str,
        agent: &str,
        verdict: Verdict,
        detail: &serde_json::Value,
        reasoning_mode: ReasoningMode,
        action_mode: ActionMode,
    ) -> Result<(), LedgerError> {
        let _lock = LedgerLock::acquire(&self.lock_path)?;
        let mut table = LedgerTable::from_path(&self.csv_path)?;
        let prefix = evaluation_prefix(reasoning_mode, action_mode, agent);

        // Evaluator subprocesses may run against a table initialized by an
        // older parent; make sure the mode columns exist.
        table.ensure_column(&format!("{}evaluation", prefix), SENTINEL_TEXT);
        table.ensure_column(&format!("{}details", prefix), "{}");

        table.set(
            task_id,
            &format!("{}evaluation", prefix),
            verdict.letter().to_string(),
        )?;
        table.set(
            task_id,
            &format!("{}details", prefix),
            serde_json::to_string(detail).unwrap_or_else(|_| "{}".to_string()),
        )?;

        self.save_with_retries(&table).await
    }

    /// Per-agent exit-code histogram plus the error text of unexpected
    /// failures, for operator rerun decisions.
    pub fn execution_summary(
        &self,
        agents: &[String],
    ) -> Result<Vec<AgentSummary>, LedgerError> {
        let table = self.snapshot()?;
        let mut summaries = Vec::new();
        for agent in agents {
            if agent.is_empty() {
                continue;
            }
            let prefix = column_prefix(agent);
            let exit_col = format!("{}exit_code", prefix);
            let error_col = format!("{}exec_error", prefix);
            if !table.has_column(&exit_col) {
                continue;
            }
            let mut summary = AgentSummary {
                agent: agent.clone(),
                exit_code_counts: [0; 5],
                unexpected_errors: Vec::new(),
            };
            for task_id in table.task_ids() {
                let Some(code) = table.get(&task_id, &exit_col) else {
                    continue;
                };
                let Ok(code) = code.parse::<i32>() else {
                    continue;
                };
                if (0..=4).contains(&code) {
                    summary.exit_code_counts[code as usize] += 1;
                }
                if code == 1 {
                    let error = table
                        .get(&task_id, &error_col)
                        .unwrap_or(SENTINEL_TEXT)
                        .to_string();
                    summary.unexpected_errors.push((task_id.clone(), error));
                }
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }

    async fn save_with_retries(&self, table: &LedgerTable) -> Result<(), LedgerError> {
        let mut last_error = String::new();
        for attempt in 1..=WRITE_RETRIES {
            match table.write_to(&self.csv_path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        path = %self.csv_path.display(),
                        attempt,
                        error = %last_error,
                        "Results table write failed"
                    );
                    if attempt < WRITE_RETRIES {
                        tokio::time::sleep(WRITE_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(LedgerError::WriteExhausted {
            attempts: WRITE_RETRIES,
            last_error,
        })
    }
}

/// Exit-code histogram for one agent.
#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub agent: String,
    /// Counts indexed by exit code 0..=4.
    pub exit_code_counts: [usize; 5],
    /// (task, error text) pairs for code-1 tasks.
    pub unexpected_errors: Vec<(String, String)>,
}

/// Human-readable meanings of the five agent exit codes.
pub const EXIT_CODE_MEANINGS: [&str; 5] = [
    "Finished (no rerun)",
    "Unexpected error (decision needed)",
    "Expected error (no rerun)",
    "Expected error (rerun)",
    "Max rounds reached (no rerun)",
];

/// Column prefix for per-agent execution columns.
pub fn column_prefix(agent: &str) -> String {
    if agent.is_empty() {
        String::new()
    } else {
        format!("{}_", agent)
    }
}

/// Column prefix for per-mode evaluation columns.
pub fn evaluation_prefix(
    reasoning_mode: ReasoningMode,
    action_mode: ActionMode,
    agent: &str,
) -> String {
    format!(
        "{}_{}_{}",
        reasoning_mode.as_str(),
        action_mode.as_str(),
        column_prefix(agent)
    )
}

fn round5(v: f64) -> f64 {
    (v * 1e5).round() / 1e5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const DATASET: &str = "\
task_identifier,task_description,task_language,golden_steps,key_component_final,is_cross_app
clock_0,Set an alarm.,ENG,3,\"['7:00']\",N
maps_1,Find a route.,ENG,5,\"['route']\",N
";

    fn write_dataset(dir: &Path) -> PathBuf {
        let path = dir.join("dataset.csv");
        std::fs::write(&path, DATASET).unwrap();
        path
    }

    fn agents() -> Vec<String> {
        vec!["AppAgent".to_string()]
    }

    #[tokio::test]
    async fn test_init_creates_columns_with_sentinels() {
        let dir = TempDir::new().unwrap();
        let dataset = write_dataset(dir.path());
        let ledger = ResultLedger::init(
            dir.path().join("session"),
            &dataset,
            &agents(),
            ReasoningMode::Direct,
            ActionMode::WithAction,
        )
        .await
        .unwrap();

        let table = ledger.snapshot().unwrap();
        assert_eq!(table.get("clock_0", "AppAgent_completion"), Some("N"));
        assert_eq!(table.get("clock_0", "AppAgent_exit_code"), Some("-1"));
        assert_eq!(
            table.get("maps_1", "direct_with_action_AppAgent_evaluation"),
            Some("N")
        );
        assert_eq!(
            table.get("maps_1", "direct_with_action_AppAgent_details"),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn test_init_twice_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let dataset = write_dataset(dir.path());
        let session = dir.path().join("session");

        ResultLedger::init(
            &session,
            &dataset,
            &agents(),
            ReasoningMode::Direct,
            ActionMode::NoAction,
        )
        .await
        .unwrap();
        let first = std::fs::read(session.join("results.csv")).unwrap();

        ResultLedger::init(
            &session,
            &dataset,
            &agents(),
            ReasoningMode::Direct,
            ActionMode::NoAction,
        )
        .await
        .unwrap();
        let second = std::fs::read(session.join("results.csv")).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_upsert_execution_without_log_keeps_numeric_fields() {
        let dir = TempDir::new().unwrap();
        let dataset = write_dataset(dir.path());
        let session = dir.path().join("session");
        let ledger = ResultLedger::init(
            &session,
            &dataset,
            &agents(),
            ReasoningMode::Direct,
            ActionMode::NoAction,
        )
        .await
        .unwrap();

        ledger
            .upsert_execution("clock_0", "AppAgent", true, 0, "emulator-5554")
            .await
            .unwrap();

        let table = ledger.snapshot().unwrap();
        assert_eq!(table.get("clock_0", "AppAgent_completion"), Some("Y"));
        assert_eq!(table.get("clock_0", "AppAgent_exit_code"), Some("0"));
        assert_eq!(table.get("clock_0", "AppAgent_device"), Some("emulator-5554"));
        assert_eq!(table.get("clock_0", "AppAgent_total_steps"), Some("0"));
        assert_eq!(table.get("clock_0", "AppAgent_exec_error"), Some("N"));
    }

    #[tokio::test]
    async fn test_upsert_execution_ingests_log_artifact() {
        let dir = TempDir::new().unwrap();
        let dataset = write_dataset(dir.path());
        let session = dir.path().join("session");
        let ledger = ResultLedger::init(
            &session,
            &dataset,
            &agents(),
            ReasoningMode::Direct,
            ActionMode::NoAction,
        )
        .await
        .unwrap();

        let attempt = session.join("clock_0").join("AppAgent");
        std::fs::create_dir_all(&attempt).unwrap();
        std::fs::write(
            attempt.join("log.json"),
            r#"[
                {"step": 0, "prompt_tokens": 100, "completion_tokens": 10,
                 "action": ["tap", {"detail_type": "coordinates", "detail": [1, 2]}]},
                {"total_steps": 3, "finish_signal": 1, "elapsed_time_initial": 2.0,
                 "elapsed_time_exec": 10.0, "total_prompt_tokens": 400, "total_completion_tokens": 40}
            ]"#,
        )
        .unwrap();

        ledger
            .upsert_execution("clock_0", "AppAgent", true, 0, "emulator-5554")
            .await
            .unwrap();

        let table = ledger.snapshot().unwrap();
        assert_eq!(table.get("clock_0", "AppAgent_total_steps"), Some("3"));
        assert_eq!(table.get("clock_0", "AppAgent_finish_signal"), Some("1"));
        assert_eq!(table.get("clock_0", "AppAgent_total_time"), Some("12"));
        // 3 steps / 3 golden steps
        assert_eq!(table.get("clock_0", "AppAgent_step_ratio"), Some("1"));
        // 400 / (3 + 1)
        assert_eq!(table.get("clock_0", "AppAgent_avg_prompt_tokens"), Some("100"));
    }

    #[tokio::test]
    async fn test_evaluation_upsert_never_reverts_completion() {
        let dir = TempDir::new().unwrap();
        let dataset = write_dataset(dir.path());
        let session = dir.path().join("session");
        let ledger = ResultLedger::init(
            &session,
            &dataset,
            &agents(),
            ReasoningMode::ResultOnly,
            ActionMode::NoAction,
        )
        .await
        .unwrap();

        ledger
            .upsert_execution("clock_0", "AppAgent", true, 0, "emulator-5554")
            .await
            .unwrap();
        ledger
            .upsert_evaluation(
                "clock_0",
                "AppAgent",
                Verdict::Success,
                &json!({"fine_detect": 1}),
                ReasoningMode::ResultOnly,
                ActionMode::NoAction,
            )
            .await
            .unwrap();

        let table = ledger.snapshot().unwrap();
        assert_eq!(table.get("clock_0", "AppAgent_completion"), Some("Y"));
        assert_eq!(
            table.get("clock_0", "result_only_no_action_AppAgent_evaluation"),
            Some("S")
        );
        let details = table
            .get("clock_0", "result_only_no_action_AppAgent_details")
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(details).unwrap();
        assert_eq!(parsed["fine_detect"], 1);
    }

    #[test]
    fn test_verdict_letters() {
        assert_eq!(Verdict::Success.letter(), "S");
        assert_eq!(Verdict::Fail.letter(), "F");
        assert_eq!(Verdict::Error.letter(), "E");
    }

    #[tokio::test]
    async fn test_execution_summary_histogram() {
        let dir = TempDir::new().unwrap();
        let dataset = write_dataset(dir.path());
        let session = dir.path().join("session");
        let ledger = ResultLedger::init(
            &session,
            &dataset,
            &agents(),
            ReasoningMode::Direct,
            ActionMode::NoAction,
        )
        .await
        .unwrap();

        ledger
            .upsert_execution("clock_0", "AppAgent", true, 0, "emulator-5554")
            .await
            .unwrap();
        let attempt = session.join("maps_1").join("AppAgent");
        std::fs::create_dir_all(&attempt).unwrap();
        std::fs::write(
            attempt.join("error.json"),
            r#"[{"error_message": "driver crashed"}]"#,
        )
        .unwrap();
        ledger
            .upsert_execution("maps_1", "AppAgent", false, 1, "emulator-5554")
            .await
            .unwrap();

        let summaries = ledger.execution_summary(&agents()).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].exit_code_counts[0], 1);
        assert_eq!(summaries[0].exit_code_counts[1], 1);
        assert_eq!(
            summaries[0].unexpected_errors,
            vec![("maps_1".to_string(), "driver crashed".to_string())]
        );
    }
}
