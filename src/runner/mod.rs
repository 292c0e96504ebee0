//! Agent execution.
//!
//! Runs one external agent for one task on one device: selects the input
//! method, wipes and recreates the attempt's output directory, spawns the
//! agent process with its working directory pinned to the agent install
//! path, captures stdio byte-for-byte, and maps the exit status onto the
//! benchmark's completion contract.

pub mod command;

pub use command::{build_args, AgentCommand, Invocation};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use encoding_rs::{Encoding, GBK, UTF_8};
use tracing::{info, warn};

use crate::dataset::{Language, Task};
use crate::device::{AdbController, Device};
use crate::error::RunnerError;

/// Exit codes an agent may finish with. The attempt counts as completed
/// for codes 0 (finished), 2 (expected error, handled) and 4 (step budget
/// exhausted); codes 1 (unexpected error) and 3 (expected error, rerun)
/// leave the task eligible for another attempt.
pub const COMPLETED_EXIT_CODES: [i32; 3] = [0, 2, 4];

/// Outcome of one agent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub completed: bool,
    pub exit_code: i32,
}

impl ExecutionOutcome {
    pub fn from_exit_code(exit_code: i32) -> Self {
        Self {
            completed: COMPLETED_EXIT_CODES.contains(&exit_code),
            exit_code,
        }
    }
}

/// Decodes bytes with the first codec that accepts them without errors.
/// UTF-8 is tried first, then GBK for agents writing legacy CJK output.
pub fn decode_with_fallback(bytes: &[u8]) -> Result<String, RunnerError> {
    let codecs: [&Encoding; 2] = [UTF_8, GBK];
    for codec in codecs {
        let (text, _, had_errors) = codec.decode(bytes);
        if !had_errors {
            return Ok(text.into_owned());
        }
    }
    Err(RunnerError::Decode)
}

/// CRLF normalization applied to captured stdio before persisting.
fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Runs external agents against tasks.
pub struct AgentRunner {
    session_dir: PathBuf,
    adb: AdbController,
    default_ime: String,
    adb_path: String,
    max_rounds: Option<u32>,
    api_key: Option<String>,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_dir: impl Into<PathBuf>,
        adb: AdbController,
        default_ime: impl Into<String>,
        adb_path: impl Into<String>,
        max_rounds: Option<u32>,
        api_key: Option<String>,
        model: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            session_dir: session_dir.into(),
            adb,
            default_ime: default_ime.into(),
            adb_path: adb_path.into(),
            max_rounds,
            api_key,
            model,
            timeout,
        }
    }

    /// Executes one (agent, task) attempt on the given device.
    pub async fn execute(
        &self,
        agent: &AgentCommand,
        task: &Task,
        device: &Device,
    ) -> Result<ExecutionOutcome, RunnerError> {
        let use_adb_keyboard =
            task.task_language == Language::Chinese || agent.default_adb_keyboard;
        self.adb
            .select_keyboard(device, use_adb_keyboard, &self.default_ime)
            .await?;

        let output_dir = self.prepare_output_dir(&task.task_identifier, &agent.name)?;
        let invocation = Invocation {
            task,
            description: task.full_description(),
            output_dir: &output_dir,
            device,
            step_budget: task.step_budget(self.max_rounds),
            adb_path: &self.adb_path,
            api_key: self.api_key.as_deref(),
            model: self.model.as_deref(),
        };
        let args = build_args(agent, &invocation);

        info!(
            agent = %agent.name,
            task = %task.task_identifier,
            device = %device.serial,
            program = %agent.program,
            "Launching agent"
        );

        let child = tokio::process::Command::new(&agent.program)
            .args(&args)
            .current_dir(&agent.repo_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn {
                program: agent.program.clone(),
                source: e,
            })?;

        let output = match self.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, child.wait_with_output()).await {
                    Ok(output) => output?,
                    Err(_) => {
                        warn!(
                            agent = %agent.name,
                            task = %task.task_identifier,
                            timeout_secs = timeout.as_secs(),
                            "Agent process timed out; recording as unexpected error"
                        );
                        // Dropping the timed-out future kills the child
                        // (kill_on_drop); record the timeout outcome.
                        return Ok(ExecutionOutcome {
                            completed: false,
                            exit_code: 1,
                        });
                    }
                }
            }
            None => child.wait_with_output().await?,
        };

        self.persist_stdio(&output_dir, &agent.name, &output.stdout, "stdout.txt")?;
        self.persist_stdio(&output_dir, &agent.name, &output.stderr, "stderr.txt")?;

        let exit_code = output.status.code().unwrap_or(1);
        let outcome = ExecutionOutcome::from_exit_code(exit_code);
        info!(
            agent = %agent.name,
            task = %task.task_identifier,
            exit_code,
            completed = outcome.completed,
            "Agent finished"
        );
        Ok(outcome)
    }

    /// Wipes and recreates the attempt directory so every attempt starts
    /// from an empty artifact set.
    fn prepare_output_dir(&self, task_id: &str, agent: &str) -> Result<PathBuf, RunnerError> {
        let task_dir = self.session_dir.join(task_id);
        std::fs::create_dir_all(&task_dir)?;
        let output_dir = task_dir.join(agent);
        if output_dir.exists() {
            std::fs::remove_dir_all(&output_dir)?;
        }
        std::fs::create_dir_all(&output_dir)?;
        Ok(output_dir)
    }

    fn persist_stdio(
        &self,
        output_dir: &Path,
        agent: &str,
        bytes: &[u8],
        file: &str,
    ) -> Result<(), RunnerError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let text = normalize_line_endings(&decode_with_fallback(bytes)?);
        std::fs::write(output_dir.join(file), format!("<{}>\n{}", agent, text))?;
        Ok(())
    }
}
