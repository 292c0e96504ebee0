//! Bounded out-of-process evaluation slots.
//!
//! Evaluations run in subprocesses (the crate's own binary with the
//! `evaluate` subcommand) for fault isolation: a crash while judging one
//! trace loses that verdict, not the run. Admission is gated by a
//! counting semaphore sized to the configured slot count, so a saturated
//! pool blocks the submitting worker until a slot frees.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ActionMode, ReasoningMode};

/// One evaluation request destined for a subprocess slot.
#[derive(Debug, Clone)]
pub struct EvalJob {
    pub task_id: String,
    pub agent: String,
    pub session_dir: PathBuf,
    pub config_path: PathBuf,
    pub reasoning_mode: ReasoningMode,
    pub action_mode: ActionMode,
    pub skip_key_components: bool,
}

/// Argv for the `evaluate` subcommand handling one job.
pub fn subprocess_args(job: &EvalJob) -> Vec<String> {
    let mut args = vec![
        "evaluate".to_string(),
        "--config".to_string(),
        job.config_path.to_string_lossy().into_owned(),
        "--session-dir".to_string(),
        job.session_dir.to_string_lossy().into_owned(),
        "--task-id".to_string(),
        job.task_id.clone(),
        "--reasoning-mode".to_string(),
        job.reasoning_mode.as_str().to_string(),
        "--action-mode".to_string(),
        job.action_mode.as_str().to_string(),
    ];
    if !job.agent.is_empty() {
        args.push("--agent".to_string());
        args.push(job.agent.clone());
    }
    if job.skip_key_components {
        args.push("--skip-key-components".to_string());
    }
    args
}

/// Pool of evaluator subprocess slots.
pub struct EvaluatorPool {
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EvaluatorPool {
    pub fn new(max_subprocesses: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_subprocesses.max(1))),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Submits a job, blocking until a slot is free. The subprocess runs
    /// detached from the caller; failures are logged, and the ledger cell
    /// simply keeps its sentinel for a crashed evaluator.
    pub async fn submit(&self, job: EvalJob) {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            // The semaphore is never closed while the pool is alive.
            return;
        };

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let exe = match std::env::current_exe() {
                Ok(exe) => exe,
                Err(e) => {
                    error!(error = %e, "Cannot locate own binary for evaluator subprocess");
                    return;
                }
            };
            let args = subprocess_args(&job);
            info!(
                task = %job.task_id,
                agent = %job.agent,
                "Evaluator subprocess started"
            );
            match tokio::process::Command::new(exe).args(&args).status().await {
                Ok(status) if status.success() => {
                    info!(task = %job.task_id, agent = %job.agent, "Evaluator subprocess finished");
                }
                Ok(status) => {
                    warn!(
                        task = %job.task_id,
                        agent = %job.agent,
                        code = status.code().unwrap_or(-1),
                        "Evaluator subprocess failed"
                    );
                }
                Err(e) => {
                    error!(task = %job.task_id, error = %e, "Evaluator subprocess did not spawn");
                }
            }
        });
        self.handles.lock().await.push(handle);
    }

    /// Blocks until every submitted evaluator has exited.
    pub async fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().await;
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Evaluator task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subprocess_args() {
        let job = EvalJob {
            task_id: "clock_0".to_string(),
            agent: "AppAgent".to_string(),
            session_dir: PathBuf::from("/tmp/session-1"),
            config_path: PathBuf::from("config.yaml"),
            reasoning_mode: ReasoningMode::Direct,
            action_mode: ActionMode::WithAction,
            skip_key_components: true,
        };
        let args = subprocess_args(&job);
        assert_eq!(args[0], "evaluate");
        assert!(args.windows(2).any(|w| w == ["--task-id", "clock_0"]));
        assert!(args.windows(2).any(|w| w == ["--agent", "AppAgent"]));
        assert!(args.windows(2).any(|w| w == ["--reasoning-mode", "direct"]));
        assert!(args.windows(2).any(|w| w == ["--action-mode", "with_action"]));
        assert!(args.contains(&"--skip-key-components".to_string()));
    }

    #[test]
    fn test_subprocess_args_bare_agent() {
        let job = EvalJob {
            task_id: "clock_0".to_string(),
            agent: String::new(),
            session_dir: PathBuf::from("/tmp/session-1"),
            config_path: PathBuf::from("config.yaml"),
            reasoning_mode: ReasoningMode::ResultOnly,
            action_mode: ActionMode::NoAction,
            skip_key_components: false,
        };
        let args = subprocess_args(&job);
        assert!(!args.contains(&"--agent".to_string()));
        assert!(!args.contains(&"--skip-key-components".to_string()));
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_pool() {
        let pool = EvaluatorPool::new(2);
        pool.wait_idle().await;
    }
}
