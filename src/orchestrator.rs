//! Session orchestration.
//!
//! Wires config, devices, ledger, runner, scheduler and evaluator pool
//! into one run. Per (agent, task) work item the orchestrator decides
//! execute / evaluate / skip from the ledger snapshot and the run mode:
//! execution happens only while the completion cell still holds its
//! sentinel, evaluation only after completion and only into cells that
//! are unwritten or explicitly overwritten. Within one pair execution
//! strictly precedes evaluation; across devices and evaluator slots there
//! is no ordering.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{ActionMode, BenchConfig, ReasoningMode, RunMode};
use crate::dataset::{self, Task};
use crate::device::{emulator, AdbController, Device, DeviceCapability};
use crate::error::{DatasetError, DeviceError, SessionError};
use crate::eval::{EvalEngine, EvalJob, EvaluatorPool};
use crate::ledger::{
    column_prefix, evaluation_prefix, AgentSummary, LedgerTable, ResultLedger, SENTINEL_TEXT,
    EXIT_CODE_MEANINGS,
};
use crate::runner::AgentRunner;
use crate::scheduler::{DeviceWorkerPool, WorkError, WorkHandler, WorkItem};

/// Options resolved from the CLI for one session run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Requested agent names; empty means every configured agent (exec
    /// modes) or a bare evaluation scope (eval mode).
    pub agents: Vec<String>,
    /// Restrict the run to a single task.
    pub task_filter: Option<String>,
    pub reasoning_mode: ReasoningMode,
    pub action_mode: ActionMode,
    pub skip_key_components: bool,
    /// Re-evaluate cells that already hold a verdict.
    pub overwrite: bool,
    /// Run evaluations inline and serially instead of in subprocess slots.
    pub inline_eval: bool,
    /// Launch and tear down an emulator fleet for this session.
    pub setup_emulator: bool,
    /// Config path forwarded to evaluator subprocesses.
    pub config_path: PathBuf,
}

/// Per-item decision maker; the scheduler's work handler.
pub struct Orchestrator {
    config: BenchConfig,
    options: RunOptions,
    ledger: ResultLedger,
    snapshot: LedgerTable,
    runner: AgentRunner,
    adb: AdbController,
    pool: EvaluatorPool,
    engine: Option<EvalEngine>,
}

impl Orchestrator {
    async fn handle(&self, item: &WorkItem, device: &Device) -> Result<(), SessionError> {
        let task = &item.task;
        let agent = &item.agent;
        let mut completed = true;

        if self.options.mode.executes() && !agent.is_empty() {
            let completion_col = format!("{}completion", column_prefix(agent));
            if self.snapshot.get(&task.task_identifier, &completion_col) == Some(SENTINEL_TEXT) {
                completed = self.execute(task, agent, device).await?;
            }
        }

        if self.options.mode.evaluates() && completed {
            let eval_col = format!(
                "{}evaluation",
                evaluation_prefix(self.options.reasoning_mode, self.options.action_mode, agent)
            );
            let already_evaluated = self
                .snapshot
                .get(&task.task_identifier, &eval_col)
                .map(|v| v != SENTINEL_TEXT)
                .unwrap_or(false);
            if already_evaluated && !self.options.overwrite {
                info!(
                    task = %task.task_identifier,
                    agent,
                    "Evaluation already recorded; skipping"
                );
                return Ok(());
            }

            if let Some(engine) = &self.engine {
                info!(task = %task.task_identifier, agent, "Evaluating inline");
                engine.run(task, agent).await?;
            } else {
                self.pool
                    .submit(EvalJob {
                        task_id: task.task_identifier.clone(),
                        agent: agent.clone(),
                        session_dir: self.ledger.session_dir().to_path_buf(),
                        config_path: self.options.config_path.clone(),
                        reasoning_mode: self.options.reasoning_mode,
                        action_mode: self.options.action_mode,
                        skip_key_components: self.options.skip_key_components,
                    })
                    .await;
            }
        }

        Ok(())
    }

    /// One execution attempt: app setup, agent run, app teardown, ledger
    /// upsert. App lifecycle failures are tolerated; the agent may still
    /// recover on its own.
    async fn execute(
        &self,
        task: &Task,
        agent: &str,
        device: &Device,
    ) -> Result<bool, SessionError> {
        let command = self.config.agent(agent)?;

        if !task.is_cross_app() {
            if let Err(e) = self
                .adb
                .launch_app(device, &task.adb_app, &task.adb_home_page)
                .await
            {
                warn!(task = %task.task_identifier, error = %e, "App setup failed");
            }
        }

        info!(task = %task.task_identifier, agent, "Executing task");
        let outcome = self.runner.execute(command, task, device).await?;

        let close_target = if task.is_cross_app() {
            None
        } else {
            Some(task.adb_app.as_str())
        };
        if let Err(e) = self.adb.stop_app(device, close_target, true).await {
            warn!(task = %task.task_identifier, error = %e, "App teardown failed");
        }

        self.ledger
            .upsert_execution(
                &task.task_identifier,
                agent,
                outcome.completed,
                outcome.exit_code,
                &device.serial,
            )
            .await?;
        Ok(outcome.completed)
    }
}

#[async_trait]
impl WorkHandler for Orchestrator {
    async fn process(&self, item: &WorkItem, device: &Device) -> Result<(), WorkError> {
        self.handle(item, device).await.map_err(|e| -> WorkError { Box::new(e) })
    }
}

/// Resolves the agent scope for a run: explicit names, every configured
/// agent for executing modes, or the bare scope for pure evaluation.
pub fn resolve_agent_scope(
    config: &BenchConfig,
    mode: RunMode,
    requested: &[String],
) -> Result<Vec<String>, SessionError> {
    if mode.executes() {
        let agents: Vec<String> = if requested.is_empty() {
            config.agents.iter().map(|a| a.name.clone()).collect()
        } else {
            requested.to_vec()
        };
        for agent in &agents {
            config.agent(agent)?;
        }
        Ok(agents)
    } else if requested.is_empty() {
        Ok(vec![String::new()])
    } else {
        Ok(requested.to_vec())
    }
}

/// Builds the (agent × task) work list, agents outermost.
pub fn build_work_items(agents: &[String], tasks: &[Task]) -> Vec<WorkItem> {
    agents
        .iter()
        .flat_map(|agent| {
            tasks
                .iter()
                .map(move |task| WorkItem::new(agent.clone(), task.clone()))
        })
        .collect()
}

/// Runs one full benchmark session.
pub async fn run_session(config: BenchConfig, options: RunOptions) -> Result<(), SessionError> {
    let session_dir = config.session_dir();
    std::fs::create_dir_all(&session_dir)?;
    let adb = AdbController::new(&config.adb_path);

    let (devices, fleet_launched) = if options.mode.executes() {
        if options.setup_emulator {
            (emulator::launch_fleet(&adb, &config.emulator).await?, true)
        } else {
            let devices = adb.list_devices().await?;
            if devices.is_empty() {
                return Err(DeviceError::NoDevices.into());
            }
            info!(count = devices.len(), "Devices attached");
            (devices, false)
        }
    } else {
        // Pure evaluation needs no device; one placeholder keeps the
        // sequential scheduler path.
        (vec![Device::attached("")], false)
    };

    let agents = resolve_agent_scope(&config, options.mode, &options.agents)?;

    let ledger = ResultLedger::init(
        &session_dir,
        &config.dataset_path,
        &agents,
        options.reasoning_mode,
        options.action_mode,
    )
    .await?;

    let mut tasks = dataset::load_tasks(ledger.csv_path())?;
    if let Some(filter) = &options.task_filter {
        tasks.retain(|t| &t.task_identifier == filter);
        if tasks.is_empty() {
            return Err(DatasetError::TaskNotFound(filter.clone()).into());
        }
    }
    let snapshot = ledger.snapshot()?;

    let engine = if options.inline_eval && options.mode.evaluates() {
        Some(EvalEngine::from_config(
            &config,
            session_dir.clone(),
            options.reasoning_mode,
            options.action_mode,
            options.skip_key_components,
        )?)
    } else {
        None
    };

    let runner = AgentRunner::new(
        session_dir.clone(),
        adb.clone(),
        &config.default_keyboard_package,
        &config.adb_path,
        config.max_rounds,
        config.judge.api_key.clone(),
        config.agent_model.clone(),
        config.agent_timeout(),
    );

    let items = build_work_items(&agents, &tasks);
    info!(
        items = items.len(),
        devices = devices.len(),
        mode = ?options.mode,
        "Session starting"
    );

    let pool = EvaluatorPool::new(config.max_eval_subprocess);
    let orchestrator = Arc::new(Orchestrator {
        config,
        options: options.clone(),
        ledger: ledger.clone(),
        snapshot,
        runner,
        adb: adb.clone(),
        pool,
        engine,
    });

    let report = DeviceWorkerPool::run_all(items, &devices, orchestrator.clone()).await;
    info!(
        processed = report.processed,
        failed = report.failed,
        "Work queue drained"
    );

    if fleet_launched {
        emulator::terminate_fleet(&adb, &devices).await;
    }

    if options.mode != RunMode::Eval {
        info!("All execution completed");
        if options.task_filter.is_none() {
            for summary in ledger.execution_summary(&agents)? {
                log_execution_summary(&summary);
            }
        }
    }

    orchestrator.pool.wait_idle().await;
    if options.mode != RunMode::Exec {
        info!("All evaluation finished");
    }
    Ok(())
}

fn log_execution_summary(summary: &AgentSummary) {
    for (code, (count, meaning)) in summary
        .exit_code_counts
        .iter()
        .zip(EXIT_CODE_MEANINGS)
        .enumerate()
    {
        info!(
            agent = %summary.agent,
            exit_code = code,
            meaning,
            tasks = count,
            "Execution summary"
        );
    }
    for (task, error) in &summary.unexpected_errors {
        warn!(
            agent = %summary.agent,
            task = %task,
            error = %error,
            "Unexpected error; decide rerun by resetting the completion cell"
        );
    }
}
