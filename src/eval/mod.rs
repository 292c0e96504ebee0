//! Evaluation engine.
//!
//! Judges whether a screenshot trace satisfies its task. Single-app
//! traces go through the coarse OCR gate and the fine VLM gate
//! ([`single_app`]); cross-app traces are first segmented into app
//! windows and then judged subtask by subtask with threaded memory
//! ([`cross_app`]). [`EvalEngine`] is the common entry used both inline
//! and by the `evaluate` subprocess the [`pool`] spawns; it maps every
//! outcome (including evaluator errors) onto a ledger verdict.

pub mod cross_app;
pub mod judge;
pub mod ocr;
pub mod parse;
pub mod pool;
pub mod prompts;
pub mod single_app;
pub mod trace;

pub use cross_app::CrossAppEvaluator;
pub use pool::{EvalJob, EvaluatorPool};
pub use single_app::{GateOptions, SingleAppEvaluator};

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::artifact::attempt_dir;
use crate::config::{ActionMode, BenchConfig, ReasoningMode};
use crate::dataset::{load_split_task, Task};
use crate::error::EvalError;
use crate::ledger::{ResultLedger, Verdict};

/// Result of one evaluation: the ternary score and the detail blob
/// recorded next to the verdict.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    /// 1 = success, 0 = fail, -1 = no evidence / evaluation error.
    pub score: i8,
    pub detail: serde_json::Value,
}

impl EvaluationOutcome {
    pub fn verdict(&self) -> Verdict {
        match self.score {
            1 => Verdict::Success,
            0 => Verdict::Fail,
            _ => Verdict::Error,
        }
    }
}

/// Dispatches one (task, agent) evaluation and records the verdict.
pub struct EvalEngine {
    single: SingleAppEvaluator,
    cross: CrossAppEvaluator,
    ledger: ResultLedger,
    split_dir: PathBuf,
    reasoning_mode: ReasoningMode,
    action_mode: ActionMode,
    skip_key_components: bool,
}

impl EvalEngine {
    pub fn new(
        single: SingleAppEvaluator,
        cross: CrossAppEvaluator,
        ledger: ResultLedger,
        split_dir: PathBuf,
        reasoning_mode: ReasoningMode,
        action_mode: ActionMode,
        skip_key_components: bool,
    ) -> Self {
        Self {
            single,
            cross,
            ledger,
            split_dir,
            reasoning_mode,
            action_mode,
            skip_key_components,
        }
    }

    /// Builds an engine with the HTTP judge and OCR collaborators from
    /// the session config.
    pub fn from_config(
        config: &BenchConfig,
        session_dir: PathBuf,
        reasoning_mode: ReasoningMode,
        action_mode: ActionMode,
        skip_key_components: bool,
    ) -> Result<Self, EvalError> {
        let judge: Arc<dyn judge::Judge> = Arc::new(judge::VlmJudgeClient::new(&config.judge)?);
        let ocr: Arc<dyn ocr::OcrProvider> = Arc::new(ocr::HttpOcrClient::new(&config.ocr)?);
        Ok(Self::new(
            SingleAppEvaluator::new(ocr, Arc::clone(&judge)),
            CrossAppEvaluator::new(judge),
            ResultLedger::open(session_dir),
            config.cross_app_split_dir.clone(),
            reasoning_mode,
            action_mode,
            skip_key_components,
        ))
    }

    /// Evaluates one (task, agent) pair and records the verdict in the
    /// ledger. Evaluator failures become the error verdict; only a ledger
    /// write failure escapes as an error.
    pub async fn run(&self, task: &Task, agent: &str) -> Result<EvaluationOutcome, EvalError> {
        let attempt = attempt_dir(
            self.ledger.session_dir(),
            &task.task_identifier,
            agent,
        );

        let result = if task.is_cross_app() {
            match load_split_task(&self.split_dir, &task.task_identifier) {
                Ok(split) => self.cross.evaluate(task, &split, &attempt).await,
                Err(e) => Err(EvalError::from(e)),
            }
        } else {
            let options = GateOptions {
                skip_key_components: self.skip_key_components,
                reasoning_mode: self.reasoning_mode,
                action_mode: self.action_mode,
            };
            self.single.evaluate(task, &attempt, &options).await
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    task = %task.task_identifier,
                    agent,
                    error = %e,
                    "Evaluation errored; recording error verdict"
                );
                EvaluationOutcome {
                    score: -1,
                    detail: json!({"error": e.to_string()}),
                }
            }
        };

        match outcome.verdict() {
            Verdict::Success => info!(task = %task.task_identifier, agent, "Task is successful"),
            Verdict::Fail => info!(task = %task.task_identifier, agent, "Task is failed"),
            Verdict::Error => info!(task = %task.task_identifier, agent, "Task has no usable evidence"),
        }

        self.ledger
            .upsert_evaluation(
                &task.task_identifier,
                agent,
                outcome.verdict(),
                &outcome.detail,
                self.reasoning_mode,
                self.action_mode,
            )
            .await?;
        Ok(outcome)
    }
}
