//! Cross-app trace evaluation.
//!
//! Stage 1 segments the trace: the judge receives every screenshot
//! (low-detail) plus the ordered expected app list and attributes an
//! inclusive screenshot window to each app visit. Stage 2 walks the
//! pre-decomposed subtasks in order, judging each against its window's
//! slice; memory produced by one subtask is summarized from its window
//! and threaded into the prompts of later subtasks. Segmentation must
//! precede judgment: subtask correctness depends on the right
//! sub-sequence and on memory from earlier app visits, and a combined
//! call would make failures unattributable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use super::judge::{Judge, JudgeRequest};
use super::parse::{
    parse_app_windows, placeholder_keys, validate_windows, windows_to_json, AppWindow,
};
use super::prompts::{
    memory_user_text, segmentation_user_text, MEMORY_SYSTEM_PROMPT, SEGMENTATION_SYSTEM_PROMPT,
};
use super::single_app::run_fine_gate;
use super::trace::{encode_screenshots, screenshot_files, ImageDetail};
use super::EvaluationOutcome;
use crate::config::{ActionMode, ReasoningMode};
use crate::dataset::{SplitTask, Subtask, Task};
use crate::error::EvalError;

/// Segmentation retry policy.
const SEGMENTATION_RETRIES: u32 = 3;
const SEGMENTATION_DELAY: Duration = Duration::from_secs(3);
/// Per-subtask fine-gate retry policy.
const FINE_GATE_RETRIES: u32 = 5;
const FINE_GATE_DELAY: Duration = Duration::from_secs(5);

/// Segmentation + per-subtask judgment over a cross-app trace.
pub struct CrossAppEvaluator {
    judge: Arc<dyn Judge>,
    seg_retries: u32,
    seg_delay: Duration,
    fine_retries: u32,
    fine_delay: Duration,
}

impl CrossAppEvaluator {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self {
            judge,
            seg_retries: SEGMENTATION_RETRIES,
            seg_delay: SEGMENTATION_DELAY,
            fine_retries: FINE_GATE_RETRIES,
            fine_delay: FINE_GATE_DELAY,
        }
    }

    /// Overrides both retry policies.
    pub fn with_retry_policy(mut self, retries: u32, delay: Duration) -> Self {
        self.seg_retries = retries;
        self.seg_delay = delay;
        self.fine_retries = retries;
        self.fine_delay = delay;
        self
    }

    /// Evaluates one cross-app attempt against its subtask decomposition.
    pub async fn evaluate(
        &self,
        task: &Task,
        split: &SplitTask,
        attempt_dir: &Path,
    ) -> Result<EvaluationOutcome, EvalError> {
        // Cross-app judgment always runs terse; annotated screenshots are
        // used when the producing side emitted them.
        let reasoning_mode = ReasoningMode::ResultOnly;
        let annotated = attempt_dir.join("tap_and_text");
        let (screenshot_dir, action_mode) = if annotated.is_dir() {
            (annotated, ActionMode::WithAction)
        } else {
            (attempt_dir.to_path_buf(), ActionMode::NoAction)
        };

        let total = screenshot_files(&screenshot_dir).len();
        if total == 0 {
            return Ok(EvaluationOutcome {
                score: -1,
                detail: json!({}),
            });
        }

        let mut detail = serde_json::Map::new();

        let windows = self
            .segment(task, split, &screenshot_dir, total, &mut detail)
            .await?;
        let Some(windows) = windows else {
            // Stage 1 produced windows that failed validation.
            return Ok(EvaluationOutcome {
                score: 0,
                detail: serde_json::Value::Object(detail),
            });
        };

        detail.insert("subtasks".to_string(), json!(split.subtasks));

        let mut memory: HashMap<String, String> = HashMap::new();
        let names = split.window_names();
        for ((name, window), subtask) in names
            .iter()
            .zip(windows.iter().map(|(_, w)| w))
            .zip(&split.subtasks)
        {
            detail.insert(
                format!("slices_{}", name),
                json!([window.start, window.end]),
            );

            let history = resolve_history(subtask, &memory)?;

            if window.is_absent() {
                // The expected app never appears; its subtask cannot have
                // been performed.
                detail.insert(format!("content_{}", name), json!("app absent from trace"));
                info!(task = %task.task_identifier, app = %name, "Subtask app absent; evaluation fails");
                return Ok(EvaluationOutcome {
                    score: 0,
                    detail: serde_json::Value::Object(detail),
                });
            }

            let fine = run_fine_gate(
                self.judge.as_ref(),
                &subtask.text,
                &screenshot_dir,
                Some((window.start, window.end)),
                reasoning_mode,
                action_mode,
                "",
                &history,
                self.fine_retries,
                self.fine_delay,
            )
            .await?;
            detail.insert(format!("content_{}", name), json!(fine.content));

            if fine.result == 0 {
                info!(
                    task = %task.task_identifier,
                    subtask = %name,
                    "Subtask failed; short-circuiting evaluation"
                );
                return Ok(EvaluationOutcome {
                    score: 0,
                    detail: serde_json::Value::Object(detail),
                });
            }

            if let Some(key) = &subtask.memory {
                let summary = self
                    .summarize_window(&screenshot_dir, *window, key)
                    .await?;
                memory.insert(key.clone(), summary);
            }
        }

        detail.insert("memory_dict".to_string(), json!(memory));
        Ok(EvaluationOutcome {
            score: 1,
            detail: serde_json::Value::Object(detail),
        })
    }

    /// Stage 1: asks the judge for app windows and validates them.
    /// Returns `Ok(None)` when the parsed windows fail validation, and an
    /// error when retries are exhausted without a parsable reply.
    async fn segment(
        &self,
        task: &Task,
        split: &SplitTask,
        screenshot_dir: &Path,
        total: usize,
        detail: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<Vec<(String, AppWindow)>>, EvalError> {
        let images = encode_screenshots(screenshot_dir, None, ImageDetail::Low)?;
        let request = JudgeRequest {
            system_prompt: SEGMENTATION_SYSTEM_PROMPT.to_string(),
            user_text: segmentation_user_text(&split.app_order()),
            images,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.seg_retries {
            match self.judge.ask(&request).await {
                Ok(reply) => {
                    let windows = parse_app_windows(&reply.content);
                    if windows.is_empty() {
                        last_error = "no app windows in segmentation reply".to_string();
                        warn!(attempt, task = %task.task_identifier, "Segmentation reply unparsable");
                    } else {
                        detail.insert("parsed_response".to_string(), windows_to_json(&windows));
                        let expected = split.window_names().len();
                        if windows.len() == expected && validate_windows(&windows, total) {
                            return Ok(Some(windows));
                        }
                        info!(
                            task = %task.task_identifier,
                            got = windows.len(),
                            expected,
                            "Segmentation windows failed validation"
                        );
                        return Ok(None);
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(attempt, task = %task.task_identifier, error = %last_error, "Segmentation call failed");
                }
            }
            if attempt < self.seg_retries {
                tokio::time::sleep(self.seg_delay).await;
            }
        }
        Err(EvalError::SegmentationExhausted(last_error))
    }

    /// Summarizes one window's screenshots under a memory key.
    async fn summarize_window(
        &self,
        screenshot_dir: &Path,
        window: AppWindow,
        memory_key: &str,
    ) -> Result<String, EvalError> {
        let request = JudgeRequest {
            system_prompt: MEMORY_SYSTEM_PROMPT.to_string(),
            user_text: memory_user_text(memory_key),
            images: encode_screenshots(
                screenshot_dir,
                Some((window.start, window.end)),
                ImageDetail::High,
            )?,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.seg_retries {
            match self.judge.ask(&request).await {
                Ok(reply) => return Ok(reply.content),
                Err(e) => {
                    warn!(attempt, memory_key, error = %e, "Memory summarization failed");
                    last_error = e.to_string();
                }
            }
            if attempt < self.seg_retries {
                tokio::time::sleep(self.seg_delay).await;
            }
        }
        Err(EvalError::SummarizationExhausted {
            key: memory_key.to_string(),
            message: last_error,
        })
    }
}

/// Collects the (key, memory) pairs a subtask's placeholders reference.
/// A placeholder with no stored memory fails the evaluation; no default
/// is ever guessed.
fn resolve_history(
    subtask: &Subtask,
    memory: &HashMap<String, String>,
) -> Result<Vec<(String, String)>, EvalError> {
    if !subtask.history {
        return Ok(Vec::new());
    }
    let mut history = Vec::new();
    for key in placeholder_keys(&subtask.text) {
        let value = memory
            .get(&key)
            .ok_or_else(|| EvalError::MissingMemoryKey(key.clone()))?;
        history.push((key, value.clone()));
    }
    Ok(history)
}
