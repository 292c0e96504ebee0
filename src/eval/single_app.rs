//! Single-app trace evaluation: a two-gate, short-circuiting pipeline.
//!
//! The coarse gate OCRs screenshots newest-to-oldest and passes at the
//! first one containing every key-component substring; a trace with no
//! screenshots scores as no-evidence, and a trace that matches nothing
//! fails without spending a judge call. The fine gate sends the full
//! trace and the judgment prompt to the VLM judge and parses the verdict
//! token, retrying a fixed number of times before conservatively scoring
//! a fail.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{info, warn};

use super::judge::{Judge, JudgeRequest, JudgeUsage};
use super::ocr::OcrProvider;
use super::parse::{csv_safe, parse_verdict};
use super::prompts::{judgment_prompt, judgment_system_prompt};
use super::trace::{encode_screenshots, screenshot_files, trace_dir_for_mode, ImageDetail};
use super::EvaluationOutcome;
use crate::artifact::LogArtifact;
use crate::config::{ActionMode, ReasoningMode};
use crate::dataset::Task;
use crate::error::EvalError;

/// Fine-gate retry policy.
const FINE_GATE_RETRIES: u32 = 5;
const FINE_GATE_DELAY: Duration = Duration::from_secs(5);

/// Options threaded from the CLI into one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct GateOptions {
    pub skip_key_components: bool,
    pub reasoning_mode: ReasoningMode,
    pub action_mode: ActionMode,
}

/// Result of one fine-gate run.
pub(crate) struct FineGateResult {
    pub result: u8,
    pub reason: String,
    pub content: String,
    pub usage: JudgeUsage,
}

/// Runs the fine gate over a trace directory (optionally a 1-based
/// inclusive window of it), retrying transient judge failures. Retry
/// exhaustion scores fail with an empty reason rather than erroring.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_fine_gate(
    judge: &dyn Judge,
    task_description: &str,
    trace_dir: &Path,
    window: Option<(i64, i64)>,
    reasoning_mode: ReasoningMode,
    action_mode: ActionMode,
    action_text: &str,
    history: &[(String, String)],
    retries: u32,
    delay: Duration,
) -> Result<FineGateResult, EvalError> {
    let images = encode_screenshots(trace_dir, window, ImageDetail::High)?;
    let history_refs: Vec<(&str, &str)> = history
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let request = JudgeRequest {
        system_prompt: judgment_system_prompt(action_mode),
        user_text: judgment_prompt(
            task_description,
            reasoning_mode,
            action_mode,
            action_text,
            &history_refs,
        ),
        images,
    };

    for attempt in 1..=retries {
        let reply = match judge.ask(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(attempt, error = %e, "Fine gate call failed");
                if attempt < retries {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
        };
        match parse_verdict(&reply.content, reasoning_mode) {
            Ok(verdict) => {
                return Ok(FineGateResult {
                    result: verdict.result,
                    reason: verdict.reason,
                    content: reply.content,
                    usage: reply.usage,
                });
            }
            Err(e) => {
                // Model nondeterminism; retry like a transport failure.
                warn!(attempt, error = %e, "Fine gate verdict unparsable");
                if attempt < retries {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Ok(FineGateResult {
        result: 0,
        reason: String::new(),
        content: String::new(),
        usage: JudgeUsage::default(),
    })
}

/// OCR gate + LLM judgment over a single-app trace.
pub struct SingleAppEvaluator {
    ocr: Arc<dyn OcrProvider>,
    judge: Arc<dyn Judge>,
    retries: u32,
    retry_delay: Duration,
}

impl SingleAppEvaluator {
    pub fn new(ocr: Arc<dyn OcrProvider>, judge: Arc<dyn Judge>) -> Self {
        Self {
            ocr,
            judge,
            retries: FINE_GATE_RETRIES,
            retry_delay: FINE_GATE_DELAY,
        }
    }

    /// Overrides the fine-gate retry policy.
    pub fn with_retry_policy(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Evaluates one attempt directory against its task.
    pub async fn evaluate(
        &self,
        task: &Task,
        attempt_dir: &Path,
        options: &GateOptions,
    ) -> Result<EvaluationOutcome, EvalError> {
        let raw_screenshots = screenshot_files(attempt_dir);
        let total = raw_screenshots.len();
        if total == 0 {
            // Distinct no-evidence verdict, never conflated with a fail.
            return Ok(EvaluationOutcome {
                score: -1,
                detail: json!({}),
            });
        }

        let matched: serde_json::Value;
        let coarse_passed: bool;
        if options.skip_key_components {
            matched = json!(-1);
            coarse_passed = true;
        } else {
            let matched_file = self.coarse_gate(task, &raw_screenshots).await?;
            coarse_passed = matched_file.is_some();
            matched = json!(matched_file.unwrap_or_default());
        }

        let mut detail = serde_json::Map::new();
        detail.insert(
            "coarse_detect".to_string(),
            json!(if coarse_passed { 1 } else { 0 }),
        );

        let mut score = 0i8;
        if coarse_passed {
            let trace_dir = trace_dir_for_mode(attempt_dir, options.action_mode);
            let action_text = if options.action_mode == ActionMode::TextAction {
                LogArtifact::load(&attempt_dir.join("log.json"))
                    .map(|log| log.action_text())
                    .unwrap_or_default()
            } else {
                String::new()
            };

            let started = Instant::now();
            let fine = run_fine_gate(
                self.judge.as_ref(),
                &task.task_description,
                &trace_dir,
                None,
                options.reasoning_mode,
                options.action_mode,
                &action_text,
                &[],
                self.retries,
                self.retry_delay,
            )
            .await?;
            let time_taken = started.elapsed().as_secs();

            if fine.result == 1 {
                score = 1;
            }
            detail.insert("matched".to_string(), matched);
            detail.insert("total_num".to_string(), json!(total));
            detail.insert("gpt_token_taken".to_string(), json!(fine.usage.total_tokens));
            detail.insert("time_taken".to_string(), json!(time_taken));
            detail.insert("fine_detect".to_string(), json!(fine.result));
            detail.insert(
                "fine_detect_reason".to_string(),
                json!(csv_safe(&fine.reason)),
            );
            detail.insert("api_cost".to_string(), json!(fine.usage.api_cost()));
        }

        Ok(EvaluationOutcome {
            score,
            detail: serde_json::Value::Object(detail),
        })
    }

    /// OCRs screenshots newest-to-oldest; passes at the first whose text
    /// contains all key components (case-insensitive).
    async fn coarse_gate(
        &self,
        task: &Task,
        screenshots: &[std::path::PathBuf],
    ) -> Result<Option<String>, EvalError> {
        let components: Vec<String> = task
            .key_components()
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        for screenshot in screenshots.iter().rev() {
            let text = self
                .ocr
                .extract_text(screenshot, task.task_language)
                .await?
                .to_lowercase();
            if components.iter().all(|c| text.contains(c)) {
                let file_name = screenshot
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                info!(
                    task = %task.task_identifier,
                    screenshot = %file_name,
                    "Coarse gate matched"
                );
                return Ok(Some(file_name));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Language;
    use crate::error::JudgeError;
    use crate::eval::judge::JudgeReply;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn task_with_components(components: &str) -> Task {
        Task {
            task_identifier: "shop_0".to_string(),
            task_app: "Shop".to_string(),
            task_app_chn: String::new(),
            adb_app: String::new(),
            adb_home_page: String::new(),
            task_language: Language::English,
            task_description: "Order the item.".to_string(),
            task_difficulty: 1,
            golden_steps: 3,
            key_component_final: components.to_string(),
            is_cross_app: "N".to_string(),
        }
    }

    /// OCR stub mapping file names to extracted text.
    struct TextMapOcr {
        texts: HashMap<String, String>,
    }

    #[async_trait]
    impl OcrProvider for TextMapOcr {
        async fn extract_text(
            &self,
            image: &Path,
            _language: Language,
        ) -> Result<String, EvalError> {
            let name = image.file_name().unwrap().to_string_lossy().into_owned();
            Ok(self.texts.get(&name).cloned().unwrap_or_default())
        }
    }

    /// Judge stub replaying a fixed reply (or error) and counting calls.
    struct ScriptedJudge {
        replies: Mutex<Vec<Result<String, ()>>>,
        calls: AtomicU32,
    }

    impl ScriptedJudge {
        fn new(replies: Vec<Result<String, ()>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Judge for ScriptedJudge {
        async fn ask(&self, _request: &JudgeRequest) -> Result<JudgeReply, JudgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    Err(())
                } else {
                    replies.remove(0)
                }
            };
            match next {
                Ok(content) => Ok(JudgeReply {
                    content,
                    usage: JudgeUsage {
                        prompt_tokens: 100,
                        completion_tokens: 10,
                        total_tokens: 110,
                    },
                }),
                Err(()) => Err(JudgeError::RequestFailed("scripted outage".to_string())),
            }
        }
    }

    fn write_screenshots(dir: &Path, count: usize) {
        for i in 0..count {
            std::fs::write(dir.join(format!("{}.png", i)), [0u8; 4]).unwrap();
        }
    }

    fn options() -> GateOptions {
        GateOptions {
            skip_key_components: false,
            reasoning_mode: ReasoningMode::Direct,
            action_mode: ActionMode::NoAction,
        }
    }

    #[tokio::test]
    async fn test_zero_screenshots_scores_no_evidence() {
        let dir = TempDir::new().unwrap();
        let evaluator = SingleAppEvaluator::new(
            Arc::new(TextMapOcr { texts: HashMap::new() }),
            Arc::new(ScriptedJudge::new(vec![])),
        );
        let outcome = evaluator
            .evaluate(&task_with_components("['confirm']"), dir.path(), &options())
            .await
            .unwrap();
        assert_eq!(outcome.score, -1);
        assert_eq!(outcome.detail, json!({}));
    }

    #[tokio::test]
    async fn test_coarse_gate_matches_newest_screenshot_case_insensitive() {
        let dir = TempDir::new().unwrap();
        write_screenshots(dir.path(), 3);
        let ocr = TextMapOcr {
            texts: HashMap::from([
                ("0.png".to_string(), "Cart".to_string()),
                ("1.png".to_string(), "Checkout".to_string()),
                ("2.png".to_string(), "Confirm Order".to_string()),
            ]),
        };
        let judge = Arc::new(ScriptedJudge::new(vec![Ok(
            "Reason: I believe this task is successful\nResult: 1".to_string(),
        )]));
        let evaluator = SingleAppEvaluator::new(Arc::new(ocr), judge.clone());

        let outcome = evaluator
            .evaluate(&task_with_components("['confirm']"), dir.path(), &options())
            .await
            .unwrap();

        assert_eq!(outcome.score, 1);
        assert_eq!(outcome.detail["coarse_detect"], 1);
        assert_eq!(outcome.detail["matched"], "2.png");
        assert_eq!(outcome.detail["total_num"], 3);
        assert_eq!(outcome.detail["fine_detect"], 1);
        assert_eq!(judge.call_count(), 1);
    }

    #[tokio::test]
    async fn test_coarse_fail_short_circuits_fine_gate() {
        let dir = TempDir::new().unwrap();
        write_screenshots(dir.path(), 2);
        let ocr = TextMapOcr {
            texts: HashMap::from([
                ("0.png".to_string(), "Home".to_string()),
                ("1.png".to_string(), "Settings".to_string()),
            ]),
        };
        let judge = Arc::new(ScriptedJudge::new(vec![Ok("Result: 1".to_string())]));
        let evaluator = SingleAppEvaluator::new(Arc::new(ocr), judge.clone());

        let outcome = evaluator
            .evaluate(&task_with_components("['confirm']"), dir.path(), &options())
            .await
            .unwrap();

        assert_eq!(outcome.score, 0);
        assert_eq!(outcome.detail["coarse_detect"], 0);
        assert_eq!(judge.call_count(), 0, "fine gate must not run");
    }

    #[tokio::test]
    async fn test_skip_key_components_goes_straight_to_fine_gate() {
        let dir = TempDir::new().unwrap();
        write_screenshots(dir.path(), 1);
        let judge = Arc::new(ScriptedJudge::new(vec![Ok(
            "Reason: I believe this task is failed\nResult: 0".to_string(),
        )]));
        let evaluator = SingleAppEvaluator::new(
            Arc::new(TextMapOcr { texts: HashMap::new() }),
            judge.clone(),
        );

        let mut opts = options();
        opts.skip_key_components = true;
        let outcome = evaluator
            .evaluate(&task_with_components("['confirm']"), dir.path(), &opts)
            .await
            .unwrap();

        assert_eq!(outcome.score, 0);
        assert_eq!(outcome.detail["matched"], -1);
        assert_eq!(outcome.detail["fine_detect"], 0);
        assert!(outcome.detail["fine_detect_reason"]
            .as_str()
            .unwrap()
            .contains("failed"));
        assert_eq!(judge.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fine_gate_retry_exhaustion_scores_fail() {
        let dir = TempDir::new().unwrap();
        write_screenshots(dir.path(), 1);
        let judge = Arc::new(ScriptedJudge::new(vec![Err(()), Err(()), Err(())]));
        let evaluator = SingleAppEvaluator::new(
            Arc::new(TextMapOcr { texts: HashMap::new() }),
            judge.clone(),
        )
        .with_retry_policy(3, Duration::from_millis(1));

        let mut opts = options();
        opts.skip_key_components = true;
        let outcome = evaluator
            .evaluate(&task_with_components("[]"), dir.path(), &opts)
            .await
            .unwrap();

        assert_eq!(outcome.score, 0);
        assert_eq!(outcome.detail["fine_detect"], 0);
        assert_eq!(outcome.detail["fine_detect_reason"], "");
        assert_eq!(judge.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unparsable_verdict_is_retried() {
        let dir = TempDir::new().unwrap();
        write_screenshots(dir.path(), 1);
        let judge = Arc::new(ScriptedJudge::new(vec![
            Ok("I cannot decide.".to_string()),
            Ok("Result: 1".to_string()),
        ]));
        let evaluator = SingleAppEvaluator::new(
            Arc::new(TextMapOcr { texts: HashMap::new() }),
            judge.clone(),
        )
        .with_retry_policy(3, Duration::from_millis(1));

        let mut opts = options();
        opts.skip_key_components = true;
        opts.reasoning_mode = ReasoningMode::ResultOnly;
        let outcome = evaluator
            .evaluate(&task_with_components("[]"), dir.path(), &opts)
            .await
            .unwrap();

        assert_eq!(outcome.score, 1);
        assert_eq!(judge.call_count(), 2);
    }
}
