//! Screenshot trace discovery and encoding.
//!
//! An attempt directory holds screenshots `0.png .. N.png` plus the log
//! artifacts. Evaluators read the trace in index order; screenshot `i` is
//! paired with the logged action that transitions it to `i + 1`, and the
//! last screenshot has no following action. Agents (or a preprocessing
//! step) may emit annotated copies under `tap_and_text/` and `tap_only/`;
//! when present they are preferred for the corresponding action modes.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;

use crate::config::ActionMode;
use crate::error::EvalError;

/// Image fidelity requested from the judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDetail {
    /// Low-detail: cheap, used for segmentation over long traces.
    Low,
    /// High-detail: used for judgment.
    High,
}

impl ImageDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageDetail::Low => "low",
            ImageDetail::High => "high",
        }
    }
}

/// One base64-encoded screenshot ready for a judge payload.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data_url: String,
    pub detail: ImageDetail,
}

impl EncodedImage {
    /// The `image_url` content part for an OpenAI-style message.
    pub fn to_content_part(&self) -> serde_json::Value {
        json!({
            "type": "image_url",
            "image_url": {"url": self.data_url, "detail": self.detail.as_str()}
        })
    }
}

/// Lists the screenshots of a trace directory in index order. Missing
/// directories yield an empty trace, which the evaluators score as
/// no-evidence rather than an error.
pub fn screenshot_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("png") | Some("jpg")
            )
        })
        .collect();
    files.sort_by_key(|p| file_index(p));
    files
}

/// Numeric index embedded in a screenshot filename; unnumbered files sort
/// last.
fn file_index(path: &Path) -> u64 {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    stem.chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(u64::MAX)
}

/// 1-based inclusive screenshot window, as produced by segmentation.
pub fn slice_window<T: Clone>(items: &[T], start: i64, end: i64) -> Vec<T> {
    if start < 1 || end < start {
        return Vec::new();
    }
    let from = (start - 1) as usize;
    let to = (end as usize).min(items.len());
    if from >= items.len() {
        return Vec::new();
    }
    items[from..to].to_vec()
}

/// Encodes a trace directory's screenshots, optionally restricted to a
/// 1-based inclusive window.
pub fn encode_screenshots(
    dir: &Path,
    window: Option<(i64, i64)>,
    detail: ImageDetail,
) -> Result<Vec<EncodedImage>, EvalError> {
    let files = screenshot_files(dir);
    let files = match window {
        Some((start, end)) => slice_window(&files, start, end),
        None => files,
    };
    files
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)?;
            Ok(EncodedImage {
                data_url: format!("data:image/jpeg;base64,{}", BASE64.encode(&bytes)),
                detail,
            })
        })
        .collect()
}

/// The directory screenshots are read from for a given action mode: the
/// annotated copies when the producing side emitted them, otherwise the
/// raw trace.
pub fn trace_dir_for_mode(attempt_dir: &Path, action_mode: ActionMode) -> PathBuf {
    let annotated = match action_mode {
        ActionMode::NoAction => return attempt_dir.to_path_buf(),
        ActionMode::WithAction => attempt_dir.join("tap_and_text"),
        ActionMode::TextAction => attempt_dir.join("tap_only"),
    };
    if annotated.is_dir() {
        annotated
    } else {
        attempt_dir.to_path_buf()
    }
}
