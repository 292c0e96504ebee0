//! Tolerant parsing of judge output.
//!
//! Judges answer in free text. The verdict parser accepts the templated
//! `Reason:`/`Result:` forms and degrades to progressively looser patterns
//! before giving up; the segmentation parser pulls app windows out of the
//! judge's JSON-ish reply without requiring valid JSON. Model
//! nondeterminism makes parse failures transient, so callers retry them.

use regex::Regex;
use serde_json::json;

use crate::config::ReasoningMode;
use crate::error::EvalError;

/// A parsed fine-gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVerdict {
    /// 1 for success, 0 for failure.
    pub result: u8,
    /// Justification text; empty in result-only mode.
    pub reason: String,
}

/// Extracts `Result: 1|0` (optionally preceded by `Reason: ...`) from
/// judge output. Both ASCII and fullwidth colons are accepted.
pub fn parse_verdict(
    content: &str,
    reasoning_mode: ReasoningMode,
) -> Result<ParsedVerdict, EvalError> {
    match reasoning_mode {
        ReasoningMode::ResultOnly => {
            let re = Regex::new(r"Result[:：]\s*(\d)").expect("static regex");
            let caps = re.captures(content).ok_or(EvalError::MissingVerdict)?;
            Ok(ParsedVerdict {
                result: parse_digit(&caps[1])?,
                reason: String::new(),
            })
        }
        ReasoningMode::Direct => {
            let strict =
                Regex::new(r"(?s)Reason[:：]\s*(.*?)\s*Result[:：]\s*(\d)").expect("static regex");
            let loose = Regex::new(r"(?s)(?:Reason[:：])?\s*(.*?)\s*Result[:：]\s*(\d)")
                .expect("static regex");
            let caps = strict
                .captures(content)
                .or_else(|| loose.captures(content))
                .ok_or(EvalError::MissingVerdict)?;
            Ok(ParsedVerdict {
                result: parse_digit(&caps[2])?,
                reason: caps[1].trim().replace('\n', ""),
            })
        }
    }
}

fn parse_digit(raw: &str) -> Result<u8, EvalError> {
    match raw.trim() {
        "1" => Ok(1),
        "0" => Ok(0),
        _ => Err(EvalError::MissingVerdict),
    }
}

/// Strips newlines and quotes so the reason survives a CSV detail cell.
pub fn csv_safe(text: &str) -> String {
    text.replace('\n', "").replace(['"', '\''], "")
}

/// One app window: a 1-based inclusive screenshot range, or `(-1, -1)`
/// when the app never appears in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppWindow {
    pub start: i64,
    pub end: i64,
}

impl AppWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_absent(&self) -> bool {
        self.start == -1 && self.end == -1
    }
}

/// Parses `{"App_1": {"start screen": 1, "end screen": 3}, ...}` windows
/// out of the segmentation reply, in reply order.
pub fn parse_app_windows(content: &str) -> Vec<(String, AppWindow)> {
    let re = Regex::new(
        r#""([\w\s]+?(?:_\d+)?)"\s*:\s*\{\s*"start screen"\s*:\s*(-?\d+)\s*,\s*"end screen"\s*:\s*(-?\d+)"#,
    )
    .expect("static regex");
    re.captures_iter(content)
        .filter_map(|caps| {
            let start: i64 = caps[2].parse().ok()?;
            let end: i64 = caps[3].parse().ok()?;
            Some((caps[1].to_string(), AppWindow::new(start, end)))
        })
        .collect()
}

/// Validates segmentation windows against the trace length and app-list
/// order:
/// - a window with any negative bound must be exactly `(-1, -1)` (absent);
/// - `start > end` is invalid;
/// - bounds past the number of screenshots sent are invalid;
/// - consecutive present windows must satisfy `previous.end < next.start`.
pub fn validate_windows(windows: &[(String, AppWindow)], total_screenshots: usize) -> bool {
    let total = total_screenshots as i64;
    for (_, window) in windows {
        if window.is_absent() {
            continue;
        }
        if window.start < 0 || window.end < 0 {
            return false;
        }
        if window.start > window.end {
            return false;
        }
        if window.start > total || window.end > total {
            return false;
        }
    }

    let present: Vec<&AppWindow> = windows
        .iter()
        .map(|(_, w)| w)
        .filter(|w| !w.is_absent())
        .collect();
    for pair in present.windows(2) {
        if pair[0].end >= pair[1].start {
            return false;
        }
    }
    true
}

/// Extracts `{placeholder}` keys from a subtask instruction, in order of
/// appearance.
pub fn placeholder_keys(text: &str) -> Vec<String> {
    let re = Regex::new(r"\{(.*?)\}").expect("static regex");
    re.captures_iter(text).map(|c| c[1].to_string()).collect()
}

/// Serializes windows into the detail blob recorded in the ledger.
pub fn windows_to_json(windows: &[(String, AppWindow)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, window) in windows {
        map.insert(name.clone(), json!([window.start, window.end]));
    }
    serde_json::Value::Object(map)
}
