//! Error types for droid-bench operations.
//!
//! Defines error types for all major subsystems:
//! - Session configuration loading
//! - Dataset and cross-app split parsing
//! - Device control (ADB, emulator lifecycle)
//! - Agent execution
//! - Results ledger persistence
//! - VLM judge and OCR interactions
//! - Trace evaluation

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Unknown agent '{0}': not declared in the config agent table")]
    UnknownAgent(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors that can occur while loading the task dataset or split files.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Task '{0}' not found in dataset")]
    TaskNotFound(String),

    #[error("Cross-app split file missing for task '{task}': {path}")]
    SplitFileMissing { task: String, path: PathBuf },

    #[error("Malformed split file for task '{task}': {message}")]
    MalformedSplit { task: String, message: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during device control operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("ADB command failed: {command}: {stderr}")]
    AdbFailed { command: String, stderr: String },

    #[error("No devices attached")]
    NoDevices,

    #[error("Emulator '{serial}' did not become ready within {waited_secs}s")]
    BootTimeout { serial: String, waited_secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while running an external agent.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Agent '{0}' is not registered")]
    UnknownAgent(String),

    #[error("Failed to spawn agent process '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Agent process timed out after {0}s")]
    Timeout(u64),

    #[error("Unable to decode agent output with any of the configured codecs")]
    Decode,

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the results ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Results table has no '{0}' column")]
    MissingColumn(String),

    #[error("Task '{0}' not present in the results table")]
    UnknownTask(String),

    #[error("Failed to acquire ledger lock at '{path}': {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to persist results table after {attempts} attempts: {last_error}")]
    WriteExhausted { attempts: u32, last_error: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur when talking to the VLM judge.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("Missing API key for the judge endpoint")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Judge API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Failed to parse judge response: {0}")]
    ParseError(String),

    #[error("Judge response contained no choices")]
    EmptyResponse,
}

/// Errors that can end a benchmark session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during trace evaluation.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("No verdict token found in judge output")]
    MissingVerdict,

    #[error("Segmentation retries exhausted: {0}")]
    SegmentationExhausted(String),

    #[error("Memory summarization for '{key}' exhausted retries: {message}")]
    SummarizationExhausted { key: String, message: String },

    #[error("Subtask references unknown memory key '{0}'")]
    MissingMemoryKey(String),

    #[error("OCR extraction failed: {0}")]
    Ocr(String),

    #[error("Evaluator subprocess exited with status {0}")]
    SubprocessFailed(i32),

    #[error("Judge error: {0}")]
    Judge(#[from] JudgeError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
