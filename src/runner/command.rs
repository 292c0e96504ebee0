//! Data-driven agent command construction.
//!
//! Each benchmarked agent is an external program with its own entry script
//! and flag names. Rather than a type per agent, the config declares one
//! [`AgentCommand`] template per agent: the program, the entry script, and
//! a mapping from canonical parameter keys to that agent's flag spellings.
//! A pure function turns (template, invocation) into the argv.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::Task;
use crate::device::Device;

/// Canonical parameter keys an agent template may map to flags, in the
/// order they are emitted.
pub const CANONICAL_KEYS: [&str; 11] = [
    "api_key",
    "task",
    "app",
    "lang",
    "output_dir",
    "adb_path",
    "max_rounds",
    "device",
    "console_port",
    "grpc_port",
    "model",
];

/// Command template for one agent, declared in the session config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommand {
    /// Agent name; also the per-task artifact subdirectory name.
    pub name: String,
    /// Install path of the agent; the process working directory.
    pub repo_path: PathBuf,
    /// Interpreter or executable.
    #[serde(default = "default_program")]
    pub program: String,
    /// Entry script passed as the first argument, if any.
    #[serde(default)]
    pub script: String,
    /// Canonical key → flag spelling (e.g. `device` → `-d`). Keys absent
    /// here are not passed to the agent.
    #[serde(default)]
    pub flags: HashMap<String, String>,
    /// Arguments appended verbatim after the mapped flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Whether this agent types through the ADB keyboard regardless of
    /// task language.
    #[serde(default)]
    pub default_adb_keyboard: bool,
}

fn default_program() -> String {
    "python".to_string()
}

/// Everything a single agent invocation depends on.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub task: &'a Task,
    /// The possibly app-prefixed task description sent to the agent.
    pub description: String,
    pub output_dir: &'a Path,
    pub device: &'a Device,
    pub step_budget: u32,
    pub adb_path: &'a str,
    pub api_key: Option<&'a str>,
    pub model: Option<&'a str>,
}

/// Builds the argv for one invocation: the entry script, then a flag/value
/// pair for every canonical key the template maps, then the verbatim
/// extras.
pub fn build_args(command: &AgentCommand, invocation: &Invocation<'_>) -> Vec<String> {
    let mut args = Vec::new();
    if !command.script.is_empty() {
        args.push(command.script.clone());
    }

    for key in CANONICAL_KEYS {
        let Some(flag) = command.flags.get(key) else {
            continue;
        };
        let value = match key {
            "api_key" => invocation.api_key.map(str::to_string),
            "task" => Some(invocation.description.clone()),
            "app" => Some(invocation.task.task_app.clone()),
            "lang" => Some(invocation.task.task_language.as_str().to_string()),
            "output_dir" => Some(invocation.output_dir.to_string_lossy().into_owned()),
            "adb_path" => Some(invocation.adb_path.to_string()),
            "max_rounds" => Some(invocation.step_budget.to_string()),
            "device" => Some(invocation.device.serial.clone()),
            "console_port" => invocation.device.console_port.map(|p| p.to_string()),
            "grpc_port" => invocation.device.grpc_port.map(|p| p.to_string()),
            "model" => invocation.model.map(str::to_string),
            _ => None,
        };
        if let Some(value) = value {
            args.push(flag.clone());
            args.push(value);
        }
    }

    args.extend(command.extra_args.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Language;

    fn sample_task() -> Task {
        Task {
            task_identifier: "clock_0".to_string(),
            task_app: "Clock".to_string(),
            task_app_chn: String::new(),
            adb_app: "com.android.deskclock".to_string(),
            adb_home_page: ".DeskClock".to_string(),
            task_language: Language::English,
            task_description: "Set an alarm for 7am.".to_string(),
            task_difficulty: 1,
            golden_steps: 3,
            key_component_final: "['7:00']".to_string(),
            is_cross_app: "N".to_string(),
        }
    }

    fn sample_command() -> AgentCommand {
        AgentCommand {
            name: "AppAgent".to_string(),
            repo_path: PathBuf::from("/opt/agents/appagent"),
            program: "python".to_string(),
            script: "scripts/task_executor.py".to_string(),
            flags: HashMap::from([
                ("task".to_string(), "--task".to_string()),
                ("device".to_string(), "--device".to_string()),
                ("max_rounds".to_string(), "--max_rounds".to_string()),
                ("output_dir".to_string(), "--output_dir".to_string()),
            ]),
            extra_args: vec!["--root_dir".to_string(), "./".to_string()],
            default_adb_keyboard: false,
        }
    }

    #[test]
    fn test_build_args_emits_mapped_flags_in_canonical_order() {
        let task = sample_task();
        let device = Device::attached("emulator-5554");
        let output_dir = Path::new("/tmp/out");
        let invocation = Invocation {
            task: &task,
            description: task.full_description(),
            output_dir,
            device: &device,
            step_budget: 7,
            adb_path: "adb",
            api_key: None,
            model: None,
        };

        let args = build_args(&sample_command(), &invocation);
        assert_eq!(args[0], "scripts/task_executor.py");
        let task_pos = args.iter().position(|a| a == "--task").unwrap();
        let out_pos = args.iter().position(|a| a == "--output_dir").unwrap();
        let rounds_pos = args.iter().position(|a| a == "--max_rounds").unwrap();
        let device_pos = args.iter().position(|a| a == "--device").unwrap();
        assert!(task_pos < out_pos && out_pos < rounds_pos && rounds_pos < device_pos);
        assert_eq!(args[rounds_pos + 1], "7");
        assert_eq!(args[args.len() - 2..], ["--root_dir", "./"]);
    }

    #[test]
    fn test_build_args_skips_unavailable_values() {
        let task = sample_task();
        let device = Device::attached("emulator-5554");
        let mut command = sample_command();
        command
            .flags
            .insert("console_port".to_string(), "--console_port".to_string());
        command
            .flags
            .insert("api_key".to_string(), "--api".to_string());

        let invocation = Invocation {
            task: &task,
            description: String::new(),
            output_dir: Path::new("/tmp/out"),
            device: &device,
            step_budget: 7,
            adb_path: "adb",
            api_key: None,
            model: None,
        };

        let args = build_args(&command, &invocation);
        // Attached devices have no console port; no key was supplied.
        assert!(!args.contains(&"--console_port".to_string()));
        assert!(!args.contains(&"--api".to_string()));
    }
}
