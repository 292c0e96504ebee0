//! Task dataset loading.
//!
//! The benchmark dataset is a CSV table keyed by `task_identifier`. The
//! session results table (see [`crate::ledger`]) is seeded from it and
//! carries extra per-agent columns, so task deserialization must tolerate
//! unknown columns. Cross-app tasks additionally carry a pre-decomposed
//! subtask split stored as one JSON file per task.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DatasetError;

/// Task language, driving OCR model choice and keyboard selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "ENG")]
    English,
    #[serde(rename = "CHN")]
    Chinese,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::English => "ENG",
            Language::Chinese => "CHN",
        }
    }
}

/// One benchmark task. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    pub task_identifier: String,
    #[serde(default)]
    pub task_app: String,
    #[serde(rename = "task_app_CHN", default)]
    pub task_app_chn: String,
    #[serde(default)]
    pub adb_app: String,
    #[serde(default)]
    pub adb_home_page: String,
    pub task_language: Language,
    pub task_description: String,
    #[serde(default)]
    pub task_difficulty: u8,
    pub golden_steps: u32,
    /// Serialized list of key-component strings, as stored in the dataset.
    #[serde(default)]
    pub key_component_final: String,
    #[serde(default)]
    pub is_cross_app: String,
}

impl Task {
    /// Whether this task spans multiple apps.
    pub fn is_cross_app(&self) -> bool {
        self.is_cross_app == "Y"
    }

    /// Parses the key-component column into individual substrings.
    pub fn key_components(&self) -> Vec<String> {
        parse_component_list(&self.key_component_final)
    }

    /// The task description sent to agents, prefixed with the opened-app
    /// sentence for single-app tasks.
    pub fn full_description(&self) -> String {
        if self.is_cross_app() {
            return self.task_description.clone();
        }
        match self.task_language {
            Language::English => format!(
                "This is the opened app \"{}\". {}",
                self.task_app, self.task_description
            ),
            Language::Chinese => format!(
                "这是已打开的\"{}\"应用程序，{}",
                self.task_app_chn, self.task_description
            ),
        }
    }

    /// Step budget for this task: the configured global budget, or
    /// `golden_steps * 2 + 1` when none is set.
    pub fn step_budget(&self, max_rounds: Option<u32>) -> u32 {
        max_rounds.unwrap_or(self.golden_steps * 2 + 1)
    }
}

/// Parses a serialized component list (`['a', "b"]`) into its elements.
///
/// The dataset stores key components as a quoted list literal; anything
/// between matching quote pairs is taken verbatim.
pub fn parse_component_list(raw: &str) -> Vec<String> {
    let mut components = Vec::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\'' || c == '"' {
            let quote = c;
            let mut item = String::new();
            for inner in chars.by_ref() {
                if inner == quote {
                    break;
                }
                item.push(inner);
            }
            if !item.is_empty() {
                components.push(item);
            }
        }
    }
    components
}

/// Loads every task from a CSV table, ignoring columns the task model does
/// not know about (the results table carries per-agent columns).
pub fn load_tasks(path: impl AsRef<Path>) -> Result<Vec<Task>, DatasetError> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let mut tasks = Vec::new();
    for record in reader.deserialize() {
        let task: Task = record?;
        tasks.push(task);
    }
    Ok(tasks)
}

/// One pre-decomposed cross-app subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// App this subtask runs in.
    pub app: String,
    /// Subtask instruction; may hold `{memory key}` placeholders.
    #[serde(rename = "task")]
    pub text: String,
    /// Whether the instruction references memory from an earlier subtask.
    pub history: bool,
    /// Memory key this subtask produces, if any. The dataset uses the
    /// literal string "None" for absent keys.
    #[serde(deserialize_with = "deserialize_memory", default)]
    pub memory: Option<String>,
}

fn deserialize_memory<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| s != "None" && !s.is_empty()))
}

/// Ordered cross-app decomposition of one task.
#[derive(Debug, Clone)]
pub struct SplitTask {
    pub task_identifier: String,
    pub subtasks: Vec<Subtask>,
}

impl SplitTask {
    /// The ordered app list for segmentation, with duplicate apps
    /// disambiguated as `App_1`, `App_2`, ... Apps appearing once keep
    /// their plain name. Window names returned by the segmentation stage
    /// follow this scheme.
    pub fn window_names(&self) -> Vec<String> {
        let mut totals: HashMap<&str, usize> = HashMap::new();
        for subtask in &self.subtasks {
            *totals.entry(subtask.app.as_str()).or_default() += 1;
        }
        let mut seen: HashMap<&str, usize> = HashMap::new();
        self.subtasks
            .iter()
            .map(|subtask| {
                let app = subtask.app.as_str();
                if totals[app] == 1 {
                    app.to_string()
                } else {
                    let n = seen.entry(app).or_default();
                    *n += 1;
                    format!("{}_{}", app, n)
                }
            })
            .collect()
    }

    /// The raw app order sent to the segmentation prompt.
    pub fn app_order(&self) -> Vec<String> {
        self.subtasks.iter().map(|s| s.app.clone()).collect()
    }
}

/// Loads the pre-decomposed subtask file for a cross-app task.
///
/// The file is a JSON object with `subtask_1`, `subtask_2`, ... entries;
/// numeric suffixes define the subtask order.
pub fn load_split_task(
    split_dir: impl AsRef<Path>,
    task_identifier: &str,
) -> Result<SplitTask, DatasetError> {
    let path = split_dir.as_ref().join(format!("{}.json", task_identifier));
    if !path.exists() {
        return Err(DatasetError::SplitFileMissing {
            task: task_identifier.to_string(),
            path,
        });
    }
    let raw = std::fs::read_to_string(&path)?;
    let value: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;

    let mut numbered: Vec<(u32, Subtask)> = Vec::new();
    for (key, entry) in &value {
        let Some(index) = key.strip_prefix("subtask_") else {
            continue;
        };
        let index: u32 = index.parse().map_err(|_| DatasetError::MalformedSplit {
            task: task_identifier.to_string(),
            message: format!("bad subtask key '{}'", key),
        })?;
        let subtask: Subtask = serde_json::from_value(entry.clone()).map_err(|e| {
            DatasetError::MalformedSplit {
                task: task_identifier.to_string(),
                message: format!("subtask_{}: {}", index, e),
            }
        })?;
        numbered.push((index, subtask));
    }
    if numbered.is_empty() {
        return Err(DatasetError::MalformedSplit {
            task: task_identifier.to_string(),
            message: "no subtask entries".to_string(),
        });
    }
    numbered.sort_by_key(|(index, _)| *index);

    Ok(SplitTask {
        task_identifier: task_identifier.to_string(),
        subtasks: numbered.into_iter().map(|(_, s)| s).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_task() -> Task {
        Task {
            task_identifier: "clock_0".to_string(),
            task_app: "Clock".to_string(),
            task_app_chn: "时钟".to_string(),
            adb_app: "com.android.deskclock".to_string(),
            adb_home_page: ".DeskClock".to_string(),
            task_language: Language::English,
            task_description: "Set an alarm for 7am.".to_string(),
            task_difficulty: 1,
            golden_steps: 3,
            key_component_final: "['7:00', 'AM']".to_string(),
            is_cross_app: "N".to_string(),
        }
    }

    #[test]
    fn test_parse_component_list() {
        assert_eq!(
            parse_component_list("['confirm', \"order\"]"),
            vec!["confirm".to_string(), "order".to_string()]
        );
        assert_eq!(parse_component_list("[]"), Vec::<String>::new());
        assert_eq!(parse_component_list("['7:00 AM']"), vec!["7:00 AM"]);
    }

    #[test]
    fn test_full_description_prefixes_single_app() {
        let task = sample_task();
        assert!(task
            .full_description()
            .starts_with("This is the opened app \"Clock\"."));

        let mut cross = sample_task();
        cross.is_cross_app = "Y".to_string();
        assert_eq!(cross.full_description(), cross.task_description);
    }

    #[test]
    fn test_step_budget_defaults_from_golden_steps() {
        let task = sample_task();
        assert_eq!(task.step_budget(None), 7);
        assert_eq!(task.step_budget(Some(20)), 20);
    }

    #[test]
    fn test_load_tasks_ignores_extra_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "task_identifier,task_app,task_app_CHN,adb_app,adb_home_page,task_language,task_description,task_difficulty,golden_steps,key_component_final,is_cross_app,AgentX_completion"
        )
        .unwrap();
        writeln!(
            file,
            "clock_0,Clock,时钟,com.android.deskclock,.DeskClock,ENG,Set an alarm.,1,3,\"['7:00']\",N,Y"
        )
        .unwrap();

        let tasks = load_tasks(&path).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_identifier, "clock_0");
        assert_eq!(tasks[0].key_components(), vec!["7:00"]);
        assert!(!tasks[0].is_cross_app());
    }

    #[test]
    fn test_load_split_task_orders_and_names_windows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cross_1.json");
        std::fs::write(
            &path,
            r#"{
                "task_description": "look something up, set a timer, come back",
                "subtask_2": {"app": "Clock", "task": "Set a timer", "history": false, "memory": "None"},
                "subtask_1": {"app": "YouTube", "task": "Find a video", "history": false, "memory": "video title"},
                "subtask_3": {"app": "YouTube", "task": "Play {video title}", "history": true, "memory": "None"}
            }"#,
        )
        .unwrap();

        let split = load_split_task(dir.path(), "cross_1").unwrap();
        assert_eq!(split.subtasks.len(), 3);
        assert_eq!(split.subtasks[0].app, "YouTube");
        assert_eq!(split.subtasks[0].memory.as_deref(), Some("video title"));
        assert!(split.subtasks[1].memory.is_none());
        assert_eq!(
            split.window_names(),
            vec!["YouTube_1", "Clock", "YouTube_2"]
        );
        assert_eq!(split.app_order(), vec!["YouTube", "Clock", "YouTube"]);
    }

    #[test]
    fn test_load_split_task_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load_split_task(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, DatasetError::SplitFileMissing { .. }));
    }
}
