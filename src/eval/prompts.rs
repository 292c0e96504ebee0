//! Fixed prompt templates for the judging collaborator.
//!
//! The fine gate uses one system prompt (evaluation guidelines, extended
//! with action guidance when actions are supplied) and one user prompt
//! parameterized by reasoning mode, action mode and threaded memory.
//! Cross-app segmentation and memory summarization carry their own
//! templates.

use crate::config::{ActionMode, ReasoningMode};

/// System prompt for the fine gate.
pub fn judgment_system_prompt(action_mode: ActionMode) -> String {
    format!(
        r#"You are an expert in evaluating smartphone operation tasks. Your primary role is to determine whether a task has been successfully completed based on a series of screenshots (provided in order of execution) and the corresponding task description.

### Guidelines:
1. **No Assumptions**: Evaluate solely based on the provided screenshots. Do not infer or assume details that aren't explicitly shown.
2. **Subtask Completion**: A task is successful only when all its subtasks are successfully completed. For example, for the task "Go to the website github.com. Add this website to the reading list,", it is successful only if the screenshots show github.com has been navigated to and then added to the reading list.
3. **Common Reasons for Subtask Failure**:
    - **Incomplete**: A subtask is not successful if it is not performed or achieved. Same task example above, visiting the website but not adding it to the reading list results in task failure.
    - **Incorrect Execution**: A subtask fails if the screenshots do not align with any part of the instruction.
        - **Wrong Noun/Entity**: If the subtask is "Go to the website github.com." but the screenshots show google.com, the subtask fails. Similar entities (e.g., 'iPhone 11' vs. 'iPhone 12' or 'driving directions' vs. 'walking directions') are considered different, leading to task failure if not correctly executed.
        - **Wrong Verb/Action**: If the subtask is "Like a post," but the screenshots show the post was reposted instead, the subtask fails due to incorrect action.
4. **Additional Actions**: If intermediate screenshots show all subtasks are successful, consider the task a success, even if additional actions are shown afterward. This applies as long as these actions do not impact task completion or cause the original task to fail.
5. **Filtering Subtask**: If a subtask involves filtering based on specific criteria, ensure the filter has been applied (i.e., a specific app feature). If the filter is treated as an additional search condition, the subtask fails.
6. **Order of Subtasks**: Subtasks can be completed in any order unless they are explicitly dependent on each other.
7. **Subtasks Completed Midway**: Subtasks completed in the middle of the process may not be reflected in the final screenshot; these should still be considered successful if they align with the task requirements.
8. **Corrective Actions**: Subtasks that initially appear to fail but are corrected by subsequent actions should be considered successful only when the correction fully aligns with the original task.
9. **Intermediate Steps**: It's acceptable if a subtask isn't completed in one go, as long as the final result meets the task requirements; consider this a success.
10. **Focus on Overview**: Pay attention to the overall objective and avoid letting minor, irrelevant details distract from the main evaluation.
11. **UI Differences**: Be mindful of subtle UI differences (e.g., different font styles or colors indicating selected tabs).
{}**These guidelines serve as a general framework. Apply them thoughtfully and avoid overfitting to edge cases not covered. Be strict and cautious when determining whether a task has been successfully completed or not. Use 1 to indicate success and 0 to indicate failure.**"#,
        action_guideline_section(action_mode)
    )
}

fn action_guideline_section(action_mode: ActionMode) -> &'static str {
    match action_mode {
        ActionMode::WithAction | ActionMode::TextAction => {
            r#"12. **Use of Action Information**: Some quick pop-ups may not be captured by screenshots provided. If needed, consider the action information when evaluating the task.
13. **Single Action for Multiple Subtasks**: Some subtasks can be completed with a single action, such as clicking an icon that shuffles a playlist.

### Common Actions:
- Click/Tap: The user selects or activates a specific point on the screen, triggering an event or interaction.
- Long Press: The user presses and holds a point to trigger a secondary action or menu.
- Swipe/Scroll: The user drags their finger across the screen to scroll or navigate; the content or screen position changes according to the direction.
- Type/Input Text: The user types or inputs text into a field.
- Back: The user presses the back button to return to the previous screen.
"#
        }
        ActionMode::NoAction => "",
    }
}

/// Memory threaded from earlier subtasks: (key, summarized text) pairs.
pub type MemoryEntries<'a> = [(&'a str, &'a str)];

/// User prompt for the fine gate.
pub fn judgment_prompt(
    task_description: &str,
    reasoning_mode: ReasoningMode,
    action_mode: ActionMode,
    action_text: &str,
    history: &MemoryEntries<'_>,
) -> String {
    let reasoning_instruction = match reasoning_mode {
        ReasoningMode::ResultOnly => RESULT_ONLY_INSTRUCTION,
        ReasoningMode::Direct => DIRECT_INSTRUCTION,
    };
    let (action_intro, action_reminders) = action_sections(action_mode, action_text);

    let mut history_info = String::new();
    if !history.is_empty() {
        history_info.push_str(
            "Please take the following historical information into consideration during your evaluation:",
        );
        for (key, value) in history {
            history_info.push_str(&format!(
                "\nThe historical information about '{}' is: {}",
                key, value
            ));
        }
    }

    format!(
        r#"Now, here is a smartphone operation task description:
**{task_description}**
{history_info}
Please carefully determine whether the task has been correctly and completely executed according to the provided screenshots. Use 1 to indicate success and 0 to indicate failure.
{action_intro}
{reasoning_instruction}
Remember:
- Do not make assumptions based on information not presented in the screenshots. Only evaluate what is explicitly shown.
- Ensure that every entity and action in the task description is precisely matched and fulfilled.
- Consider additional actions taken after a task is successfully completed as part of the success, as long as those actions don't impact the task's completion or cause failure.
- A filtering subtask is only correct when a specific filter is applied as a feature of the app. Using the criteria as a keyword search will cause the subtask to fail.
- Subtasks can be completed in any order unless they are explicitly dependent on each other.
- Subtasks completed correctly mid-process, even if not reflected in the final screenshot, should be considered successful.
- Subtasks that initially appear to fail but are corrected by subsequent actions should be considered successful.
- A task can be considered successful even if some subtasks are not completed in one go, as long as the final result meets the task requirements.
- Focus on the overall objective of the task without being distracted by minor, irrelevant details.
- Pay attention to subtle UI differences that might indicate task completion or failure, such as highlighted tabs or changes in font.
{action_reminders}"#
    )
}

const RESULT_ONLY_INSTRUCTION: &str = r#"Please provide your decision using the following template without any reasoning:
Result: <1 OR 0>
"#;

const DIRECT_INSTRUCTION: &str = r#"Use the following format for your response:
Reason: <Brief description of why you believe the task was successful or failed, including the alignment or misalignment between the task description and screenshots, starting with "I believe this task is successful/failed">
Result: <1 OR 0>
"#;

fn action_sections(action_mode: ActionMode, action_text: &str) -> (String, String) {
    match action_mode {
        ActionMode::NoAction => (String::new(), String::new()),
        ActionMode::WithAction => (
            "\nTo assist you in determining whether the task was successful, action information is provided. Use this information only when you cannot determine success purely based on the screenshots. The action information on the i-th screenshot describes the changes from the i-th screenshot to the i+1-th screenshot, while the last screenshot contains no action information as the task ends afterward. This information is presented as a white strip attached to the original screenshot, separated by a blue line. In some screenshots, a red dot may indicate where a specific action occurred (e.g., clicked or long-pressed), triggering an event or interaction.\n".to_string(),
            ACTION_REMINDERS.to_string(),
        ),
        ActionMode::TextAction => (
            format!(
                "\nTo assist you in determining whether the task was successful, action information is provided. Use this information only when you cannot determine success purely based on the screenshots. The i-th screenshot may contain details that change the screenshot from the i-th to the i+1-th, while the last screenshot contains no action information as the task ends afterward. In some screenshots, a red dot may indicate where a specific action occurred (e.g., clicked or long-pressed), triggering an event or interaction. If there isn't a red dot, the action is more complex than a single position operation (e.g., a swipe or text input). You can find the details of these actions below, if applicable.\n{}\n",
                action_text
            ),
            ACTION_REMINDERS.to_string(),
        ),
    }
}

const ACTION_REMINDERS: &str = r#"- Consider the action information only when necessary.
- Pop-ups that appear immediately after an action may not be captured in the screenshots; do not consider this a failure.
- Some subtasks can be completed with a single action, such as clicking an icon that shuffles a playlist.
"#;

/// System prompt for cross-app trace segmentation.
pub const SEGMENTATION_SYSTEM_PROMPT: &str = r#"You are provided with a sequence of screenshots representing an agent performing tasks across multiple apps on a smartphone. Each screenshot corresponds to a specific action. You are also given a list of apps that should be used in the task.

**Your task is to:**
1. Split the screenshots into segments based on transitions between apps in the given list. Do not change the order of apps, even if they do not match the screenshot order. Output the results based on the provided app list order.
2. For each app, identify where the agent opens and operates within the app. Each app interaction requires at least two screenshots: one for opening the app and one for quitting or switching to another, except for the final app, which may not require a quit action.
3. **Ensure that the start and end indices you provide are within the range of screenshots sent to you.** You will receive a certain number of screenshots, and you must repeat how many screenshots you received before processing. Any indices provided should not exceed the total number of screenshots.
4. If an app from the list is missing in the screenshots, return `-1` for both the start and end screenshot indices for that app.
5. Ignore screenshots that show irrelevant actions (e.g., the home screen or unrelated apps). You may mention them in the analysis but do not include them in the final result.
6. An app may appear more than once in the list (e.g., `["AppA", "AppB", "AppA"]`), but there must be another app between repeated instances of the same app.
7. There might be distractors (e.g., advertisements and popups) in the screenshots; you should not interpret them as transitions between apps.

### Example Input:

**App list:** `["AppA", "AppB", "AppA"]`

**Screenshots:** A sequence of numbered screenshots.

### Example Reasoning:
1. **Screenshots 1-3:** The agent opens AppA, and operates within it.
2. **Screenshots 4-5:** The agent opens AppB and operates within it.
3. **Screenshot 6:** The agent interacts with the home screen, which is irrelevant.
4. **Screenshots 7-9:** The agent opens AppA again and operates within it.

### Final Output:
{
  "AppA_1": {
    "start screen": 1,
    "end screen": 3
  },
  "AppB": {
    "start screen": 4,
    "end screen": 5
  },
  "AppA_2": {
    "start screen": 7,
    "end screen": 9
  }
}
"#;

/// User text accompanying the segmentation screenshots.
pub fn segmentation_user_text(app_order: &[String]) -> String {
    let list = app_order
        .iter()
        .map(|app| format!("'{}'", app))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Here is the app list: [{}]\nEnsure the order of apps in your final output is exactly the same as the order provided in my app list.",
        list
    )
}

/// System prompt for window memory summarization.
pub const MEMORY_SYSTEM_PROMPT: &str = "You are an MLLM tasked with analyzing screenshots and summarizing the relevant information based on a description provided by the user. Only summarize information from screenshots that relate to the description, ignoring any that are unrelated. If the screenshots show a list of results (e.g., a search page), summarize or list all the relevant results. The summary should be clear and concise, without bullet points, step-by-step details, or line breaks.";

/// User text for window memory summarization.
pub fn memory_user_text(memory_key: &str) -> String {
    format!("Here is the description: {}", memory_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_action_section_only_with_actions() {
        let plain = judgment_system_prompt(ActionMode::NoAction);
        assert!(!plain.contains("Common Actions"));
        let with_action = judgment_system_prompt(ActionMode::WithAction);
        assert!(with_action.contains("Common Actions"));
    }

    #[test]
    fn test_judgment_prompt_reasoning_instructions() {
        let terse = judgment_prompt(
            "Set an alarm.",
            ReasoningMode::ResultOnly,
            ActionMode::NoAction,
            "",
            &[],
        );
        assert!(terse.contains("without any reasoning"));

        let verbose = judgment_prompt(
            "Set an alarm.",
            ReasoningMode::Direct,
            ActionMode::NoAction,
            "",
            &[],
        );
        assert!(verbose.contains("Reason: <Brief description"));
    }

    #[test]
    fn test_judgment_prompt_threads_history() {
        let prompt = judgment_prompt(
            "Buy {robotic vacuum cleaner}.",
            ReasoningMode::ResultOnly,
            ActionMode::NoAction,
            "",
            &[("robotic vacuum cleaner", "RoboVac X1 was top rated")],
        );
        assert!(prompt.contains("historical information about 'robotic vacuum cleaner'"));
        assert!(prompt.contains("RoboVac X1"));
    }

    #[test]
    fn test_judgment_prompt_appends_action_text() {
        let prompt = judgment_prompt(
            "Set an alarm.",
            ReasoningMode::ResultOnly,
            ActionMode::TextAction,
            "The action that changes from screenshot No.1 to screenshot No.2 is *tap*",
            &[],
        );
        assert!(prompt.contains("screenshot No.1 to screenshot No.2"));
    }

    #[test]
    fn test_segmentation_user_text() {
        let apps = vec!["YouTube".to_string(), "Clock".to_string(), "YouTube".to_string()];
        let text = segmentation_user_text(&apps);
        assert!(text.contains("['YouTube', 'Clock', 'YouTube']"));
    }
}
