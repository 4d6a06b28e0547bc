//! Deterministic rendering of the LLM system prompt.
//!
//! The transcript itself travels as chat messages (see
//! [`crate::transcript::Transcript::to_chat_messages`]); the system prompt
//! carries the primers and the JSON-serialized tools, documents and tasks.

use serde::{Deserialize, Serialize};

use crate::CallError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tool {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "description")]
    pub description: String,
    #[serde(rename = "inputGuide")]
    pub input_guide: String,
    #[serde(rename = "outputGuide")]
    pub output_guide: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "DeliverableGuide")]
    pub deliverable_guide: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Content")]
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptContents {
    #[serde(rename = "BotPrimer")]
    pub bot_primer: String,
    #[serde(rename = "TranscriptPrimer", default)]
    pub transcript_primer: Option<String>,
    #[serde(rename = "ToolPrimer", default)]
    pub tool_primer: Option<String>,
    #[serde(rename = "DocumentPrimer", default)]
    pub document_primer: Option<String>,
    #[serde(rename = "TaskPrimer", default)]
    pub task_primer: Option<String>,
    #[serde(rename = "Tools", default)]
    pub tools: Vec<Tool>,
    #[serde(rename = "Documents", default)]
    pub documents: Vec<Document>,
    #[serde(rename = "Tasks", default)]
    pub tasks: Vec<Task>,
}

impl PromptContents {
    pub fn validate(&self) -> Result<(), CallError> {
        if self.bot_primer.trim().is_empty() {
            return Err(CallError::BadConfig("BotPrimer must not be empty".into()));
        }
        Ok(())
    }
}

const SILENCE_INSTRUCTION: &str =
    "If you don't want to say anything, respond with the single character '^'.";

fn default_transcript_primer(bot_name: &str) -> String {
    format!(
        "Below is the transcript of a voice call, up to the current moment. It may include \
         transcription errors (especially at the beginnings of lines); if you think a \
         transcription was incorrect, infer the true words from context. The first sentence of \
         your response should be as short as possible within reason. The transcript may also \
         include your previous tool uses, and mark when others interrupted you to stop your \
         words from playing, which may mean they want you to stop talking. You are {bot_name}."
    )
}

fn default_tool_primer(bot_name: &str) -> String {
    format!(
        "Below is a list of available tools you can use. Each tool has four attributes: `name`: \
         the tool's identifier, `description`: explains the tool's purpose and when to use it, \
         `inputGuide`: advises on how to format the input string, `outputGuide`: describes the \
         tool's return value, if any. To use a tool, compose a response with two parts: a spoken \
         response and tool usage instructions, separated by a newline and a pipe ('|'). The \
         spoken response is a string of text to be read aloud. The tool usage instructions are \
         on the next line, starting with a '|', in the form of a JSON array. Each array element \
         is a JSON object with two properties: `name` and `input`. You shouldn't explain how you \
         use the tools unless someone asks. Example:\n\n{bot_name}: This text before the pipe \
         will be played in the voice channel like normal.\n|[{{ \"name\": \"Tool1\", \"input\": \
         \"This input will be sent to tool 1\" }}]\n\nRemember to enter a new line and write a \
         '|' before writing your tool message."
    )
}

const DEFAULT_DOCUMENT_PRIMER: &str =
    "Below is a list of documents available to you. Each document has a `Name` and its \
     `Content`. Consider the information in these documents when formulating your responses, \
     and relay the relevant parts when asked.";

fn default_task_primer(bot_name: &str) -> String {
    format!(
        "Below is a list of pending tasks. Each task is represented by its `Name`, \
         `Description`, and `DeliverableGuide`. The `Description` details the task at hand, and \
         the `DeliverableGuide` describes what constitutes successful completion, such as the \
         use of a specific tool or relaying particular information to someone in the call. Make \
         every effort to complete pending tasks when appropriate. To confirm that a task has \
         been completed, use the MarkTaskDone tool, which takes the task name as input. \
         Example:\n\n{bot_name}: The current weather is sunny.\n|[{{ \"name\": \
         \"MarkTaskDone\", \"input\": \"Inform about weather\" }}]"
    )
}

/// Renders the system prompt. Identical inputs yield byte-identical output.
pub fn render_system_prompt(bot_name: &str, contents: &PromptContents) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(5);

    sections.push(contents.bot_primer.clone());

    let transcript_primer = contents
        .transcript_primer
        .clone()
        .unwrap_or_else(|| default_transcript_primer(bot_name));
    sections.push(format!("{transcript_primer}\n{SILENCE_INSTRUCTION}"));

    if !contents.tools.is_empty() {
        let primer = contents
            .tool_primer
            .clone()
            .unwrap_or_else(|| default_tool_primer(bot_name));
        sections.push(format!("{primer}\n\nTools:\n{}", to_json(&contents.tools)));
    }

    if !contents.documents.is_empty() {
        let primer = contents
            .document_primer
            .clone()
            .unwrap_or_else(|| DEFAULT_DOCUMENT_PRIMER.to_string());
        sections.push(format!(
            "{primer}\n\nDocuments:\n{}",
            to_json(&contents.documents)
        ));
    }

    if !contents.tasks.is_empty() {
        let primer = contents
            .task_primer
            .clone()
            .unwrap_or_else(|| default_task_primer(bot_name));
        sections.push(format!("{primer}\n\nTasks:\n{}", to_json(&contents.tasks)));
    }

    sections.join("\n\n")
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}
