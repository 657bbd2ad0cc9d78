use crate::{Interaction, McpCommunication, SessionRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const THOUGHT_MARKER: &str = "Thought:";
const ACTION_MARKER: &str = "Action:";
const FINAL_ANSWER_MARKER: &str = "Final Answer:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Thought,
    FinalAnswer,
    ToolCall,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Thought => "thought",
            ItemType::FinalAnswer => "final_answer",
            ItemType::ToolCall => "tool_call",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "thought" | "thinking" => Ok(ItemType::Thought),
            "final_answer" | "answer" => Ok(ItemType::FinalAnswer),
            "tool_call" => Ok(ItemType::ToolCall),
            other => Err(format!("Unknown item type: {other}")),
        }
    }
}

/// One timeline entry derived from the persisted session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedItem {
    pub item_type: ItemType,
    pub content: String,
    pub timestamp_us: i64,
    pub stage_execution_id: Option<String>,
}

/// Flattens a session record into its chronological timeline.
///
/// LLM responses in ReAct form contribute their `Thought:` and `Final Answer:`
/// sections; MCP tool calls contribute one `tool_call` item each. Items with
/// equal timestamps keep their record order.
pub fn extract_items(record: &SessionRecord) -> Vec<PersistedItem> {
    let mut items = Vec::new();
    for stage in &record.stages {
        for interaction in &stage.interactions {
            match interaction {
                Interaction::Llm(llm) => {
                    let Some(text) = llm.response_text.as_deref() else {
                        continue;
                    };
                    let sections = split_react_sections(text);
                    if let Some(thought) = sections.thought {
                        items.push(PersistedItem {
                            item_type: ItemType::Thought,
                            content: thought,
                            timestamp_us: llm.timestamp_us,
                            stage_execution_id: Some(stage.execution_id.clone()),
                        });
                    }
                    if let Some(answer) = sections.final_answer {
                        items.push(PersistedItem {
                            item_type: ItemType::FinalAnswer,
                            content: answer,
                            timestamp_us: llm.timestamp_us,
                            stage_execution_id: Some(stage.execution_id.clone()),
                        });
                    }
                }
                Interaction::Mcp(mcp) => {
                    if mcp.communication_type != McpCommunication::ToolCall {
                        continue;
                    }
                    let content = match &mcp.tool_name {
                        Some(tool) => format!("{}.{}", mcp.server_name, tool),
                        None => mcp.server_name.clone(),
                    };
                    items.push(PersistedItem {
                        item_type: ItemType::ToolCall,
                        content,
                        timestamp_us: mcp.timestamp_us,
                        stage_execution_id: Some(stage.execution_id.clone()),
                    });
                }
            }
        }
    }
    items.sort_by_key(|item| item.timestamp_us);
    items
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReactSections {
    thought: Option<String>,
    final_answer: Option<String>,
}

fn split_react_sections(text: &str) -> ReactSections {
    let mut sections = ReactSections::default();
    let (head, answer) = match text.find(FINAL_ANSWER_MARKER) {
        Some(idx) => (
            &text[..idx],
            Some(&text[idx + FINAL_ANSWER_MARKER.len()..]),
        ),
        None => (text, None),
    };
    sections.final_answer = answer.and_then(non_empty);

    sections.thought = match head.find(THOUGHT_MARKER) {
        Some(idx) => {
            let rest = &head[idx + THOUGHT_MARKER.len()..];
            let end = rest.find(ACTION_MARKER).unwrap_or(rest.len());
            non_empty(&rest[..end])
        }
        // bare text with no tool call is the model thinking out loud
        None if answer.is_none() && !head.contains(ACTION_MARKER) => non_empty(head),
        None => None,
    };
    sections
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
