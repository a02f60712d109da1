use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One fragment of a streamed tool call. Fragments sharing an `index` belong
/// to the same call; `id` and `name` usually arrive only on the first one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// Classified frame produced by the stream decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta { content: String },
    ToolCallDelta(ToolCallDelta),
    ThreadCreated {
        thread_id: Option<String>,
        parent_message_id: Option<String>,
    },
    Terminal,
}

/// What callers of [`crate::QwenClient::send`] receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutput {
    Text(String),
    ToolCall(ToolCallDelta),
}

/// A complete tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Merges [`ToolCallDelta`] fragments into complete [`ToolCall`]s by index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    tool_calls: HashMap<u32, AccumulatedToolCall>,
}

#[derive(Debug, Clone, Default)]
struct AccumulatedToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields already set are only replaced by non-empty values; arguments
    /// are appended.
    pub fn push(&mut self, delta: &ToolCallDelta) {
        let entry = self.tool_calls.entry(delta.index).or_default();

        if let Some(id) = delta.id.as_ref().filter(|id| !id.is_empty()) {
            entry.id = Some(id.clone());
        }
        if let Some(name) = delta.name.as_ref().filter(|name| !name.is_empty()) {
            entry.name = Some(name.clone());
        }
        entry.arguments.push_str(&delta.arguments);
    }

    /// Complete calls sorted by index. Calls that never received a name are
    /// dropped; a missing id becomes `call_<index>`.
    pub fn into_tool_calls(self) -> Vec<ToolCall> {
        let mut calls: Vec<_> = self.tool_calls.into_iter().collect();
        calls.sort_by_key(|(index, _)| *index);

        calls
            .into_iter()
            .filter_map(|(index, acc)| {
                Some(ToolCall {
                    name: acc.name?,
                    id: acc.id.unwrap_or_else(|| format!("call_{index}")),
                    arguments: acc.arguments,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tool_calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty()
    }
}
