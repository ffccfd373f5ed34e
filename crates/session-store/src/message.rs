use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use supercli_model::{
    AssistantMessage, ModelMessage, ToolCallRequest, ToolCallResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// The payload of a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    /// Assistant text followed by the tool calls it requested.
    ToolCalls {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        call_id: String,
        output: String,
        is_error: bool,
    },
}

/// A single entry of the session history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    pub timestamp: DateTime<Utc>,
    /// Token count, as reported by the provider or estimated.
    #[serde(default)]
    pub tokens: u64,
    /// Set on assistant messages that were cut short by a cancellation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

impl Message {
    fn new(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
            tokens: 0,
            incomplete: false,
        }
    }

    #[inline]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, Content::Text { text: text.into() })
    }

    #[inline]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, Content::Text { text: text.into() })
    }

    #[inline]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Content::Text { text: text.into() })
    }

    /// Creates an assistant message carrying tool calls. Falls back to a
    /// plain text message when `calls` is empty.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        calls: Vec<ToolCallRequest>,
    ) -> Self {
        if calls.is_empty() {
            return Self::assistant(text);
        }
        Self::new(
            Role::Assistant,
            Content::ToolCalls {
                text: text.into(),
                calls,
            },
        )
    }

    #[inline]
    pub fn tool_result(
        call_id: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::new(
            Role::Tool,
            Content::ToolResult {
                call_id: call_id.into(),
                output: output.into(),
                is_error,
            },
        )
    }

    #[inline]
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    #[inline]
    pub fn mark_incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }

    /// Returns the text of the message. Tool results return their output.
    pub fn text(&self) -> &str {
        match &self.content {
            Content::Text { text } | Content::ToolCalls { text, .. } => text,
            Content::ToolResult { output, .. } => output,
        }
    }

    /// Returns the tool calls carried by this message.
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match &self.content {
            Content::ToolCalls { calls, .. } => calls,
            _ => &[],
        }
    }

    /// Returns the call id if this is a tool result.
    pub fn result_call_id(&self) -> Option<&str> {
        match &self.content {
            Content::ToolResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    pub fn to_model_message(&self) -> ModelMessage {
        match (&self.role, &self.content) {
            (
                _,
                Content::ToolResult {
                    call_id,
                    output,
                    is_error,
                },
            ) => ModelMessage::Tool(ToolCallResult {
                id: call_id.clone(),
                content: if *is_error {
                    format!("Error: {output}")
                } else {
                    output.clone()
                },
            }),
            (Role::Assistant, Content::ToolCalls { text, calls }) => {
                ModelMessage::Assistant(AssistantMessage {
                    content: text.clone(),
                    tool_calls: calls.clone(),
                })
            }
            (Role::Assistant, _) => ModelMessage::assistant_text(self.text()),
            (Role::System, _) => ModelMessage::System(self.text().to_owned()),
            (Role::User | Role::Tool, _) => {
                ModelMessage::User(self.text().to_owned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_model_message_conversion() {
        let call = ToolCallRequest {
            id: "call_1".to_owned(),
            name: "read_file".to_owned(),
            arguments: json!({ "path": "a.txt" }),
        };
        let msg = Message::assistant_with_tool_calls("", vec![call.clone()]);
        assert_eq!(msg.tool_calls(), &[call.clone()]);
        assert_eq!(
            msg.to_model_message(),
            ModelMessage::Assistant(AssistantMessage {
                content: String::new(),
                tool_calls: vec![call],
            })
        );

        let msg = Message::tool_result("call_1", "no such file", true);
        assert_eq!(msg.result_call_id(), Some("call_1"));
        assert_eq!(
            msg.to_model_message(),
            ModelMessage::Tool(ToolCallResult {
                id: "call_1".to_owned(),
                content: "Error: no such file".to_owned(),
            })
        );

        assert_eq!(
            Message::assistant_with_tool_calls("done", vec![]).content,
            Content::Text {
                text: "done".to_owned()
            }
        );
    }

    #[test]
    fn test_incomplete_flag_is_omitted_when_unset() {
        let value = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(value.get("incomplete").is_none());
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"]["type"], "text");

        let value =
            serde_json::to_value(Message::assistant("par").mark_incomplete())
                .unwrap();
        assert_eq!(value["incomplete"], true);
    }
}
