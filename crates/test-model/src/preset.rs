use serde::{Deserialize, Serialize};
use supercli_model::{ErrorKind, ModelFinishReason, TokenUsage, ToolCallRequest};

/// The events in a preset response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresetEvent {
    #[serde(rename = "message_delta")]
    MessageDelta(String),
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallRequest),
    #[serde(rename = "usage")]
    Usage(TokenUsage),
    /// The stream breaks with a network error at this point.
    #[serde(rename = "stream_error")]
    StreamError,
    /// The stream stops producing events without ending.
    #[serde(rename = "hang")]
    Hang,
}

/// The preset response for an assistant step.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresetResponse {
    /// Events in this response.
    pub events: Vec<PresetEvent>,
    /// If set, the request will fail in the first `failure` attempts.
    /// `Some(0)` means the request will fail infinitely.
    pub failures: Option<u64>,
    /// The error kind of the simulated failures.
    #[serde(skip, default = "default_failure_kind")]
    pub failure_kind: ErrorKind,
    /// Overrides the finish reason derived from the events.
    #[serde(default)]
    pub finish_reason: Option<ModelFinishReason>,
}

fn default_failure_kind() -> ErrorKind {
    ErrorKind::RateLimitExceeded
}

impl PresetResponse {
    /// Creates a `PresetResponse` with the specified events.
    #[inline]
    pub fn with_events(events: impl Into<Vec<PresetEvent>>) -> Self {
        Self {
            events: events.into(),
            failures: None,
            failure_kind: default_failure_kind(),
            finish_reason: None,
        }
    }

    /// Creates a text-only response.
    #[inline]
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::with_events([PresetEvent::MessageDelta(text.into())])
    }

    /// Sets failure times before a successful response. `0` means the
    /// response will always be a failure.
    #[inline]
    pub fn with_failures(mut self, failures: u64) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Sets the error kind of the simulated failures.
    #[inline]
    pub fn with_failure_kind(mut self, kind: ErrorKind) -> Self {
        self.failure_kind = kind;
        self
    }

    #[inline]
    pub fn with_finish_reason(mut self, reason: ModelFinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    pub(crate) fn derived_finish_reason(&self) -> ModelFinishReason {
        if let Some(reason) = self.finish_reason {
            return reason;
        }
        let has_tool_call = self
            .events
            .iter()
            .any(|event| matches!(event, PresetEvent::ToolCall(_)));
        if has_tool_call {
            ModelFinishReason::ToolCalls
        } else {
            ModelFinishReason::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_serialize_deserialize() {
        let response = PresetResponse::with_events([
            PresetEvent::MessageDelta(
                "I have left a message for you.".to_string(),
            ),
            PresetEvent::ToolCall(ToolCallRequest {
                id: "1".to_string(),
                name: "write_file".to_string(),
                arguments: json!({
                    "path": "message.txt",
                    "content": "Hello, world!"
                }),
            }),
        ]);

        let serialized = serde_json::to_string(&response).unwrap();
        let deserialized: PresetResponse =
            serde_json::from_str(&serialized).unwrap();

        assert_eq!(response, deserialized);
        assert_eq!(
            deserialized.derived_finish_reason(),
            ModelFinishReason::ToolCalls
        );
    }
}
