use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use supercli_model::{ModelMessage, TokenUsage};
use uuid::Uuid;

use crate::error::SessionError;
use crate::message::{Message, Role};

const TITLE_MAX_CHARS: usize = 60;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Cumulative token usage of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageCounters {
    #[inline]
    pub fn add(&mut self, usage: TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A conversation and everything needed to resume it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    messages: Vec<Message>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub usage: UsageCounters,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            title: None,
            provider: None,
            model: None,
            messages: vec![],
            metadata: SessionMetadata::default(),
            usage: UsageCounters::default(),
        }
    }

    #[inline]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Appends a message. The first user message also names the session.
    pub fn push(&mut self, msg: Message) {
        if self.title.is_none() && msg.role == Role::User {
            self.title = Some(make_title(msg.text()));
        }
        self.messages.push(msg);
        self.touch();
    }

    /// Appends all messages at once.
    pub fn extend(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for msg in msgs {
            self.push(msg);
        }
    }

    /// Records the token usage of one provider response.
    #[inline]
    pub fn add_usage(&mut self, usage: TokenUsage) {
        self.usage.add(usage);
        self.touch();
    }

    /// Returns the history in the shape the model expects.
    pub fn to_model_messages(&self) -> Vec<ModelMessage> {
        self.messages.iter().map(Message::to_model_message).collect()
    }

    /// Keeps messages `0..=index` and drops the rest.
    ///
    /// When the cut leaves an assistant message whose tool calls no longer
    /// have all their results, that message is dropped too, so the history
    /// can still be sent to the model. Returns the number of removed
    /// messages. An `index` at or past the last message removes nothing,
    /// so applying the same rewind twice removes nothing the second time
    /// even when the first one shrank the history below `index`.
    pub fn rewind(&mut self, index: usize) -> usize {
        let len = self.messages.len();
        if index + 1 >= len {
            return 0;
        }
        self.messages.truncate(index + 1);
        while let Some(pos) = self.dangling_tool_calls() {
            self.messages.truncate(pos);
        }
        let removed = len - self.messages.len();
        if removed > 0 {
            self.touch();
        }
        removed
    }

    /// Returns where the history would be split by
    /// [`compress`](Self::compress), i.e. the number of leading messages
    /// that get summarized.
    ///
    /// The kept tail starts with the `keep_recent` newest messages and grows
    /// backwards so that no tool result is separated from the assistant
    /// message that requested it.
    pub fn compression_point(&self, keep_recent: usize) -> Option<usize> {
        let mut split = self.messages.len().saturating_sub(keep_recent);
        while split > 0
            && self
                .messages
                .get(split)
                .is_some_and(|msg| msg.role == Role::Tool)
        {
            split -= 1;
        }
        (split > 0).then_some(split)
    }

    /// Replaces everything before the [`compression_point`] with a single
    /// system message holding `summary`.
    ///
    /// Either the whole operation applies or the session is unchanged.
    ///
    /// [`compression_point`]: Self::compression_point
    pub fn compress(
        &mut self,
        keep_recent: usize,
        summary: impl Into<String>,
    ) -> Result<usize, SessionError> {
        let split = self
            .compression_point(keep_recent)
            .ok_or(SessionError::NothingToCompress)?;

        let mut messages = Vec::with_capacity(self.messages.len() - split + 1);
        let mut summary = Message::system(summary);
        // Timestamps keep rising across the summary and the kept tail.
        summary.timestamp = self.messages[split - 1].timestamp;
        messages.push(summary);
        messages.extend_from_slice(&self.messages[split..]);
        self.messages = messages;
        self.touch();
        Ok(split)
    }

    #[inline]
    pub fn set_favorite(&mut self, favorite: bool) {
        self.metadata.favorite = favorite;
        self.touch();
    }

    /// Adds a tag. Returns `false` if the tag is blank or already present.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || !self.metadata.tags.insert(tag.to_owned()) {
            return false;
        }
        self.touch();
        true
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let removed = self.metadata.tags.remove(tag.trim());
        if removed {
            self.touch();
        }
        removed
    }

    /// Finds the last assistant message with tool calls and checks that every
    /// call has a result after it.
    fn dangling_tool_calls(&self) -> Option<usize> {
        let pos = self
            .messages
            .iter()
            .rposition(|msg| !msg.tool_calls().is_empty())?;
        let answered: HashSet<&str> = self.messages[pos + 1..]
            .iter()
            .filter_map(Message::result_call_id)
            .collect();
        let complete = self.messages[pos]
            .tool_calls()
            .iter()
            .all(|call| answered.contains(call.id.as_str()));
        (!complete).then_some(pos)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn make_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    if line.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use supercli_model::ToolCallRequest;

    use super::*;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_owned(),
            name: "list_directory".to_owned(),
            arguments: json!({ "path": "." }),
        }
    }

    /// user, assistant(calls a, b), result a, result b, assistant, user,
    /// assistant
    fn sample() -> Session {
        let mut session = Session::new();
        session.extend([
            Message::user("what is in here?"),
            Message::assistant_with_tool_calls(
                "let me look",
                vec![call("a"), call("b")],
            ),
            Message::tool_result("a", "[FILE] a.txt", false),
            Message::tool_result("b", "[DIR] src", false),
            Message::assistant("a file and a directory"),
            Message::user("thanks"),
            Message::assistant("you're welcome"),
        ]);
        session
    }

    #[test]
    fn test_title_from_first_user_message() {
        let session = sample();
        assert_eq!(session.title.as_deref(), Some("what is in here?"));

        let mut session = Session::new();
        session.push(Message::user("x".repeat(100)));
        let title = session.title.unwrap();
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_rewind_is_idempotent() {
        let mut session = sample();
        assert_eq!(session.rewind(4), 2);
        let after_first = session.messages().to_vec();
        assert_eq!(session.rewind(4), 0);
        assert_eq!(session.messages(), &after_first[..]);

        assert_eq!(session.rewind(10), 0);
        assert_eq!(session.len(), 5);
    }

    #[test]
    fn test_rewind_twice_after_dangling_cleanup() {
        let mut session = sample();
        assert_eq!(session.rewind(2), 6);
        assert_eq!(session.len(), 1);
        let updated_at = session.updated_at;

        // The cleanup left fewer messages than `index + 1`.
        assert_eq!(session.rewind(2), 0);
        assert_eq!(session.len(), 1);
        assert_eq!(session.updated_at, updated_at);
    }

    #[test]
    fn test_rewind_drops_dangling_tool_calls() {
        let mut session = sample();
        // Only the result of `a` survives the cut.
        assert_eq!(session.rewind(2), 6);
        assert_eq!(session.len(), 1);
        assert_eq!(session.messages()[0].role, Role::User);

        let mut session = sample();
        assert_eq!(session.rewind(3), 3);
        assert_eq!(session.len(), 4);
    }

    #[test]
    fn test_compress_keeps_tool_groups_together() {
        let mut session = sample();
        // Keeping 4 would start the tail at result `b`.
        assert_eq!(session.compression_point(4), Some(1));
        assert_eq!(session.compress(4, "summary").unwrap(), 1);
        assert_eq!(session.len(), 7);
        assert_eq!(session.messages()[0].role, Role::System);
        assert_eq!(session.messages()[0].text(), "summary");
        assert_eq!(session.messages()[1].tool_calls().len(), 2);

        let mut session = sample();
        assert_eq!(session.compress(2, "short").unwrap(), 5);
        assert_eq!(session.len(), 3);
        assert_eq!(session.messages()[1].text(), "thanks");
    }

    #[test]
    fn test_compress_keeps_timestamps_ordered() {
        let start = Utc::now() - chrono::Duration::hours(1);
        let mut session = Session::new();
        session.extend((0..7).map(|i| {
            let mut msg = if i % 2 == 0 {
                Message::user(format!("question {i}"))
            } else {
                Message::assistant(format!("answer {i}"))
            };
            msg.timestamp = start + chrono::Duration::minutes(i);
            msg
        }));

        assert_eq!(session.compress(2, "summary").unwrap(), 5);
        let messages = session.messages();
        assert_eq!(messages[0].timestamp, start + chrono::Duration::minutes(4));
        assert!(
            messages
                .windows(2)
                .all(|pair| pair[0].timestamp <= pair[1].timestamp)
        );
    }

    #[test]
    fn test_compress_nothing_leaves_session_untouched() {
        let mut session = sample();
        let before = session.clone();
        assert!(matches!(
            session.compress(100, "summary"),
            Err(SessionError::NothingToCompress)
        ));
        assert_eq!(session, before);
    }

    #[test]
    fn test_metadata() {
        let mut session = Session::new();
        session.set_favorite(true);
        assert!(session.metadata.favorite);
        assert!(session.add_tag(" work "));
        assert!(!session.add_tag("work"));
        assert!(!session.add_tag("  "));
        assert!(session.remove_tag("work"));
        assert!(!session.remove_tag("work"));
        assert!(session.is_empty());
    }
}
