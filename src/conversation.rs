//! Shared conversation log with per-agent delivery watermarks.

use crate::AgentId;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Who produced a conversation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Speaker {
    /// The external message that opened the conversation. Appears only as
    /// the first entry of a fresh conversation.
    Human,
    /// A participating agent, by account id.
    Agent(AgentId),
}

impl Speaker {
    pub fn is_human(&self) -> bool {
        matches!(self, Speaker::Human)
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Human => f.write_str("human"),
            Speaker::Agent(id) => f.write_str(id),
        }
    }
}

impl Serialize for Speaker {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One entry in the shared log.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub speaker: Speaker,
    pub content: String,
    /// Monotonic append index, unique within a conversation.
    pub index: u64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only indexed message sequence with per-agent watermarks.
///
/// A watermark records the highest index an agent has been shown; `None`
/// means the agent has seen nothing. Watermarks only move forward, which is
/// what keeps a message from being delivered to the same agent twice.
#[derive(Debug, Default)]
pub struct ConversationLog {
    messages: Vec<ConversationMessage>,
    watermarks: HashMap<AgentId, u64>,
    next_index: u64,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all messages and watermarks. Called at the start of every fresh
    /// conversation.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.watermarks.clear();
        self.next_index = 0;
    }

    /// Append a message and return its index.
    pub fn append(&mut self, speaker: Speaker, content: impl Into<String>) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.messages.push(ConversationMessage {
            speaker,
            content: content.into(),
            index,
            timestamp: Utc::now(),
        });
        index
    }

    /// Index of the newest message, if any.
    pub fn tail_index(&self) -> Option<u64> {
        self.messages.last().map(|message| message.index)
    }

    /// Highest index the agent has been shown, or `None` for nothing yet.
    pub fn watermark(&self, agent: &str) -> Option<u64> {
        self.watermarks.get(agent).copied()
    }

    /// Whether any message is newer than the agent's watermark.
    pub fn has_unseen(&self, agent: &str) -> bool {
        match (self.tail_index(), self.watermark(agent)) {
            (Some(tail), Some(mark)) => tail > mark,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Move the agent's watermark up to the current tail.
    ///
    /// Never moves a watermark backwards; on an empty log this is a no-op.
    pub fn advance_watermark(&mut self, agent: &AgentId) {
        let Some(tail) = self.tail_index() else { return };
        let mark = self.watermarks.entry(agent.clone()).or_insert(tail);
        if *mark < tail {
            *mark = tail;
        }
    }

    /// Render every agent message newer than the agent's watermark as a
    /// `[{speaker}]: {content}` line.
    ///
    /// Human messages are excluded: the trigger text travels with the first
    /// round itself, not as an accumulated response.
    pub fn unseen_agent_lines(&self, agent: &str) -> Vec<String> {
        let mark = self.watermark(agent);
        self.messages
            .iter()
            .filter(|message| mark.is_none_or(|m| message.index > m))
            .filter(|message| !message.speaker.is_human())
            .map(|message| format!("[{}]: {}", message.speaker, message.content))
            .collect()
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }
}
