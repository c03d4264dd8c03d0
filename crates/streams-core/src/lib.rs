use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A raw entry from the global session-history feed.
///
/// Heartbeat and malformed records arrive without a session id and are
/// skipped at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

/// The authoritative "most recent sighting" of a session.
///
/// Identity is `session_id`; the directory keeps at most one record per id,
/// always the one with the greatest timestamp seen so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub display: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl SessionRecord {
    /// Last path segment of the project, or "unknown" when absent or empty.
    pub fn project_leaf(&self) -> &str {
        leaf_folder(self.project.as_deref())
    }
}

/// Last path segment of a project path. Empty segments (trailing slash,
/// missing project) fall back to the literal "unknown".
pub fn leaf_folder(project: Option<&str>) -> &str {
    match project.and_then(|p| p.rsplit('/').next()) {
        Some(leaf) if !leaf.is_empty() => leaf,
        _ => "unknown",
    }
}

/// Token usage counters attached to an assistant message. All counters
/// default to 0 when the source record omits them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Tokens occupying the context window: live input plus both cache
    /// counters.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }
}

/// Aggregate usage for one model, accumulated by the caller across a
/// conversation and handed to the pricing resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl UsageTotals {
    pub fn add(&mut self, usage: &TokenUsage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_creation_tokens += usage.cache_creation_input_tokens;
        self.cache_read_tokens += usage.cache_read_input_tokens;
    }
}

/// Free text content of a tool result: either a plain string or an ordered
/// list of text fragments (MCP-style tools return the latter).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Fragments(Vec<TextFragment>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextFragment {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ToolResultContent {
    /// Flatten to displayable text; fragments are joined with newlines.
    pub fn as_text(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Fragments(fragments) => fragments
                .iter()
                .filter_map(|f| f.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One block of message content. Immutable once received; unrecognized block
/// types are preserved rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    /// Any block type this viewer does not render.
    #[serde(other)]
    Unknown,
}

/// Message content as it appears on the wire: a bare string or an ordered
/// sequence of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Normalize to blocks; a bare string becomes a single text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

/// The `message` payload of a conversation record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// A conversation record as delivered by the per-session feed. The source
/// carries no identifier; ids are synthesized at append time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationRecord {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Message classification derived from the record's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    User,
    Assistant,
    Other,
}

impl MessageKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "user" => MessageKind::User,
            "assistant" => MessageKind::Assistant,
            _ => MessageKind::Other,
        }
    }
}

/// A message in the active session's ordered log. Identity is positional:
/// `id` is synthesized from `(batch offset, index within batch)` and the log
/// is never reordered or deduplicated after insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub id: String,
    pub kind: MessageKind,
    pub message: Option<MessagePayload>,
    pub timestamp: Option<String>,
}

impl ConversationMessage {
    pub fn from_record(record: ConversationRecord, batch_offset: &str, index: usize) -> Self {
        Self {
            id: format!("{batch_offset}-{index}"),
            kind: MessageKind::from_wire(&record.kind),
            message: record.message,
            timestamp: record.timestamp,
        }
    }

    /// Content normalized to blocks; empty when the record has no payload.
    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        self.message
            .as_ref()
            .map(|m| m.content.blocks())
            .unwrap_or_default()
    }

    /// Whether this message carries a tool result (tool-driven, not typed by
    /// a human).
    pub fn is_tool_result(&self) -> bool {
        match self.message.as_ref().map(|m| &m.content) {
            Some(MessageContent::Blocks(blocks)) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. })),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum StreamsError {
    #[error("Failed to open stream subscription: {0}")]
    ConnectError(String),

    #[error("Stream transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, StreamsError>;
