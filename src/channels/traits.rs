use async_trait::async_trait;
use std::fmt;

/// Stanza-level message type as asserted by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// One-to-one chat.
    Chat,
    /// Standalone message outside a conversation.
    Normal,
    Groupchat,
    Headline,
    Error,
    Other(String),
}

impl MessageKind {
    /// Parse a transport type tag. Missing/blank tags are `normal`, matching
    /// XMPP semantics for untyped messages.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "chat" => Self::Chat,
            "" | "normal" => Self::Normal,
            "groupchat" => Self::Groupchat,
            "headline" => Self::Headline,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    /// Only direct and normal messages can carry commands.
    pub fn is_command_capable(&self) -> bool {
        matches!(self, Self::Chat | Self::Normal)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => f.write_str("chat"),
            Self::Normal => f.write_str("normal"),
            Self::Groupchat => f.write_str("groupchat"),
            Self::Headline => f.write_str("headline"),
            Self::Error => f.write_str("error"),
            Self::Other(tag) => f.write_str(tag),
        }
    }
}

/// A message received from a channel
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub id: String,
    /// Sender identity exactly as asserted by the transport (may carry a resource).
    pub sender: String,
    /// Where replies go: the bare form of `sender`.
    pub reply_target: String,
    pub kind: MessageKind,
    pub content: String,
    pub channel: String,
    pub timestamp: u64,
}

/// An outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub content: String,
    pub recipient: String,
}

impl SendMessage {
    pub fn new(content: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            recipient: recipient.into(),
        }
    }
}

/// Core channel trait. Implement for any messaging transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Send a message through this channel. Fire-and-forget: `Ok` means the
    /// transport accepted it, not that it was delivered.
    async fn send(&self, message: &SendMessage) -> anyhow::Result<()>;

    /// Start listening for incoming messages (long-running)
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()>;

    /// Check if channel is healthy
    async fn health_check(&self) -> bool {
        true
    }
}
