use super::traits::{Channel, ChannelMessage, MessageKind, SendMessage};
use crate::security::bare_identity;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

/// Local operator channel: stdin lines in, stdout lines out.
///
/// Every line is attributed to a fixed identity, which still has to pass
/// the allow-list. Useful for exercising the dispatcher on a host without
/// a running bridge, and for the one-shot `status`/`deploy` subcommands.
pub struct ConsoleChannel {
    identity: String,
}

impl ConsoleChannel {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    fn message_from_line(&self, line: &str) -> ChannelMessage {
        ChannelMessage {
            id: Uuid::new_v4().to_string(),
            sender: self.identity.clone(),
            reply_target: bare_identity(&self.identity).to_string(),
            kind: MessageKind::Chat,
            content: line.to_string(),
            channel: "console".to_string(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
        println!("{}", message.content);
        Ok(())
    }

    /// Reads until EOF, then returns.
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if tx.send(self.message_from_line(&line)).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
