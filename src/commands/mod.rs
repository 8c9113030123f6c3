//! Command dispatch: authorize, parse, route, reply.
//!
//! Every inbound message runs through [`Dispatcher::dispatch`]. Message
//! kinds that are not direct or normal chat are ignored outright. Anything
//! else is authorized against the allow-list before the body is even
//! looked at, then routed by its first token through the closed
//! [`BotCommand`] table. `/update` never waits for the deploy: it claims the
//! in-process gate, acknowledges, and hands the deploy to a background task.

pub mod status;

pub use status::StatusReporter;

use crate::channels::{ChannelMessage, MessageHandler, Replier};
use crate::deploy::{DeployCoordinator, DeployGate, DEPLOY_ALREADY_RUNNING};
use crate::security::SenderAllowlist;
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

pub const HELP_REPLY: &str = "Available commands: /help, /ping, /status, /update";
pub const PONG_REPLY: &str = "pong";
pub const UNAUTHORIZED_REPLY: &str = "Unauthorized sender.";
pub const UNKNOWN_COMMAND_REPLY: &str = "Unknown command. Use /help";
pub const DEPLOY_SCHEDULED_REPLY: &str = "Deploy scheduled.";

/// Outcome of a status check or deploy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
}

impl CommandResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Help,
    Ping,
    Status,
    Update,
    /// Lowercased leading token that matched nothing.
    Unknown(String),
}

impl BotCommand {
    /// Parse the leading token of `body`, case-insensitively.
    /// Returns `None` for a blank body.
    pub fn parse(body: &str) -> Option<Self> {
        let token = body.split_whitespace().next()?.to_lowercase();
        Some(match token.as_str() {
            "/help" => Self::Help,
            "/ping" => Self::Ping,
            "/status" => Self::Status,
            "/update" => Self::Update,
            _ => Self::Unknown(token),
        })
    }
}

/// What the dispatcher did with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not a direct or normal chat message; no reply.
    Ignored,
    /// Authorized sender, blank body; no reply.
    Empty,
    Rejected,
    Replied(BotCommand),
    DeployScheduled,
    DeployAlreadyRunning,
}

pub struct Dispatcher {
    allowlist: SenderAllowlist,
    status: StatusReporter,
    deploy: Arc<DeployCoordinator>,
    replier: Replier,
    background: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        allowlist: SenderAllowlist,
        status: StatusReporter,
        deploy: Arc<DeployCoordinator>,
        replier: Replier,
    ) -> Self {
        Self {
            allowlist,
            status,
            deploy,
            replier,
            background: TaskTracker::new(),
        }
    }

    pub fn is_deploy_running(&self) -> bool {
        self.deploy.gate().is_running()
    }

    pub fn deploy_gate(&self) -> DeployGate {
        self.deploy.gate().clone()
    }

    /// Wait for every scheduled deploy to finish and send its final notice.
    pub async fn wait_for_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    pub async fn dispatch(&self, msg: &ChannelMessage) -> DispatchOutcome {
        if !msg.kind.is_command_capable() {
            tracing::debug!(
                "Ignoring {} message from {} via {}",
                msg.kind,
                msg.sender,
                msg.channel
            );
            return DispatchOutcome::Ignored;
        }

        let reply_to = msg.reply_target.as_str();
        let sender = match self.allowlist.authorize(&msg.sender) {
            Ok(sender) => sender,
            Err(normalized) => {
                tracing::warn!(
                    "Blocked message from unauthorized sender {normalized} via {}",
                    msg.channel
                );
                self.replier.reply(reply_to, UNAUTHORIZED_REPLY).await;
                return DispatchOutcome::Rejected;
            }
        };

        let Some(command) = BotCommand::parse(&msg.content) else {
            return DispatchOutcome::Empty;
        };
        tracing::info!(
            "Command from {sender} via {}: {}",
            msg.channel,
            truncate_with_ellipsis(msg.content.trim(), 80)
        );

        match &command {
            BotCommand::Help => self.replier.reply(reply_to, HELP_REPLY).await,
            BotCommand::Ping => self.replier.reply(reply_to, PONG_REPLY).await,
            BotCommand::Status => {
                let result = self.status.report().await;
                let text = if result.success {
                    result.output
                } else {
                    format!("Status failed.\n{}", result.output)
                };
                self.replier.reply(reply_to, &text).await;
            }
            BotCommand::Update => return self.schedule_deploy(reply_to).await,
            BotCommand::Unknown(_) => self.replier.reply(reply_to, UNKNOWN_COMMAND_REPLY).await,
        }

        DispatchOutcome::Replied(command)
    }

    async fn schedule_deploy(&self, requester: &str) -> DispatchOutcome {
        // The permit moves into the task; a second /update sees the gate
        // held from this point on.
        let Some(permit) = self.deploy.gate().try_begin() else {
            tracing::info!("Deploy requested by {requester} while another is running");
            self.replier.reply(requester, DEPLOY_ALREADY_RUNNING).await;
            return DispatchOutcome::DeployAlreadyRunning;
        };

        self.replier.reply(requester, DEPLOY_SCHEDULED_REPLY).await;

        let deploy = Arc::clone(&self.deploy);
        let requester = requester.to_string();
        self.background.spawn(async move {
            deploy.run_with_permit(permit, &requester).await;
        });

        DispatchOutcome::DeployScheduled
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, msg: ChannelMessage) {
        self.dispatch(&msg).await;
    }
}
