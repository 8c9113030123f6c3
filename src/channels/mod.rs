//! Channel subsystem: the boundary to the messaging transport.
//!
//! Each transport implements the [`Channel`] trait defined in [`traits`]. The
//! daemon feeds every channel's inbound messages into
//! [`run_message_dispatch_loop`], which hands them to a [`MessageHandler`]
//! (the command dispatcher) one sender lane at a time: a single requester's
//! commands are handled strictly in arrival order, while different requesters
//! proceed concurrently. Replies go back out through a [`Replier`], which
//! splits long text into bounded chunks and sends them in order.

pub mod bridge;
pub mod console;
pub mod traits;

pub use bridge::BridgeChannel;
pub use console::ConsoleChannel;
pub use traits::{Channel, ChannelMessage, MessageKind, SendMessage};

use crate::security::normalize_identity;
use crate::util::split_message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

/// Upper bound on messages being handled at once across all senders.
pub const DEFAULT_MAX_IN_FLIGHT_MESSAGES: usize = 16;
/// A sender lane with nothing queued for this long is retired.
const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const CHANNEL_HEALTH_HEARTBEAT_SECS: u64 = 30;

/// Something that consumes inbound messages. The dispatcher in production,
/// recording fakes in tests.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: ChannelMessage);
}

/// Sends text replies through a channel, chunked to the transport limit.
#[derive(Clone)]
pub struct Replier {
    channel: Arc<dyn Channel>,
    max_chars: usize,
}

impl Replier {
    pub fn new(channel: Arc<dyn Channel>, max_chars: usize) -> Self {
        Self { channel, max_chars }
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// Send `text` to `recipient` as one or more ordered chunks.
    ///
    /// Transport failures are logged, never returned: a reply that cannot be
    /// delivered must not take command handling down with it. Remaining
    /// chunks are dropped after the first failure so the recipient never
    /// sees a gap in the middle of a transcript.
    pub async fn reply(&self, recipient: &str, text: &str) {
        for chunk in split_message(text, self.max_chars) {
            if let Err(e) = self.channel.send(&SendMessage::new(chunk, recipient)).await {
                tracing::error!(
                    "Failed to send reply to {recipient} via {}: {e}",
                    self.channel.name()
                );
                return;
            }
        }
    }
}

/// A queued message together with the in-flight slot it was admitted under.
type LaneItem = (ChannelMessage, OwnedSemaphorePermit);

struct LaneHandle {
    id: u64,
    tx: mpsc::UnboundedSender<LaneItem>,
}

type LaneMap = Arc<Mutex<HashMap<String, LaneHandle>>>;

fn log_worker_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        tracing::error!("Channel message worker crashed: {error}");
    }
}

/// Route inbound messages to per-sender lanes until `rx` closes, then wait
/// for every lane to drain.
///
/// A message is admitted only once an in-flight slot is free, and holds it
/// until handled. At most `max_in_flight_messages` are queued or running
/// across all lanes; beyond that the loop stops reading `rx` and senders
/// see the bounded inbound queue fill up.
pub async fn run_message_dispatch_loop(
    mut rx: mpsc::Receiver<ChannelMessage>,
    handler: Arc<dyn MessageHandler>,
    max_in_flight_messages: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_in_flight_messages.max(1)));
    let lanes: LaneMap = Arc::new(Mutex::new(HashMap::new()));
    let lane_sequence = AtomicU64::new(1);
    let mut workers = tokio::task::JoinSet::new();

    while let Some(msg) = rx.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let key = normalize_identity(&msg.sender);

        // Sends happen under the map lock; a retiring lane checks emptiness
        // under the same lock, so nothing is enqueued to a lane that is gone.
        let pending = {
            let active = lanes.lock();
            match active.get(&key) {
                Some(lane) => lane.tx.send((msg, permit)).err().map(|err| err.0),
                None => Some((msg, permit)),
            }
        };
        let Some(item) = pending else {
            continue;
        };

        let id = lane_sequence.fetch_add(1, Ordering::Relaxed);
        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        let _ = lane_tx.send(item);
        lanes.lock().insert(key.clone(), LaneHandle { id, tx: lane_tx });

        workers.spawn(run_sender_lane(
            key,
            id,
            lane_rx,
            Arc::clone(&lanes),
            Arc::clone(&handler),
        ));

        while let Some(result) = workers.try_join_next() {
            log_worker_join_result(result);
        }
    }

    // Dropping the senders lets each lane finish its queue and exit.
    lanes.lock().clear();
    while let Some(result) = workers.join_next().await {
        log_worker_join_result(result);
    }
}

async fn run_sender_lane(
    key: String,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<LaneItem>,
    lanes: LaneMap,
    handler: Arc<dyn MessageHandler>,
) {
    loop {
        let (msg, _permit) = match tokio::time::timeout(LANE_IDLE_TIMEOUT, rx.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => {
                let mut active = lanes.lock();
                if !rx.is_empty() {
                    continue;
                }
                if active.get(&key).is_some_and(|lane| lane.id == id) {
                    active.remove(&key);
                }
                tracing::debug!("Retiring idle sender lane for {key}");
                break;
            }
        };

        handler.handle(msg).await;
    }
}

/// Run a channel's listener forever, restarting it with exponential backoff
/// whenever it returns. Stops once the inbound queue is closed.
pub fn spawn_supervised_listener(
    ch: Arc<dyn Channel>,
    tx: mpsc::Sender<ChannelMessage>,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let component = format!("channel:{}", ch.name());
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(&component);
            let mut health =
                tokio::time::interval(Duration::from_secs(CHANNEL_HEALTH_HEARTBEAT_SECS));
            health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let result = {
                let listen_future = ch.listen(tx.clone());
                tokio::pin!(listen_future);

                loop {
                    tokio::select! {
                        _ = health.tick() => {
                            crate::health::mark_component_ok(&component);
                        }
                        result = &mut listen_future => break result,
                    }
                }
            };

            if tx.is_closed() {
                break;
            }

            match result {
                Ok(()) => {
                    tracing::warn!("Channel {} exited unexpectedly; restarting", ch.name());
                    crate::health::mark_component_error(&component, "listener exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::error!("Channel {} error: {e}; restarting", ch.name());
                    crate::health::mark_component_error(&component, e.to_string());
                }
            }

            crate::health::bump_component_restart(&component);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double backoff AFTER sleeping so first error uses initial_backoff
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Channel that records every send instead of delivering it.
    #[derive(Default)]
    pub struct RecordingChannel {
        pub sent: Mutex<Vec<SendMessage>>,
        pub fail_sends: std::sync::atomic::AtomicBool,
    }

    impl RecordingChannel {
        pub fn contents(&self) -> Vec<String> {
            self.sent.lock().iter().map(|m| m.content.clone()).collect()
        }

        pub fn recipients(&self) -> Vec<String> {
            self.sent.lock().iter().map(|m| m.recipient.clone()).collect()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                anyhow::bail!("transport down");
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }

        async fn listen(&self, _tx: mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    pub fn chat(sender: &str, content: &str) -> ChannelMessage {
        ChannelMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            reply_target: crate::security::bare_identity(sender).to_string(),
            kind: MessageKind::Chat,
            content: content.to_string(),
            channel: "recording".to_string(),
            timestamp: 0,
        }
    }
}
