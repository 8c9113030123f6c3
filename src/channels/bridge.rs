use super::traits::{Channel, ChannelMessage, MessageKind, SendMessage};
use crate::security::bare_identity;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

/// Header carrying `sha256=<hex hmac>` of the raw inbound body.
pub const SIGNATURE_HEADER: &str = "X-Bridge-Signature";

/// Messaging bridge channel in webhook mode.
///
/// An external XMPP bridge owns the session (connect, authenticate, roster,
/// reconnect). It POSTs inbound stanzas to the gateway's `/messages` route
/// and accepts outbound messages on `bridge_url`. Both directions are
/// authenticated with the shared secret.
pub struct BridgeChannel {
    bridge_url: String,
    secret: String,
    agent_jid: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct InboundPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    from: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
}

impl BridgeChannel {
    pub fn new(bridge_url: String, secret: String, agent_jid: String) -> Self {
        Self {
            bridge_url: bridge_url.trim_end_matches('/').to_string(),
            secret,
            agent_jid,
            client: reqwest::Client::new(),
        }
    }

    fn now_unix_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Parse an inbound bridge payload.
    ///
    /// Fields: `type` (message type, default `normal`), `from` (full sender
    /// identity, required), `body`, optional `id` and `timestamp`.
    pub fn parse_inbound(payload: &[u8]) -> anyhow::Result<ChannelMessage> {
        let inbound: InboundPayload = serde_json::from_slice(payload)?;
        let sender = inbound.from.trim();
        if sender.is_empty() {
            anyhow::bail!("inbound message has an empty `from`");
        }

        Ok(ChannelMessage {
            id: inbound
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            sender: sender.to_string(),
            reply_target: bare_identity(sender).to_string(),
            kind: MessageKind::parse(inbound.kind.as_deref().unwrap_or_default()),
            content: inbound.body.unwrap_or_default(),
            channel: "bridge".to_string(),
            timestamp: inbound.timestamp.unwrap_or_else(Self::now_unix_secs),
        })
    }
}

#[async_trait]
impl Channel for BridgeChannel {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.bridge_url)
            .bearer_auth(&self.secret)
            .json(&serde_json::json!({
                "from": self.agent_jid,
                "to": message.recipient,
                "body": message.content,
                "type": "chat",
            }))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            "Bridge send failed: {status}: {}",
            crate::util::truncate_with_ellipsis(&body, 200)
        );
        anyhow::bail!("Bridge API error: {status}");
    }

    async fn listen(&self, _tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        tracing::info!(
            "Bridge channel active (webhook mode). \
            Configure the bridge to POST inbound messages to the gateway's /messages endpoint."
        );

        // Keep task alive; incoming events are handled by the gateway webhook handler.
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
    }
}

/// Compute the `X-Bridge-Signature` value for `body`.
pub fn sign_bridge_payload(secret: &str, body: &[u8]) -> String {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify an inbound bridge webhook signature in constant time.
///
/// Accepts `sha256=<hex>` or bare hex.
pub fn verify_bridge_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature_hex = signature
        .trim()
        .strip_prefix("sha256=")
        .unwrap_or(signature.trim());
    let Ok(provided) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parse_full_payload() {
        let msg = BridgeChannel::parse_inbound(
            br#"{"id":"m1","type":"chat","from":"Ops@X.com/laptop","body":"/status","timestamp":1700000000}"#,
        )
        .unwrap();

        assert_eq!(msg.id, "m1");
        assert_eq!(msg.kind, MessageKind::Chat);
        assert_eq!(msg.sender, "Ops@X.com/laptop");
        assert_eq!(msg.reply_target, "Ops@X.com");
        assert_eq!(msg.content, "/status");
        assert_eq!(msg.channel, "bridge");
        assert_eq!(msg.timestamp, 1_700_000_000);
    }

    #[test]
    fn parse_defaults_missing_fields() {
        let msg = BridgeChannel::parse_inbound(br#"{"from":"ops@x.com"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Normal);
        assert_eq!(msg.content, "");
        assert!(!msg.id.is_empty());
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn parse_keeps_unrecognized_kind() {
        let msg =
            BridgeChannel::parse_inbound(br#"{"type":"groupchat","from":"room@muc.x.com/ops","body":"/update"}"#)
                .unwrap();
        assert_eq!(msg.kind, MessageKind::Groupchat);
    }

    #[test]
    fn parse_rejects_missing_or_blank_sender() {
        assert!(BridgeChannel::parse_inbound(br#"{"body":"/ping"}"#).is_err());
        assert!(BridgeChannel::parse_inbound(br#"{"from":"  ","body":"/ping"}"#).is_err());
        assert!(BridgeChannel::parse_inbound(b"not json").is_err());
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"from":"ops@x.com","body":"/ping"}"#;
        let signature = sign_bridge_payload("s3cret", body);
        assert!(signature.starts_with("sha256="));
        assert!(verify_bridge_signature("s3cret", body, &signature));
        assert!(verify_bridge_signature(
            "s3cret",
            body,
            signature.trim_start_matches("sha256=")
        ));
    }

    #[test]
    fn signature_rejects_tampering_and_garbage() {
        let body = br#"{"from":"ops@x.com","body":"/ping"}"#;
        let signature = sign_bridge_payload("s3cret", body);
        assert!(!verify_bridge_signature("other", body, &signature));
        assert!(!verify_bridge_signature("s3cret", b"{\"from\":\"eve\"}", &signature));
        assert!(!verify_bridge_signature("s3cret", body, "sha256=zz"));
        assert!(!verify_bridge_signature("s3cret", body, ""));
    }

    #[tokio::test]
    async fn send_posts_chat_message_with_bearer_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("authorization", "Bearer s3cret"))
            .and(body_json(serde_json::json!({
                "from": "release-bot@x.com",
                "to": "ops@x.com",
                "body": "pong",
                "type": "chat",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = BridgeChannel::new(
            format!("{}/send/", server.uri()),
            "s3cret".into(),
            "release-bot@x.com".into(),
        );
        channel
            .send(&SendMessage::new("pong", "ops@x.com"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_surfaces_bridge_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("xmpp session down"))
            .mount(&server)
            .await;

        let channel = BridgeChannel::new(server.uri(), "s3cret".into(), "bot@x.com".into());
        let err = channel
            .send(&SendMessage::new("pong", "ops@x.com"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
