pub mod schema;

pub use schema::{
    AgentConfig, BridgeConfig, Config, ConfigError, DeployConfig, GatewayConfig, RepoConfig,
    ReplyConfig, StatusConfig,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = Config::default();

        assert!(config.agent.jid.is_empty());
        assert!(config.agent.allowed_senders.is_empty());
        assert_eq!(config.reply.max_chars, 3000);
        assert!(config.bridge.url.is_none());
    }

    #[test]
    fn default_config_fails_validation_on_identity() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("RELEASE_BOT_JID")));
    }
}
