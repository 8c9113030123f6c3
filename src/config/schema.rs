use crate::security::SenderAllowlist;
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

pub const ENV_JID: &str = "RELEASE_BOT_JID";
pub const ENV_ALLOWED_SENDERS: &str = "RELEASE_BOT_ALLOWED_SENDERS";
pub const ENV_REPO_PATH: &str = "RELEASE_BOT_REPO_PATH";
pub const ENV_DEPLOY_SCRIPT: &str = "RELEASE_BOT_DEPLOY_SCRIPT";
pub const ENV_LOCK_FILE: &str = "RELEASE_BOT_LOCK_FILE";
pub const ENV_REPLY_MAX_CHARS: &str = "RELEASE_BOT_REPLY_MAX_CHARS";
pub const ENV_OUTPUT_MAX_CHARS: &str = "RELEASE_BOT_OUTPUT_MAX_CHARS";
pub const ENV_DEPLOY_TIMEOUT_SECS: &str = "RELEASE_BOT_DEPLOY_TIMEOUT_SECS";
pub const ENV_STATUS_TIMEOUT_SECS: &str = "RELEASE_BOT_STATUS_TIMEOUT_SECS";
pub const ENV_BRIDGE_URL: &str = "RELEASE_BOT_BRIDGE_URL";
pub const ENV_BRIDGE_SECRET: &str = "RELEASE_BOT_BRIDGE_SECRET";
pub const ENV_GATEWAY_HOST: &str = "RELEASE_BOT_GATEWAY_HOST";
pub const ENV_GATEWAY_PORT: &str = "RELEASE_BOT_GATEWAY_PORT";

const CONFIG_DIR_NAME: &str = ".release-bot";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ── Top-level config ──────────────────────────────────────────────

/// Resolved agent configuration. Built once at startup and shared
/// read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// File this config was loaded from, if any. Not serialized.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub repo: RepoConfig,

    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub reply: ReplyConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Agent identity and who may command it (`[agent]` section).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// The agent's own messaging identity, e.g. `release-bot@example.com`
    #[serde(default)]
    pub jid: String,
    /// Sender identities allowed to issue commands. Normalized on use.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

/// Repository and deploy script locations (`[repo]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,
    /// Defaults to `<path>/release-bot/deploy.sh`. Relative paths resolve
    /// against `path`.
    #[serde(default)]
    pub deploy_script: Option<PathBuf>,
    /// Defaults to `<path>/.release-bot-deploy.lock`. Relative paths resolve
    /// against `path`.
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            deploy_script: None,
            lock_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_deploy_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_deploy_timeout_secs() -> u64 {
    1800
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_deploy_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_status_timeout_secs() -> u64 {
    15
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_status_timeout_secs(),
        }
    }
}

/// Outbound text limits (`[reply]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Maximum characters per outbound message; longer replies are split.
    #[serde(default = "default_reply_max_chars")]
    pub max_chars: usize,
    /// Captured command output longer than this is cut to head and tail.
    #[serde(default = "default_output_max_chars")]
    pub output_max_chars: usize,
}

fn default_reply_max_chars() -> usize {
    3000
}

fn default_output_max_chars() -> usize {
    3500
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_chars: default_reply_max_chars(),
            output_max_chars: default_output_max_chars(),
        }
    }
}

/// Messaging bridge endpoint (`[bridge]` section). Only `run` needs it.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Outbound send endpoint of the bridge
    #[serde(default)]
    pub url: Option<String>,
    /// Shared secret: bearer token outbound, HMAC key inbound
    #[serde(default)]
    pub secret: Option<String>,
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    8787
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_path() -> Option<PathBuf> {
    UserDirs::new().map(|dirs| dirs.home_dir().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn parse_env_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("{raw:?}: {e}"),
    })
}

impl Config {
    /// Load from the process environment plus an optional TOML file.
    ///
    /// `explicit` must exist when given. Without it,
    /// `~/.release-bot/config.toml` is read if present.
    pub async fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(explicit, |key| std::env::var(key).ok()).await
    }

    pub async fn load_with(
        explicit: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.is_file()),
        };

        let mut config = match &path {
            Some(path) => Self::from_file(path).await?,
            None => Self::default(),
        };
        config.config_path = path;
        config.apply_env_overrides_with(lookup)?;
        config.resolve_repo_path()?;
        config.validate()?;
        Ok(config)
    }

    async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(path).await {
                if meta.permissions().mode() & 0o004 != 0 {
                    tracing::warn!(
                        "Config file {} is world-readable (mode {:o}). \
                         Consider restricting with: chmod 600 {}",
                        path.display(),
                        meta.permissions().mode() & 0o777,
                        path.display(),
                    );
                }
            }
        }

        let contents = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply `RELEASE_BOT_*` overrides read through `lookup`. Blank values
    /// are treated as unset.
    pub fn apply_env_overrides_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let env = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(jid) = env(ENV_JID) {
            self.agent.jid = jid;
        }
        if let Some(senders) = env(ENV_ALLOWED_SENDERS) {
            self.agent.allowed_senders = senders.split(',').map(str::to_string).collect();
        }

        if let Some(path) = env(ENV_REPO_PATH) {
            self.repo.path = PathBuf::from(path);
        }
        if let Some(path) = env(ENV_DEPLOY_SCRIPT) {
            self.repo.deploy_script = Some(PathBuf::from(path));
        }
        if let Some(path) = env(ENV_LOCK_FILE) {
            self.repo.lock_file = Some(PathBuf::from(path));
        }

        if let Some(raw) = env(ENV_REPLY_MAX_CHARS) {
            self.reply.max_chars = parse_env_number(ENV_REPLY_MAX_CHARS, &raw)?;
        }
        if let Some(raw) = env(ENV_OUTPUT_MAX_CHARS) {
            self.reply.output_max_chars = parse_env_number(ENV_OUTPUT_MAX_CHARS, &raw)?;
        }
        if let Some(raw) = env(ENV_DEPLOY_TIMEOUT_SECS) {
            self.deploy.timeout_secs = parse_env_number(ENV_DEPLOY_TIMEOUT_SECS, &raw)?;
        }
        if let Some(raw) = env(ENV_STATUS_TIMEOUT_SECS) {
            self.status.timeout_secs = parse_env_number(ENV_STATUS_TIMEOUT_SECS, &raw)?;
        }

        if let Some(url) = env(ENV_BRIDGE_URL) {
            self.bridge.url = Some(url);
        }
        if let Some(secret) = env(ENV_BRIDGE_SECRET) {
            self.bridge.secret = Some(secret);
        }

        if let Some(host) = env(ENV_GATEWAY_HOST) {
            self.gateway.host = host;
        }
        if let Some(raw) = env(ENV_GATEWAY_PORT) {
            self.gateway.port = parse_env_number(ENV_GATEWAY_PORT, &raw)?;
        }

        Ok(())
    }

    fn resolve_repo_path(&mut self) -> Result<(), ConfigError> {
        let absolute = std::path::absolute(&self.repo.path).map_err(|e| ConfigError::Invalid {
            key: ENV_REPO_PATH,
            reason: format!("{}: {e}", self.repo.path.display()),
        })?;
        self.repo.path = absolute;
        Ok(())
    }

    /// Settings every mode needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let jid = self.agent.jid.trim();
        if jid.is_empty() {
            return Err(ConfigError::Missing(ENV_JID));
        }
        if !jid.contains('@') {
            return Err(ConfigError::Invalid {
                key: ENV_JID,
                reason: format!("{jid:?} is not a user@domain identity"),
            });
        }

        if self.allowlist().is_empty() {
            return Err(ConfigError::Missing(ENV_ALLOWED_SENDERS));
        }

        for (key, value) in [
            (ENV_REPLY_MAX_CHARS, self.reply.max_chars as u64),
            (ENV_OUTPUT_MAX_CHARS, self.reply.output_max_chars as u64),
            (ENV_DEPLOY_TIMEOUT_SECS, self.deploy.timeout_secs),
            (ENV_STATUS_TIMEOUT_SECS, self.status.timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".into(),
                });
            }
        }

        // Truncation keeps max/2 characters from each end.
        if self.reply.output_max_chars < 2 {
            return Err(ConfigError::Invalid {
                key: ENV_OUTPUT_MAX_CHARS,
                reason: "must be at least 2".into(),
            });
        }

        Ok(())
    }

    /// Settings only the bridge transport needs. Returns `(url, secret)`.
    pub fn validate_bridge(&self) -> Result<(&str, &str), ConfigError> {
        let url = self
            .bridge
            .url
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_BRIDGE_URL))?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: ENV_BRIDGE_URL,
                reason: format!("{url:?} must be an http(s) URL"),
            });
        }
        let secret = self
            .bridge
            .secret
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_BRIDGE_SECRET))?;
        Ok((url, secret))
    }

    pub fn allowlist(&self) -> SenderAllowlist {
        SenderAllowlist::new(&self.agent.allowed_senders)
    }

    pub fn repo_path(&self) -> PathBuf {
        self.repo.path.clone()
    }

    pub fn deploy_script_path(&self) -> PathBuf {
        self.resolve_in_repo(self.repo.deploy_script.as_deref(), "release-bot/deploy.sh")
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.resolve_in_repo(self.repo.lock_file.as_deref(), ".release-bot-deploy.lock")
    }

    fn resolve_in_repo(&self, configured: Option<&Path>, default: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.repo.path.join(path),
            None => self.repo.path.join(default),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(repo: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.agent.jid = "release-bot@x.com".into();
        config.agent.allowed_senders = vec!["ops@x.com".into()];
        config.repo.path = repo.into();
        config
    }
}

impl fmt::Display for Config {
    /// Operator-facing summary. The bridge secret is never printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config_file = self
            .config_path
            .as_ref()
            .map_or_else(|| "(none)".to_string(), |p| p.display().to_string());
        let allowlist = self.allowlist();
        let senders: Vec<&str> = allowlist.iter().collect();

        writeln!(f, "config file:      {config_file}")?;
        writeln!(f, "agent jid:        {}", self.agent.jid)?;
        writeln!(f, "allowed senders:  {}", senders.join(", "))?;
        writeln!(f, "repo:             {}", self.repo.path.display())?;
        writeln!(f, "deploy script:    {}", self.deploy_script_path().display())?;
        writeln!(f, "lock file:        {}", self.lock_file_path().display())?;
        writeln!(f, "deploy timeout:   {}s", self.deploy.timeout_secs)?;
        writeln!(f, "status timeout:   {}s", self.status.timeout_secs)?;
        writeln!(f, "reply max chars:  {}", self.reply.max_chars)?;
        writeln!(f, "output max chars: {}", self.reply.output_max_chars)?;
        writeln!(
            f,
            "bridge url:       {}",
            self.bridge.url.as_deref().unwrap_or("(unset)")
        )?;
        writeln!(
            f,
            "bridge secret:    {}",
            if self.bridge.secret.is_some() { "***" } else { "(unset)" }
        )?;
        write!(f, "gateway:          {}:{}", self.gateway.host, self.gateway.port)
    }
}
