use relay_kit::{EscalationPolicy, DEFAULT_ESCALATION_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DISCORD_TOKEN_ENV: &str = "DISCORD_BOT_TOKEN";
const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const DEFAULT_OUTPUT_CHANNEL: &str = "general";
const DEFAULT_HISTORY_LIMIT: usize = 5;
// discord caps one messages page at 100
const MAX_HISTORY_LIMIT: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

const DEFAULT_LLM_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MESSAGE_MAX_CHARS: usize = 1_900;
const DISCORD_MESSAGE_CEILING: usize = 2_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config {path} failed: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("{what} is not configured and env {env} is not set")]
    MissingSecret { what: &'static str, env: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    /// Listens on the community server, produces snapshots.
    Public,
    /// Runs the decision pipeline, talks to the humans behind the bot.
    Private,
}

impl RelayRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayRole::Public => "public",
            RelayRole::Private => "private",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub token: Option<String>,
    pub token_env: String,
    pub api_base: String,
    pub guild: Option<String>,
    pub output_channel: String,
    pub listen_channels: Vec<String>,
    pub history_limit: usize,
    pub poll_interval_ms: u64,
    /// Authors whose messages never trigger a snapshot (the founders).
    pub ignore_authors: Vec<String>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_env: DEFAULT_DISCORD_TOKEN_ENV.to_string(),
            api_base: DEFAULT_DISCORD_API_BASE.to_string(),
            guild: None,
            output_channel: DEFAULT_OUTPUT_CHANNEL.to_string(),
            listen_channels: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ignore_authors: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub base_url: String,
    pub model: String,
    pub reply_model: Option<String>,
    /// 0 leaves the client without a timeout.
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: DEFAULT_LLM_API_KEY_ENV.to_string(),
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            reply_model: None,
            timeout_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub retry_interval_ms: u64,
    pub escalation_threshold: u8,
    pub message_max_chars: usize,
    pub escalate_on_decode_failure: bool,
    pub echo_private_messages: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            message_max_chars: DEFAULT_MESSAGE_MAX_CHARS,
            escalate_on_decode_failure: true,
            echo_private_messages: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    pub role: RelayRole,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub relay: RelaySettings,
}

impl RelayConfig {
    pub fn new(role: RelayRole) -> Self {
        Self {
            role,
            service_name: None,
            discord: DiscordConfig::default(),
            llm: LlmConfig::default(),
            relay: RelaySettings::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: RelayConfig = toml::from_str(content)?;
        config.normalize().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn normalize(&mut self) -> Result<(), String> {
        self.discord.output_channel = self.discord.output_channel.trim().to_string();
        if self.discord.output_channel.is_empty() {
            return Err("discord.output_channel must not be empty".to_string());
        }
        self.discord.listen_channels.retain(|name| !name.trim().is_empty());
        if self.discord.listen_channels.is_empty() {
            self.discord
                .listen_channels
                .push(self.discord.output_channel.clone());
        }
        if self.discord.history_limit == 0 || self.discord.history_limit > MAX_HISTORY_LIMIT {
            return Err(format!(
                "discord.history_limit must be within 1..={}",
                MAX_HISTORY_LIMIT
            ));
        }
        if self.discord.poll_interval_ms == 0 {
            return Err("discord.poll_interval_ms must be > 0".to_string());
        }
        self.discord.api_base = self.discord.api_base.trim_end_matches('/').to_string();
        self.discord.guild = self
            .discord
            .guild
            .take()
            .map(|guild| guild.trim().to_string())
            .filter(|guild| !guild.is_empty());
        for author in self.discord.ignore_authors.iter_mut() {
            *author = author.trim().to_string();
        }

        self.llm.base_url = self.llm.base_url.trim_end_matches('/').to_string();
        if self.llm.model.trim().is_empty() {
            return Err("llm.model must not be empty".to_string());
        }

        if self.relay.retry_interval_ms == 0 {
            return Err("relay.retry_interval_ms must be > 0".to_string());
        }
        EscalationPolicy::new(self.relay.escalation_threshold)?;
        if self.relay.message_max_chars == 0
            || self.relay.message_max_chars > DISCORD_MESSAGE_CEILING
        {
            return Err(format!(
                "relay.message_max_chars must be within 1..={}",
                DISCORD_MESSAGE_CEILING
            ));
        }
        Ok(())
    }

    pub fn service_name(&self) -> String {
        self.service_name
            .clone()
            .unwrap_or_else(|| format!("relay_{}", self.role.as_str()))
    }

    pub fn discord_token(&self) -> Result<String, ConfigError> {
        resolve_secret(
            self.discord.token.as_deref(),
            &self.discord.token_env,
            "discord bot token",
        )
    }

    pub fn llm_api_key(&self) -> Result<String, ConfigError> {
        resolve_secret(self.llm.api_key.as_deref(), &self.llm.api_key_env, "llm api key")
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.relay.retry_interval_ms)
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy::new(self.relay.escalation_threshold).unwrap_or_default()
    }
}

fn resolve_secret(
    inline: Option<&str>,
    env_name: &str,
    what: &'static str,
) -> Result<String, ConfigError> {
    if let Some(value) = inline.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(value.to_string());
    }
    match std::env::var(env_name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::MissingSecret {
            what,
            env: env_name.to_string(),
        }),
    }
}
