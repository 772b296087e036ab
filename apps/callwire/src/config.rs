use anyhow::{Context, bail};
use serde::Deserialize;

use call_signaling::{ChannelConfig, Identity, ReconnectPolicy, RegistryConfig};

use crate::cli::Cli;

/// Settings read from `CALLWIRE__*` environment variables, nested with `__`
/// (for example `CALLWIRE__REGISTRY__MAX_SESSIONS=2`).
#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Comma separated ICE server URLs. Empty means host candidates only.
    #[serde(default)]
    pub ice_servers: Option<String>,
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub log_path: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("CALLWIRE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.relay_url = normalize_opt(self.relay_url.take());
        self.user_id = normalize_opt(self.user_id.take());
        self.token = normalize_opt(self.token.take());
        self.log_path = normalize_opt(self.log_path.take());
        self.ice_servers = self.ice_servers.take().map(|s| s.trim().to_string());
        self
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Everything the agent needs, flags taking precedence over the environment.
#[derive(Debug)]
pub struct Settings {
    pub channel: ChannelConfig,
    pub identity: Identity,
    pub registry: RegistryConfig,
    /// `None` keeps the engine's default STUN server.
    pub ice_servers: Option<Vec<String>>,
    pub log_path: Option<String>,
}

impl Settings {
    pub fn resolve(cli: &Cli, env: AppConfig) -> anyhow::Result<Self> {
        let Some(relay_url) = normalize_opt(cli.relay_url.clone()).or(env.relay_url) else {
            bail!("relay url missing; pass --relay-url or set CALLWIRE__RELAY_URL");
        };
        let user_id = normalize_opt(cli.user_id.clone())
            .or(env.user_id)
            .context("user id missing; pass --user-id or set CALLWIRE__USER_ID")?;
        let token = normalize_opt(cli.token.clone())
            .or(env.token)
            .context("token missing; pass --token or set CALLWIRE__TOKEN")?;

        let mut channel = ChannelConfig::new(relay_url).with_reconnect(env.reconnect);
        if let Some(interval) = env.heartbeat_interval_ms {
            channel.heartbeat_interval_ms = interval;
        }

        let mut registry = env.registry;
        if cli.auto_answer {
            registry.session.auto_answer = true;
        }

        let ice_servers = if cli.ice_servers.is_empty() {
            env.ice_servers.map(|list| split_list(&list))
        } else {
            Some(cli.ice_servers.clone())
        };

        Ok(Self {
            channel,
            identity: Identity::new(user_id, token),
            registry,
            ice_servers,
            log_path: env.log_path,
        })
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
