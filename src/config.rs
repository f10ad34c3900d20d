use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_KEEPALIVE_SECS: u64 = 20;

/// 転送の種類
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    Tcp,
    Udp,
}

impl ForwardProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardProtocol::Tcp => "tcp",
            ForwardProtocol::Udp => "udp",
        }
    }
}

/// 転送ルール: ローカルの待ち受けアドレス → リモート側の宛先
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    pub protocol: ForwardProtocol,
    pub listen: SocketAddr,
    /// リモート側で解決されるので、名前でもよい
    pub guest: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub addr: String,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// 0で無効
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_open_timeout_secs() -> u64 {
    DEFAULT_OPEN_TIMEOUT_SECS
}

fn default_keepalive_secs() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

impl AgentConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        match self.keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub agent: AgentConfig,
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

impl Config {
    pub fn from_str(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s).context("Failed to parse the config")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Config> {
        let s = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read the config {:?}", path))?;
        Config::from_str(&s).with_context(|| format!("Invalid config {:?}", path))
    }

    fn validate(&self) -> Result<()> {
        if self.agent.addr.is_empty() {
            bail!("`agent.addr` must not be empty");
        }
        if self.agent.open_timeout_secs == 0 {
            bail!("`agent.open_timeout_secs` must be greater than 0");
        }
        if self.forwards.is_empty() {
            bail!("At least one `[[forwards]]` entry is required");
        }

        let mut seen = HashSet::new();
        for forward in &self.forwards {
            if forward.guest.is_empty() {
                bail!("Forward on {} has an empty `guest` address", forward.listen);
            }
            if !seen.insert((forward.protocol, forward.listen)) {
                bail!(
                    "Duplicated {:?} forward on {}",
                    forward.protocol,
                    forward.listen
                );
            }
        }
        Ok(())
    }
}
