//! YAML configuration for the controller and agent processes
//!
//! Files live in `~/.proxyfarm/` unless a path is given with `--config` or
//! `PROXYFARM_CONFIG`.

use anyhow::{bail, Context, Result};
use proxyfarm_control::{AgentConfig, AgentSpec, ControllerConfig, DEFAULT_MAX_DECRYPT_FAILURES};
use proxyfarm_crypto::KeySchedule;
use proxyfarm_relay::RelayConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default config path for `file_name`
pub fn default_path(file_name: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".proxyfarm").join(file_name))
}

fn default_relay_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_timeout() -> u64 {
    10
}

fn default_max_decrypt_failures() -> Option<u32> {
    Some(DEFAULT_MAX_DECRYPT_FAILURES)
}

fn default_status_interval() -> u64 {
    5
}

fn default_agent_listen() -> String {
    "0.0.0.0:3001".to_string()
}

/// Controller configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerFile {
    /// Address entry ports are bound on
    #[serde(default = "default_relay_bind")]
    pub relay_bind: IpAddr,

    /// How often desired state is re-read
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_seconds: u64,

    #[serde(default = "default_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_timeout")]
    pub handshake_timeout_seconds: u64,

    /// Upstream connect timeout for relayed connections
    #[serde(default = "default_timeout")]
    pub relay_connect_timeout_seconds: u64,

    #[serde(default)]
    pub key_schedule: KeySchedule,

    /// Consecutive undecryptable envelopes before a session is dropped;
    /// `null` never drops it
    #[serde(default = "default_max_decrypt_failures")]
    pub max_decrypt_failures: Option<u32>,

    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

impl ControllerFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: Self = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("reconnect_interval_seconds", self.reconnect_interval_seconds),
            ("connect_timeout_seconds", self.connect_timeout_seconds),
            ("handshake_timeout_seconds", self.handshake_timeout_seconds),
            ("relay_connect_timeout_seconds", self.relay_connect_timeout_seconds),
        ] {
            if value == 0 {
                bail!("{} must be at least 1", field);
            }
        }
        if self.max_decrypt_failures == Some(0) {
            bail!("max_decrypt_failures must be at least 1, or null to never drop a session");
        }

        let mut ids = HashSet::new();
        let mut ports = HashSet::new();

        for spec in &self.agents {
            let agent = &spec.agent;
            if agent.agent_id.is_empty() {
                bail!("Agent with host {} has no agent_id", agent.host);
            }
            if !ids.insert(agent.agent_id.as_str()) {
                bail!("Duplicate agent_id '{}'", agent.agent_id);
            }
            if agent.shared_key.is_empty() {
                warn!(agent_id = %agent.agent_id, "Agent has no shared key, handshakes will fail");
            }
            for uplink in &spec.uplinks {
                if let Some(port) = uplink.entry_port {
                    if !ports.insert(port) {
                        bail!("Entry port {} is assigned twice", port);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            reconnect_interval: Duration::from_secs(self.reconnect_interval_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_seconds),
            key_schedule: self.key_schedule,
            max_consecutive_decrypt_failures: self.max_decrypt_failures,
            refresh_interval: Duration::from_secs(self.refresh_interval_seconds.max(1)),
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_address: self.relay_bind,
            connect_timeout: Duration::from_secs(self.relay_connect_timeout_seconds),
        }
    }
}

/// Agent configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFile {
    pub agent_id: String,

    #[serde(default)]
    pub name: String,

    /// Address the controller dials
    #[serde(default = "default_agent_listen")]
    pub listen: String,

    /// Reported in REGISTER
    #[serde(default)]
    pub advertised_ip: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised_port: Option<u16>,

    /// Empty until paired with the controller
    #[serde(default)]
    pub shared_key: String,

    /// Legacy name of `shared_key`
    #[serde(default, rename = "apiKey", skip_serializing)]
    pub legacy_api_key: Option<String>,

    #[serde(default = "default_status_interval")]
    pub status_interval_seconds: u64,

    #[serde(default = "default_timeout")]
    pub handshake_timeout_seconds: u64,

    #[serde(default)]
    pub key_schedule: KeySchedule,
}

impl AgentFile {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: String::new(),
            listen: default_agent_listen(),
            advertised_ip: String::new(),
            advertised_port: None,
            shared_key: String::new(),
            legacy_api_key: None,
            status_interval_seconds: default_status_interval(),
            handshake_timeout_seconds: default_timeout(),
            key_schedule: KeySchedule::default(),
        }
    }

    /// Load the agent file, migrating a legacy `apiKey` in place
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut file: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        file.validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        if file.migrate_legacy_key() {
            file.save(path)?;
            info!("Migrated legacy apiKey to shared_key in {:?}", path);
        }
        if file.shared_key.is_empty() {
            warn!("No shared key in {:?}, agent will wait for pairing", path);
        }

        Ok(file)
    }

    /// Load `path`, or create an unpaired file for `agent_id` if it is missing
    pub fn load_or_create(path: &Path, agent_id: &str) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        info!("No agent config at {:?}, creating one (awaiting pairing)", path);
        let file = Self::new(agent_id);
        file.save(path)?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        if self.handshake_timeout_seconds == 0 {
            bail!("handshake_timeout_seconds must be at least 1");
        }
        if self.status_interval_seconds == 0 {
            bail!("status_interval_seconds must be at least 1");
        }
        Ok(())
    }

    fn migrate_legacy_key(&mut self) -> bool {
        match self.legacy_api_key.take() {
            Some(key) if self.shared_key.is_empty() && !key.is_empty() => {
                self.shared_key = key;
                true
            }
            _ => false,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions of {:?}", path))?;
        }

        Ok(())
    }

    /// Persist a new shared key. A running agent keeps its old key until it
    /// is restarted.
    pub fn set_shared_key(path: &Path, agent_id: &str, key: &str) -> Result<()> {
        let mut file = Self::load_or_create(path, agent_id)?;
        file.shared_key = key.to_string();
        file.save(path)?;
        info!(agent_id = %file.agent_id, "Saved shared key to {:?}", path);
        Ok(())
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(self.agent_id.clone(), self.shared_key.clone());
        config.name = if self.name.is_empty() {
            self.agent_id.clone()
        } else {
            self.name.clone()
        };
        if !self.advertised_ip.is_empty() {
            config.advertised_ip = self.advertised_ip.clone();
        }
        config.advertised_port = self.advertised_port;
        config.key_schedule = self.key_schedule;
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout_seconds);
        config.status_interval = Duration::from_secs(self.status_interval_seconds);
        config
    }
}
