//! Uplink and agent data model shared by the control plane and the relay

use serde::{Deserialize, Serialize};

/// Operational state of one uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UplinkStatus {
    Online,
    Offline,
    Rebooting,
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimStatus {
    Ready,
    Locked,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyProtocol {
    Http,
    Socks5,
}

/// One outbound network path exposed by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uplink {
    pub id: String,
    pub interface_name: String,
    pub status: UplinkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    /// 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_status: Option<SimStatus>,
    /// Port of the proxy process on the agent host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProxyProtocol>,
}

impl Uplink {
    pub fn new(id: impl Into<String>, interface_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            interface_name: interface_name.into(),
            status: UplinkStatus::Offline,
            iccid: None,
            imsi: None,
            imei: None,
            operator: None,
            signal_quality: None,
            ip_address: None,
            sim_status: None,
            proxy_port: None,
            protocol: None,
        }
    }
}

/// Host health reported alongside a registration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_temp: Option<f32>,
    /// Percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_load: Option<f32>,
    /// Percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f32>,
    pub undervoltage_detected: bool,
    /// Seconds
    pub uptime: u64,
    #[serde(default)]
    pub recent_logs: Vec<String>,
}

/// Agent connectivity as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "ONLINE"),
            AgentStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Full state snapshot sent in a REGISTER event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Address the agent is reachable on (typically its VPN address)
    #[serde(default)]
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: AgentStatus,
    pub uplinks: Vec<Uplink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<SystemHealth>,
}

/// Relay binding: one public entry port forwarding to one target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayBinding {
    pub entry_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl RelayBinding {
    pub fn new(entry_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            entry_port,
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Target address in `host:port` form (IPv6 hosts are bracketed)
    pub fn target_addr(&self) -> String {
        if self.target_host.contains(':') && !self.target_host.starts_with('[') {
            format!("[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("{}:{}", self.target_host, self.target_port)
        }
    }

    pub fn same_target(&self, other: &RelayBinding) -> bool {
        self.target_host == other.target_host && self.target_port == other.target_port
    }
}

impl std::fmt::Display for RelayBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{} -> {}", self.entry_port, self.target_addr())
    }
}
