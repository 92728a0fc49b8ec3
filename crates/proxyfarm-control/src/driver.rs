//! Uplink driver interface used by the agent runtime
//!
//! The real driver (modem scanning, SIM unlock, proxy process supervision)
//! lives outside this crate. [`MockUplinkDriver`] simulates two uplinks for
//! development and tests.

use async_trait::async_trait;
use proxyfarm_proto::{Command, Operation, SimStatus, SystemHealth, Uplink, UplinkStatus};
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Unknown uplink: {0}")]
    UnknownUplink(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(Operation),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Driver failure: {0}")]
    Failed(String),
}

#[async_trait]
pub trait UplinkDriver: Send + Sync {
    /// Current uplink inventory
    async fn uplinks(&self) -> Vec<Uplink>;

    /// Host health for REGISTER snapshots
    async fn health(&self) -> SystemHealth;

    /// Apply one controller command
    async fn execute(&self, command: &Command) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

struct MockUplink {
    uplink: Uplink,
    running: bool,
    credentials: Option<Credentials>,
}

/// Two simulated uplinks with timed REBOOT and ROTATE transitions
pub struct MockUplinkDriver {
    uplinks: Arc<Mutex<Vec<MockUplink>>>,
    reboot_delay: Duration,
    rotate_delay: Duration,
    started_at: Instant,
}

impl MockUplinkDriver {
    pub fn new() -> Self {
        Self::with_delays(Duration::from_secs(5), Duration::from_secs(3))
    }

    pub fn with_delays(reboot_delay: Duration, rotate_delay: Duration) -> Self {
        let uplinks = [
            ("mock_modem_1", "wwan0", "8933010000000000001", 85, "10.0.0.5", 20000),
            ("mock_modem_2", "wwan1", "8933010000000000002", 60, "10.0.0.6", 20002),
        ]
        .into_iter()
        .map(|(id, iface, iccid, signal, ip, port)| {
            let mut uplink = Uplink::new(id, iface);
            uplink.status = UplinkStatus::Online;
            uplink.iccid = Some(iccid.to_string());
            uplink.signal_quality = Some(signal);
            uplink.ip_address = Some(ip.to_string());
            uplink.sim_status = Some(SimStatus::Ready);
            uplink.proxy_port = Some(port);
            MockUplink {
                uplink,
                running: false,
                credentials: None,
            }
        })
        .collect();

        Self {
            uplinks: Arc::new(Mutex::new(uplinks)),
            reboot_delay,
            rotate_delay,
            started_at: Instant::now(),
        }
    }

    /// Whether START has been applied (and not undone by STOP)
    pub fn is_running(&self, uplink_id: &str) -> bool {
        self.with_uplink(uplink_id, |u| u.running).unwrap_or(false)
    }

    pub fn credentials(&self, uplink_id: &str) -> Option<Credentials> {
        self.with_uplink(uplink_id, |u| u.credentials.clone())
            .flatten()
    }

    fn with_uplink<R>(&self, uplink_id: &str, f: impl FnOnce(&mut MockUplink) -> R) -> Option<R> {
        let mut uplinks = self.uplinks.lock().unwrap_or_else(PoisonError::into_inner);
        uplinks.iter_mut().find(|u| u.uplink.id == uplink_id).map(f)
    }

    /// Set a transitional status now, then bring the uplink back online later
    fn transition(&self, uplink_id: &str, status: UplinkStatus, delay: Duration, new_ip: bool) {
        let uplinks = Arc::clone(&self.uplinks);
        let uplink_id = uplink_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut uplinks = uplinks.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(u) = uplinks.iter_mut().find(|u| u.uplink.id == uplink_id) {
                if u.uplink.status != status {
                    return;
                }
                u.uplink.status = UplinkStatus::Online;
                if new_ip {
                    let octet: u8 = rand::thread_rng().gen_range(2..255);
                    u.uplink.ip_address = Some(format!("10.0.0.{}", octet));
                }
                info!(
                    uplink_id = %uplink_id,
                    ip = ?u.uplink.ip_address,
                    "Uplink back online"
                );
            }
        });
    }
}

impl Default for MockUplinkDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn string_param(command: &Command, name: &str) -> Option<String> {
    command
        .parameters
        .as_ref()
        .and_then(|p| p.get(name))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[async_trait]
impl UplinkDriver for MockUplinkDriver {
    async fn uplinks(&self) -> Vec<Uplink> {
        let uplinks = self.uplinks.lock().unwrap_or_else(PoisonError::into_inner);
        uplinks.iter().map(|u| u.uplink.clone()).collect()
    }

    async fn health(&self) -> SystemHealth {
        SystemHealth {
            cpu_temp: Some(45.0),
            cpu_load: Some(12.5),
            memory_usage: Some(30.0),
            undervoltage_detected: false,
            uptime: self.started_at.elapsed().as_secs(),
            recent_logs: Vec::new(),
        }
    }

    async fn execute(&self, command: &Command) -> Result<(), DriverError> {
        let id = command.target_uplink_id.as_str();

        let applied = match command.operation {
            Operation::Start => self.with_uplink(id, |u| {
                u.running = true;
                u.uplink.status = UplinkStatus::Online;
            }),
            Operation::Stop => self.with_uplink(id, |u| {
                u.running = false;
                u.uplink.status = UplinkStatus::Offline;
            }),
            Operation::Reboot => {
                let found = self.with_uplink(id, |u| u.uplink.status = UplinkStatus::Rebooting);
                if found.is_some() {
                    self.transition(id, UplinkStatus::Rebooting, self.reboot_delay, false);
                }
                found
            }
            Operation::Rotate => {
                let found = self.with_uplink(id, |u| u.uplink.status = UplinkStatus::Connecting);
                if found.is_some() {
                    self.transition(id, UplinkStatus::Connecting, self.rotate_delay, true);
                }
                found
            }
            Operation::UpdateAuth => {
                let (user, pass) = match (string_param(command, "user"), string_param(command, "pass")) {
                    (Some(user), Some(pass)) => (user, pass),
                    _ => {
                        return Err(DriverError::InvalidParameters(
                            "UPDATE_AUTH requires user and pass".to_string(),
                        ))
                    }
                };
                self.with_uplink(id, |u| u.credentials = Some(Credentials { user, pass }))
            }
            Operation::Unlock => {
                if string_param(command, "pin").is_none() {
                    return Err(DriverError::InvalidParameters(
                        "UNLOCK requires pin".to_string(),
                    ));
                }
                self.with_uplink(id, |u| u.uplink.sim_status = Some(SimStatus::Ready))
            }
            Operation::Unknown => {
                warn!(uplink_id = %id, "Ignoring unknown operation");
                return Err(DriverError::Unsupported(Operation::Unknown));
            }
        };

        applied.ok_or_else(|| DriverError::UnknownUplink(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(uplinks: &[Uplink], id: &str) -> UplinkStatus {
        uplinks.iter().find(|u| u.id == id).unwrap().status
    }

    #[tokio::test]
    async fn test_start_stop() {
        let driver = MockUplinkDriver::new();
        driver
            .execute(&Command::new(Operation::Start, "mock_modem_1"))
            .await
            .unwrap();
        assert!(driver.is_running("mock_modem_1"));

        driver
            .execute(&Command::new(Operation::Stop, "mock_modem_1"))
            .await
            .unwrap();
        assert!(!driver.is_running("mock_modem_1"));
        assert_eq!(
            status(&driver.uplinks().await, "mock_modem_1"),
            UplinkStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_reboot_transition() {
        let driver = MockUplinkDriver::with_delays(Duration::from_millis(20), Duration::from_millis(20));
        driver
            .execute(&Command::new(Operation::Reboot, "mock_modem_2"))
            .await
            .unwrap();
        assert_eq!(
            status(&driver.uplinks().await, "mock_modem_2"),
            UplinkStatus::Rebooting
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            status(&driver.uplinks().await, "mock_modem_2"),
            UplinkStatus::Online
        );
    }

    #[tokio::test]
    async fn test_update_auth() {
        let driver = MockUplinkDriver::new();
        let cmd = Command::new(Operation::UpdateAuth, "mock_modem_1")
            .with_parameters(json!({"user": "u1", "pass": "p1"}));
        driver.execute(&cmd).await.unwrap();
        assert_eq!(
            driver.credentials("mock_modem_1"),
            Some(Credentials {
                user: "u1".to_string(),
                pass: "p1".to_string()
            })
        );

        let missing = Command::new(Operation::UpdateAuth, "mock_modem_1");
        assert!(matches!(
            driver.execute(&missing).await,
            Err(DriverError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_uplink() {
        let driver = MockUplinkDriver::new();
        let result = driver
            .execute(&Command::new(Operation::Start, "modem_404"))
            .await;
        assert_eq!(
            result,
            Err(DriverError::UnknownUplink("modem_404".to_string()))
        );
    }
}
