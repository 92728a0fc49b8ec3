//! Binding table: one listener per entry port

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use proxyfarm_proto::RelayBinding;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityKind, RelayActivity};
use crate::connection::{relay_connection, DEFAULT_CONNECT_TIMEOUT};
use crate::error::RelayError;

const ACTIVITY_CHANNEL_CAPACITY: usize = 1024;
const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address entry ports are bound on
    pub bind_address: IpAddr,
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A new listener was opened
    Bound(SocketAddr),
    /// The port already relays to the same target
    AlreadyBound,
}

struct Listener {
    binding: RelayBinding,
    local_addr: SocketAddr,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

/// Shared state of one accept loop
#[derive(Clone)]
struct ListenerContext {
    binding: RelayBinding,
    connect_timeout: Duration,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    activity: broadcast::Sender<RelayActivity>,
}

pub struct RelayManager {
    config: RelayConfig,
    listeners: DashMap<u16, Listener>,
    activity: broadcast::Sender<RelayActivity>,
}

impl RelayManager {
    pub fn new(config: RelayConfig) -> Self {
        let (activity, _) = broadcast::channel(ACTIVITY_CHANNEL_CAPACITY);
        Self {
            config,
            listeners: DashMap::new(),
            activity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayActivity> {
        self.activity.subscribe()
    }

    /// Make sure `binding.entry_port` relays to `binding`'s target.
    ///
    /// Must be called from within a tokio runtime. Safe to call concurrently;
    /// the first binding of a port wins and a different target is refused.
    pub fn ensure(&self, binding: &RelayBinding) -> Result<EnsureOutcome, RelayError> {
        let vacant = match self.listeners.entry(binding.entry_port) {
            Entry::Occupied(existing) => {
                let existing = &existing.get().binding;
                if existing.same_target(binding) {
                    return Ok(EnsureOutcome::AlreadyBound);
                }
                warn!(
                    entry_port = binding.entry_port,
                    existing = %existing.target_addr(),
                    requested = %binding.target_addr(),
                    "Refusing to rebind entry port"
                );
                return Err(RelayError::TargetConflict {
                    port: binding.entry_port,
                    existing: existing.target_addr(),
                    requested: binding.target_addr(),
                });
            }
            Entry::Vacant(vacant) => vacant,
        };

        let addr = SocketAddr::new(self.config.bind_address, binding.entry_port);
        let listener = match bind_listener(addr) {
            Ok(listener) => listener,
            Err(e) => {
                let err = RelayError::BindError {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    reason: e.to_string(),
                };
                error!(entry_port = binding.entry_port, "Bind failed: {}", e);
                self.publish(RelayActivity::new(
                    binding.entry_port,
                    ActivityKind::BindFailed,
                    err.to_string(),
                ));
                return Err(err);
            }
        };
        let local_addr = listener.local_addr()?;

        let ctx = ListenerContext {
            binding: binding.clone(),
            connect_timeout: self.config.connect_timeout,
            active: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            activity: self.activity.clone(),
        };
        vacant.insert(Listener {
            binding: binding.clone(),
            local_addr,
            active: Arc::clone(&ctx.active),
            cancel: ctx.cancel.clone(),
        });
        tokio::spawn(accept_loop(listener, ctx));

        info!(entry_port = binding.entry_port, target = %binding.target_addr(), "Relay listening on {}", local_addr);
        self.publish(RelayActivity::new(
            binding.entry_port,
            ActivityKind::Bound,
            format!("Forwarding {} -> {}", local_addr, binding.target_addr()),
        ));
        Ok(EnsureOutcome::Bound(local_addr))
    }

    /// Close the port's listener and every live connection pair on it
    pub fn stop(&self, port: u16) -> bool {
        let Some((_, listener)) = self.listeners.remove(&port) else {
            return false;
        };
        listener.cancel.cancel();

        info!(entry_port = port, "Relay stopped");
        self.publish(RelayActivity::new(
            port,
            ActivityKind::Stopped,
            format!("Stopped forwarding to {}", listener.binding.target_addr()),
        ));
        true
    }

    pub fn stop_all(&self) {
        let ports: Vec<u16> = self.listeners.iter().map(|l| *l.key()).collect();
        for port in ports {
            self.stop(port);
        }
    }

    /// Reconcile against the full desired binding list. Returns the bindings
    /// that could not be applied.
    pub fn sync(&self, desired: &[RelayBinding]) -> Vec<(RelayBinding, RelayError)> {
        let wanted: HashSet<u16> = desired.iter().map(|b| b.entry_port).collect();

        let stale: Vec<u16> = self
            .listeners
            .iter()
            .filter(|l| !wanted.contains(l.key()))
            .map(|l| *l.key())
            .collect();
        for port in stale {
            self.stop(port);
        }

        let mut failures = Vec::new();
        for binding in desired {
            if let Err(e) = self.ensure(binding) {
                failures.push((binding.clone(), e));
            }
        }
        failures
    }

    pub fn bindings(&self) -> Vec<RelayBinding> {
        let mut bindings: Vec<RelayBinding> =
            self.listeners.iter().map(|l| l.binding.clone()).collect();
        bindings.sort_by_key(|b| b.entry_port);
        bindings
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }

    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners.get(&port).map(|l| l.local_addr)
    }

    /// Live connection pairs on `port`
    pub fn active_connections(&self, port: u16) -> Option<usize> {
        self.listeners
            .get(&port)
            .map(|l| l.active.load(Ordering::Relaxed))
    }

    fn publish(&self, activity: RelayActivity) {
        let _ = self.activity.send(activity);
    }
}

impl Drop for RelayManager {
    fn drop(&mut self) {
        for listener in self.listeners.iter() {
            listener.cancel.cancel();
        }
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(listener: TcpListener, ctx: ListenerContext) {
    let port = ctx.binding.entry_port;

    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(entry_port = port, "Failed to accept relay connection: {}", e);
                    continue;
                }
            },
        };

        debug!(entry_port = port, peer = %peer_addr, "Relay connection accepted");
        let ctx = ctx.clone();
        tokio::spawn(async move {
            ctx.active.fetch_add(1, Ordering::Relaxed);
            let target = ctx.binding.target_addr();
            let result = relay_connection(
                socket,
                peer_addr,
                &target,
                ctx.connect_timeout,
                ctx.cancel.child_token(),
            )
            .await;
            ctx.active.fetch_sub(1, Ordering::Relaxed);

            let activity = match result {
                Ok(stats) => {
                    info!(
                        entry_port = port,
                        peer = %peer_addr,
                        hostname = stats.hostname_guess.as_deref().unwrap_or("-"),
                        up = stats.bytes.up,
                        down = stats.bytes.down,
                        "Relay connection closed"
                    );
                    RelayActivity::closed(
                        port,
                        format!("{} -> {} closed", peer_addr, target),
                        stats.hostname_guess,
                        stats.bytes,
                    )
                }
                Err(e) => {
                    warn!(entry_port = port, peer = %peer_addr, "{}", e);
                    RelayActivity::new(port, ActivityKind::UpstreamFailed, e.to_string())
                }
            };
            let _ = ctx.activity.send(activity);
        });
    }

    debug!(entry_port = port, "Accept loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> RelayManager {
        RelayManager::new(RelayConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(1),
        })
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let manager = loopback();
        let port = free_port();
        let binding = RelayBinding::new(port, "127.0.0.1", 9);

        assert!(matches!(
            manager.ensure(&binding).unwrap(),
            EnsureOutcome::Bound(addr) if addr.port() == port
        ));
        assert_eq!(manager.ensure(&binding).unwrap(), EnsureOutcome::AlreadyBound);
        assert_eq!(manager.bindings(), vec![binding]);
        assert_eq!(manager.active_connections(port), Some(0));
    }

    #[tokio::test]
    async fn test_first_bind_wins() {
        let manager = loopback();
        let port = free_port();
        manager
            .ensure(&RelayBinding::new(port, "127.0.0.1", 9))
            .unwrap();

        let err = manager
            .ensure(&RelayBinding::new(port, "127.0.0.2", 9))
            .unwrap_err();
        assert!(matches!(err, RelayError::TargetConflict { port: p, .. } if p == port));
        assert_eq!(manager.bindings()[0].target_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let manager = loopback();
        let mut activity = manager.subscribe();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = manager
            .ensure(&RelayBinding::new(port, "127.0.0.1", 9))
            .unwrap_err();
        assert!(matches!(err, RelayError::BindError { .. }));
        assert!(!manager.is_bound(port));
        assert_eq!(activity.try_recv().unwrap().kind, ActivityKind::BindFailed);
    }

    #[tokio::test]
    async fn test_sync_stops_unlisted() {
        let manager = loopback();
        let (a, b, c) = (free_port(), free_port(), free_port());
        manager.ensure(&RelayBinding::new(a, "127.0.0.1", 9)).unwrap();
        manager.ensure(&RelayBinding::new(b, "127.0.0.1", 9)).unwrap();

        let failures = manager.sync(&[
            RelayBinding::new(b, "127.0.0.1", 9),
            RelayBinding::new(c, "127.0.0.1", 9),
        ]);
        assert!(failures.is_empty());
        assert!(!manager.is_bound(a));
        assert!(manager.is_bound(b));
        assert!(manager.is_bound(c));

        assert!(!manager.stop(a));
        manager.stop_all();
        assert!(manager.bindings().is_empty());
    }
}
