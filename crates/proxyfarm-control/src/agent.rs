//! Agent runtime
//!
//! The agent listens for the controller, opens the handshake on every accepted
//! connection, then executes commands and reports uplink state. Only the most
//! recently activated session is live; anything an older session does after
//! being superseded is ignored.

use proxyfarm_crypto::{KeySchedule, SharedSecret};
use proxyfarm_proto::{
    AgentSnapshot, AgentStatus, Command, ControlMessage, Event, LogPayload, StatusUpdate,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::ControlChannel;
use crate::driver::UplinkDriver;
use crate::error::{ControlError, SessionError};
use crate::outbox::{Outbox, DEFAULT_OUTBOX_CAPACITY};
use crate::session::{
    ControlSession, SessionConfig, SessionOutput, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_DECRYPT_FAILURES,
};

/// Agent runtime configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub name: String,
    /// Address reported in REGISTER (typically the VPN address)
    pub advertised_ip: String,
    pub advertised_port: Option<u16>,
    /// Empty means the agent is awaiting pairing and refuses handshakes
    pub shared_key: String,
    pub key_schedule: KeySchedule,
    pub handshake_timeout: Duration,
    pub max_consecutive_decrypt_failures: Option<u32>,
    pub status_interval: Duration,
    pub outbox_capacity: usize,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, shared_key: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            advertised_ip: "127.0.0.1".to_string(),
            advertised_port: None,
            shared_key: shared_key.into(),
            key_schedule: KeySchedule::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_consecutive_decrypt_failures: Some(DEFAULT_MAX_DECRYPT_FAILURES),
            status_interval: Duration::from_secs(5),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            key_schedule: self.key_schedule,
            handshake_timeout: self.handshake_timeout,
            max_consecutive_decrypt_failures: self.max_consecutive_decrypt_failures,
        }
    }
}

struct LinkState {
    live: Option<(Uuid, mpsc::UnboundedSender<Event>)>,
    outbox: Outbox,
}

/// Routes outbound events to the live session, buffering while there is none
pub struct AgentLink {
    state: Mutex<LinkState>,
    current: watch::Sender<Option<Uuid>>,
}

impl AgentLink {
    pub fn new(outbox_capacity: usize) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            state: Mutex::new(LinkState {
                live: None,
                outbox: Outbox::new(outbox_capacity),
            }),
            current,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send to the live session, or queue in the outbox
    pub fn send(&self, event: Event) {
        let mut state = self.lock();
        let event = match &state.live {
            Some((_, tx)) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        if state.outbox.push(event).is_some() {
            // Not logged above DEBUG: forwarded logs land here
            debug!("Outbox full, dropped oldest event");
        }
    }

    /// Send only if a session is live. Returns whether it was sent.
    pub fn send_if_active(&self, event: Event) -> bool {
        let state = self.lock();
        match &state.live {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Make `session_id` the live session. Returns the buffered backlog,
    /// oldest first, which must be sent before anything else.
    pub fn activate(&self, session_id: Uuid, tx: mpsc::UnboundedSender<Event>) -> Vec<Event> {
        let backlog = {
            let mut state = self.lock();
            if let Some((old, _)) = state.live.replace((session_id, tx)) {
                info!(old_session = %old, new_session = %session_id, "Session superseded");
            }
            state.outbox.drain()
        };
        self.current.send_replace(Some(session_id));
        backlog
    }

    /// Retire `session_id`. Undelivered events go back to the outbox, or to
    /// the newer session if this one was already superseded.
    pub fn deactivate(&self, session_id: Uuid, mut pending: mpsc::UnboundedReceiver<Event>) {
        pending.close();
        let mut undelivered = Vec::new();
        while let Ok(event) = pending.try_recv() {
            undelivered.push(event);
        }

        let was_current = {
            let mut state = self.lock();
            let was_current = matches!(&state.live, Some((id, _)) if *id == session_id);
            if was_current {
                state.live = None;
            }
            was_current
        };

        if was_current {
            self.current.send_replace(None);
        }
        for event in undelivered {
            self.send(event);
        }
    }

    pub fn is_current(&self, session_id: Uuid) -> bool {
        *self.current.borrow() == Some(session_id)
    }

    pub fn is_active(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Live session id changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Uuid>> {
        self.current.subscribe()
    }

    pub fn outbox_len(&self) -> usize {
        self.lock().outbox.len()
    }
}

pub struct AgentRuntime {
    config: AgentConfig,
    driver: Arc<dyn UplinkDriver>,
    link: Arc<AgentLink>,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig, driver: Arc<dyn UplinkDriver>) -> Self {
        let link = Arc::new(AgentLink::new(config.outbox_capacity));
        Self {
            config,
            driver,
            link,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn link(&self) -> Arc<AgentLink> {
        Arc::clone(&self.link)
    }

    /// Accept controller connections until `shutdown` fires
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ControlError> {
        if self.config.shared_key.is_empty() {
            warn!(agent_id = %self.config.agent_id, "No shared key configured, awaiting pairing");
        }
        info!(
            agent_id = %self.config.agent_id,
            "Agent listening on {}",
            listener.local_addr()?
        );

        let status = tokio::spawn(Arc::clone(&self).status_loop(shutdown.clone()));

        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept controller connection: {}", e);
                        continue;
                    }
                },
            };

            debug!("Controller connection from {}", peer_addr);
            let _ = socket.set_nodelay(true);

            let runtime = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = runtime.handle_connection(socket) => {
                        if let Err(e) = result {
                            warn!(peer = %peer_addr, "Control connection ended: {}", e);
                        }
                    }
                }
            });
        }

        status.abort();
        Ok(())
    }

    /// Run one control session over `io` until it closes or is superseded
    pub async fn handle_connection<T>(&self, io: T) -> Result<(), ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = ControlSession::agent(
            &self.config.agent_id,
            SharedSecret::new(self.config.shared_key.clone()),
            self.config.session_config(),
        );
        let mut channel = ControlChannel::new(io);

        channel.handshake(&mut session).await?;
        let session_id = session.id();
        info!(agent_id = %self.config.agent_id, session_id = %session_id, "Controller session active");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let backlog = self.link.activate(session_id, tx);

        let result = self
            .run_session(&mut channel, &mut session, backlog, &mut rx)
            .await;

        self.link.deactivate(session_id, rx);
        session.disconnect();
        result
    }

    async fn run_session<T>(
        &self,
        channel: &mut ControlChannel<T>,
        session: &mut ControlSession,
        backlog: Vec<Event>,
        rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<(), ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let session_id = session.id();
        let mut current = self.link.subscribe();

        // Buffered events first, then a fresh snapshot
        for event in backlog {
            channel.send(session.seal(&event)?).await?;
        }
        channel
            .send(session.seal(&Event::Register(self.snapshot().await))?)
            .await?;

        loop {
            tokio::select! {
                inbound = channel.recv() => {
                    let Some(msg) = inbound? else {
                        info!(session_id = %session_id, "Controller closed the connection");
                        return Ok(());
                    };
                    if !self.link.is_current(session_id) {
                        debug!(session_id = %session_id, "Ignoring message on superseded session");
                        return Ok(());
                    }
                    self.on_message(channel, session, msg).await?;
                }
                outbound = rx.recv() => match outbound {
                    Some(event) => channel.send(session.seal(&event)?).await?,
                    None => return Ok(()),
                },
                changed = current.changed() => {
                    if changed.is_err() || *current.borrow() != Some(session_id) {
                        info!(session_id = %session_id, "Session superseded, closing");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn on_message<T>(
        &self,
        channel: &mut ControlChannel<T>,
        session: &mut ControlSession,
        msg: ControlMessage,
    ) -> Result<(), ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match session.handle(msg) {
            Ok(SessionOutput::Event(Event::Command(command))) => {
                self.execute(&command).await;
                let update = Event::StatusUpdate(StatusUpdate {
                    id: self.config.agent_id.clone(),
                    uplinks: self.driver.uplinks().await,
                });
                channel.send(session.seal(&update)?).await?;
                Ok(())
            }
            Ok(SessionOutput::Event(other)) => {
                debug!("Ignoring {} event from controller", other.event_type());
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(SessionError::KeyDesync(failures)) => {
                warn!(
                    agent_id = %self.config.agent_id,
                    failures,
                    "Session key desynchronized, dropping connection"
                );
                Err(SessionError::KeyDesync(failures).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(&self, command: &Command) {
        info!(
            uplink_id = %command.target_uplink_id,
            operation = %command.operation,
            "Executing command"
        );
        if let Err(e) = self.driver.execute(command).await {
            warn!(
                uplink_id = %command.target_uplink_id,
                operation = %command.operation,
                "Command failed: {}",
                e
            );
        }
    }

    async fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.config.agent_id.clone(),
            name: self.config.name.clone(),
            ip: self.config.advertised_ip.clone(),
            port: self.config.advertised_port,
            status: AgentStatus::Online,
            uplinks: self.driver.uplinks().await,
            health: Some(self.driver.health().await),
        }
    }

    /// Periodic STATUS_UPDATE while a session is live
    async fn status_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.status_interval.max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            if !self.link.is_active() {
                continue;
            }
            let update = Event::StatusUpdate(StatusUpdate {
                id: self.config.agent_id.clone(),
                uplinks: self.driver.uplinks().await,
            });
            self.link.send_if_active(update);
        }
    }

    /// Pump captured log lines into the link until the sender side closes
    pub async fn forward_logs(link: Arc<AgentLink>, mut logs: mpsc::UnboundedReceiver<LogPayload>) {
        while let Some(log) = logs.recv().await {
            link.send(Event::Log(log));
        }
    }
}
