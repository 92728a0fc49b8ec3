//! Controller runtime
//!
//! Keeps one dial loop per known agent. Each successful dial runs a control
//! session that re-issues START for the agent's active uplinks, relays
//! commands, and folds REGISTER / STATUS_UPDATE / LOG events into live state
//! published on broadcast channels.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use proxyfarm_crypto::{KeySchedule, SharedSecret};
use proxyfarm_proto::{AgentSnapshot, AgentStatus, Command, Event, Operation, Uplink};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::ControlChannel;
use crate::desired::{DesiredStateSource, KnownAgent};
use crate::error::{ControlError, SessionError};
use crate::reconnect::{ReconnectManager, DEFAULT_RECONNECT_INTERVAL};
use crate::session::{
    ControlSession, SessionConfig, SessionOutput, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_DECRYPT_FAILURES,
};
use crate::task_tracker::TaskTracker;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub key_schedule: KeySchedule,
    pub max_consecutive_decrypt_failures: Option<u32>,
    /// How often desired state is re-read
    pub refresh_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            key_schedule: KeySchedule::default(),
            max_consecutive_decrypt_failures: Some(DEFAULT_MAX_DECRYPT_FAILURES),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            key_schedule: self.key_schedule,
            handshake_timeout: self.handshake_timeout,
            max_consecutive_decrypt_failures: self.max_consecutive_decrypt_failures,
        }
    }
}

/// Published on connect, disconnect, REGISTER and STATUS_UPDATE
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub agent_id: String,
    pub status: AgentStatus,
    pub uplinks: Vec<Uplink>,
}

/// Log line forwarded by an agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentLogEntry {
    pub agent_id: String,
    pub level: String,
    pub msg: String,
    pub timestamp: DateTime<Utc>,
}

/// Live view of one agent
#[derive(Debug, Clone)]
pub struct AgentState {
    pub agent_id: String,
    pub status: AgentStatus,
    pub snapshot: Option<AgentSnapshot>,
    pub uplinks: Vec<Uplink>,
    pub last_seen: Option<DateTime<Utc>>,
    pub session_id: Option<Uuid>,
}

impl AgentState {
    fn offline(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Offline,
            snapshot: None,
            uplinks: Vec::new(),
            last_seen: None,
            session_id: None,
        }
    }
}

struct LiveSession {
    session_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
}

pub struct Controller {
    config: ControllerConfig,
    source: Arc<dyn DesiredStateSource>,
    /// agent_id -> live session
    sessions: DashMap<String, LiveSession>,
    /// agent_id -> last known state
    agents: DashMap<String, AgentState>,
    /// agent_id -> definition the dial loop was started with
    known: DashMap<String, KnownAgent>,
    dialers: TaskTracker,
    state_tx: broadcast::Sender<StateChange>,
    log_tx: broadcast::Sender<AgentLogEntry>,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(config: ControllerConfig, source: Arc<dyn DesiredStateSource>) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (log_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            source,
            sessions: DashMap::new(),
            agents: DashMap::new(),
            known: DashMap::new(),
            dialers: TaskTracker::new(),
            state_tx,
            log_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<AgentLogEntry> {
        self.log_tx.subscribe()
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentState> {
        self.agents.get(agent_id).map(|a| a.value().clone())
    }

    pub fn agents(&self) -> Vec<AgentState> {
        self.agents.iter().map(|a| a.value().clone()).collect()
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.sessions.contains_key(agent_id)
    }

    /// Queue a command for the agent's live session (fire-and-forget)
    pub fn send_command(&self, agent_id: &str, command: Command) -> Result<(), ControlError> {
        let session = self
            .sessions
            .get(agent_id)
            .ok_or_else(|| ControlError::NotConnected(agent_id.to_string()))?;

        debug!(
            agent_id = %agent_id,
            operation = %command.operation,
            uplink_id = %command.target_uplink_id,
            "Queueing command"
        );
        session
            .commands
            .send(command)
            .map_err(|_| ControlError::NotConnected(agent_id.to_string()))
    }

    /// Drop the agent's live session. Its dial loop reconnects after the
    /// usual interval.
    pub fn disconnect(&self, agent_id: &str) -> bool {
        // Dropping the command sender ends the session loop
        match self.sessions.remove(agent_id) {
            Some((_, live)) => {
                self.mark_offline(agent_id, live.session_id);
                true
            }
            None => false,
        }
    }

    /// Reconcile dial loops against the desired agent list. Returns the
    /// number of known agents.
    pub async fn refresh(self: &Arc<Self>) -> Result<usize, ControlError> {
        let desired = self.source.list_known_agents().await?;

        for agent in &desired {
            let unchanged = self
                .known
                .get(&agent.agent_id)
                .map(|k| *k == *agent)
                .unwrap_or(false);
            if unchanged && self.dialers.contains(&agent.agent_id) {
                continue;
            }

            info!(agent_id = %agent.agent_id, addr = %agent.addr(), "Starting dial loop");
            if self.known.insert(agent.agent_id.clone(), agent.clone()).is_some() {
                // Definition changed: the running session used the old one
                if let Some((_, live)) = self.sessions.remove(&agent.agent_id) {
                    self.mark_offline(&agent.agent_id, live.session_id);
                }
            }
            self.agents
                .entry(agent.agent_id.clone())
                .or_insert_with(|| AgentState::offline(&agent.agent_id));

            let handle = tokio::spawn(Arc::clone(self).dial_loop(agent.clone()));
            self.dialers.register(agent.agent_id.clone(), handle);
        }

        for agent_id in self.dialers.ids() {
            if desired.iter().any(|a| a.agent_id == agent_id) {
                continue;
            }
            info!(agent_id = %agent_id, "Agent removed from desired state");
            self.dialers.unregister(&agent_id);
            self.known.remove(&agent_id);
            self.sessions.remove(&agent_id);
            if let Some((_, state)) = self.agents.remove(&agent_id) {
                if state.status == AgentStatus::Online {
                    self.publish_state(&agent_id, AgentStatus::Offline, Vec::new());
                }
            }
        }

        Ok(desired.len())
    }

    /// Refresh periodically until [`shutdown`](Self::shutdown)
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.refresh().await {
                error!("Failed to refresh desired state: {}", e);
            }
        }

        self.dialers.abort_all();
        self.sessions.clear();
        info!("Controller stopped");
    }

    /// Stop refreshing and abort every dial loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.dialers.abort_all();
    }

    async fn dial_loop(self: Arc<Self>, agent: KnownAgent) {
        let mut reconnect = ReconnectManager::new(self.config.reconnect_interval);

        loop {
            let mut established = false;
            let connect =
                tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(agent.addr()));

            match connect.await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(agent_id = %agent.agent_id, "Connected to {}", agent.addr());
                    match self.serve_connection(&agent, stream).await {
                        Ok(()) => established = true,
                        Err(e) => warn!(
                            agent_id = %agent.agent_id,
                            failures = reconnect.failures() + 1,
                            "Control session failed: {}",
                            e
                        ),
                    }
                }
                Ok(Err(e)) => {
                    debug!(agent_id = %agent.agent_id, "Connect to {} failed: {}", agent.addr(), e)
                }
                Err(_) => {
                    debug!(agent_id = %agent.agent_id, "Connect to {} timed out", agent.addr())
                }
            }

            if self.shutdown.is_cancelled() {
                return;
            }
            reconnect.wait(established).await;
        }
    }

    /// Run one control session with `agent` over an established stream.
    ///
    /// Returns once the session ends. `Ok` means the agent confirmed the
    /// session key; a close before that is reported as
    /// [`ControlError::HandshakeRejected`].
    pub async fn serve_connection<T>(&self, agent: &KnownAgent, io: T) -> Result<(), ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = ControlSession::controller(
            &agent.agent_id,
            SharedSecret::new(agent.shared_key.clone()),
            self.config.session_config(),
        );
        let mut channel = ControlChannel::new(io);

        if let Err(e) = channel.handshake(&mut session).await {
            warn!(agent_id = %agent.agent_id, "Handshake failed: {}", e);
            return Err(e);
        }

        let first = match self.await_confirmation(&mut channel, &mut session).await {
            Ok(event) => event,
            Err(e) => {
                session.disconnect();
                warn!(agent_id = %agent.agent_id, "Session not confirmed by agent: {}", e);
                return Err(e);
            }
        };

        let session_id = session.id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(old) = self.sessions.insert(
            agent.agent_id.clone(),
            LiveSession {
                session_id,
                commands: tx,
            },
        ) {
            info!(
                agent_id = %agent.agent_id,
                old_session = %old.session_id,
                new_session = %session_id,
                "Replaced stale session"
            );
        }
        info!(agent_id = %agent.agent_id, session_id = %session_id, "Agent session active");
        self.mark_online(&agent.agent_id, session_id);
        self.on_event(&agent.agent_id, session_id, first);

        let result = self
            .run_session(agent, &mut channel, &mut session, &mut rx)
            .await;

        session.disconnect();
        let removed = self
            .sessions
            .remove_if(&agent.agent_id, |_, live| live.session_id == session_id)
            .is_some();
        if removed {
            self.mark_offline(&agent.agent_id, session_id);
        } else {
            debug!(agent_id = %agent.agent_id, session_id = %session_id, "Stale session ended");
        }

        match result {
            Err(ControlError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    /// Our half of the handshake ends with the ACK, before the agent has
    /// checked the MAC. Nothing is sealed until an envelope from the agent
    /// opens under the derived key.
    async fn await_confirmation<T>(
        &self,
        channel: &mut ControlChannel<T>,
        session: &mut ControlSession,
    ) -> Result<Event, ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let limit = session.config().handshake_timeout;
        match tokio::time::timeout(limit, Self::first_event(channel, session)).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::HandshakeTimeout),
        }
    }

    async fn first_event<T>(
        channel: &mut ControlChannel<T>,
        session: &mut ControlSession,
    ) -> Result<Event, ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let msg = channel
                .recv()
                .await?
                .ok_or(ControlError::HandshakeRejected)?;
            if let SessionOutput::Event(event) = session.handle(msg)? {
                return Ok(event);
            }
        }
    }

    async fn run_session<T>(
        &self,
        agent: &KnownAgent,
        channel: &mut ControlChannel<T>,
        session: &mut ControlSession,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let session_id = session.id();
        self.resync(agent, channel, session).await?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                inbound = channel.recv() => {
                    let msg = inbound?.ok_or(ControlError::ConnectionClosed)?;
                    match session.handle(msg) {
                        Ok(SessionOutput::Event(event)) => {
                            self.on_event(&agent.agent_id, session_id, event);
                        }
                        Ok(_) => {}
                        Err(SessionError::KeyDesync(failures)) => {
                            warn!(
                                agent_id = %agent.agent_id,
                                failures,
                                "Session key desynchronized, dropping connection"
                            );
                            return Err(SessionError::KeyDesync(failures).into());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => {
                        channel.send(session.seal(&Event::Command(command))?).await?;
                    }
                    None => {
                        info!(agent_id = %agent.agent_id, session_id = %session_id, "Session closed locally");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// START every uplink the desired state marks active, once per activation
    async fn resync<T>(
        &self,
        agent: &KnownAgent,
        channel: &mut ControlChannel<T>,
        session: &mut ControlSession,
    ) -> Result<(), ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let uplinks = match self.source.list_active_uplinks(&agent.agent_id).await {
            Ok(uplinks) => uplinks,
            Err(e) => {
                warn!(agent_id = %agent.agent_id, "Skipping re-sync: {}", e);
                return Ok(());
            }
        };

        for uplink in &uplinks {
            let mut command = Command::new(Operation::Start, uplink.uplink_id.clone());
            command.parameters = uplink.parameters.clone();
            channel.send(session.seal(&Event::Command(command))?).await?;
        }
        if !uplinks.is_empty() {
            info!(agent_id = %agent.agent_id, count = uplinks.len(), "Re-synced active uplinks");
        }
        Ok(())
    }

    fn on_event(&self, agent_id: &str, session_id: Uuid, event: Event) {
        if !self.is_current(agent_id, session_id) {
            debug!(agent_id = %agent_id, "Dropping {} from stale session", event.event_type());
            return;
        }

        match event {
            Event::Register(snapshot) => {
                if snapshot.id != agent_id {
                    warn!(agent_id = %agent_id, reported = %snapshot.id, "Agent registered under a different id");
                }
                info!(agent_id = %agent_id, uplinks = snapshot.uplinks.len(), "Agent registered");
                let uplinks = snapshot.uplinks.clone();
                self.update_state(agent_id, |state| {
                    state.uplinks = uplinks.clone();
                    state.snapshot = Some(snapshot);
                });
                self.publish_state(agent_id, AgentStatus::Online, uplinks);
            }
            Event::StatusUpdate(update) => {
                let uplinks = update.uplinks;
                self.update_state(agent_id, |state| {
                    state.uplinks = uplinks.clone();
                    if let Some(snapshot) = state.snapshot.as_mut() {
                        snapshot.uplinks = uplinks.clone();
                    }
                });
                self.publish_state(agent_id, AgentStatus::Online, uplinks);
            }
            Event::Log(log) => {
                let timestamp = log
                    .timestamp
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or_else(Utc::now);
                let _ = self.log_tx.send(AgentLogEntry {
                    agent_id: agent_id.to_string(),
                    level: log.level,
                    msg: log.msg,
                    timestamp,
                });
            }
            Event::Command(_) | Event::Unknown { .. } => {
                warn!(agent_id = %agent_id, "Ignoring {} from agent", event.event_type());
            }
        }
    }

    fn is_current(&self, agent_id: &str, session_id: Uuid) -> bool {
        self.sessions
            .get(agent_id)
            .map(|live| live.session_id == session_id)
            .unwrap_or(false)
    }

    fn update_state(&self, agent_id: &str, f: impl FnOnce(&mut AgentState)) {
        let mut state = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentState::offline(agent_id));
        state.last_seen = Some(Utc::now());
        f(&mut state);
    }

    fn mark_online(&self, agent_id: &str, session_id: Uuid) {
        let mut uplinks = Vec::new();
        self.update_state(agent_id, |state| {
            state.status = AgentStatus::Online;
            state.session_id = Some(session_id);
            uplinks = state.uplinks.clone();
        });
        self.publish_state(agent_id, AgentStatus::Online, uplinks);
    }

    fn mark_offline(&self, agent_id: &str, session_id: Uuid) {
        let uplinks = match self.agents.get_mut(agent_id) {
            Some(mut state) if state.session_id == Some(session_id) => {
                state.status = AgentStatus::Offline;
                state.session_id = None;
                state.uplinks.clone()
            }
            _ => return,
        };
        info!(agent_id = %agent_id, "Agent offline");
        self.publish_state(agent_id, AgentStatus::Offline, uplinks);
    }

    fn publish_state(&self, agent_id: &str, status: AgentStatus, uplinks: Vec<Uplink>) {
        // No subscribers is fine
        let _ = self.state_tx.send(StateChange {
            agent_id: agent_id.to_string(),
            status,
            uplinks,
        });
    }
}
