//! Per-connection control session state machine
//!
//! A `ControlSession` owns one handshake and, once it completes, the session
//! key for that connection. It does no I/O: the runtime feeds it inbound
//! messages with [`ControlSession::handle`] and sends whatever it returns.
//!
//! ```text
//! Disconnected ──start()──▶ Handshaking ──INIT/ACK ok──▶ Active
//!      ▲                         │                          │
//!      └──── handshake error ────┘                          │
//!      └────────────────────── disconnect() ────────────────┘
//! ```

use proxyfarm_crypto::{
    self as crypto, HandshakeError, Initiator, KeySchedule, Responder, SessionKey, SharedSecret,
};
use proxyfarm_proto::{ControlMessage, Event};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SessionError;

/// Default time allowed for the peer's handshake message
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of consecutive undecryptable envelopes tolerated
pub const DEFAULT_MAX_DECRYPT_FAILURES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Controller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Active,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Handshaking => write!(f, "HANDSHAKING"),
            SessionState::Active => write!(f, "ACTIVE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub key_schedule: KeySchedule,
    pub handshake_timeout: Duration,
    /// `None` keeps the session alive regardless of decryption failures
    pub max_consecutive_decrypt_failures: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            key_schedule: KeySchedule::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_consecutive_decrypt_failures: Some(DEFAULT_MAX_DECRYPT_FAILURES),
        }
    }
}

/// Result of feeding one inbound message to the session
#[derive(Debug)]
pub enum SessionOutput {
    /// Handshake completed; send `reply` if present
    Activated { reply: Option<ControlMessage> },
    /// A decrypted event
    Event(Event),
    /// Nothing to do (dropped envelope, unknown event, duplicate handshake message)
    Ignored,
}

enum Pending {
    None,
    Initiator(Initiator),
    Responder(Responder),
}

pub struct ControlSession {
    id: Uuid,
    role: Role,
    agent_id: String,
    secret: SharedSecret,
    config: SessionConfig,
    state: SessionState,
    pending: Pending,
    key: Option<SessionKey>,
    decrypt_failures: u32,
}

impl ControlSession {
    /// Agent side: opens the handshake
    pub fn agent(agent_id: impl Into<String>, secret: SharedSecret, config: SessionConfig) -> Self {
        Self::new(Role::Agent, agent_id.into(), secret, config)
    }

    /// Controller side: answers the agent's INIT
    pub fn controller(
        agent_id: impl Into<String>,
        secret: SharedSecret,
        config: SessionConfig,
    ) -> Self {
        Self::new(Role::Controller, agent_id.into(), secret, config)
    }

    fn new(role: Role, agent_id: String, secret: SharedSecret, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            agent_id,
            secret,
            config,
            state: SessionState::Disconnected,
            pending: Pending::None,
            key: None,
            decrypt_failures: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Begin the handshake. The agent gets back the INIT to send; the
    /// controller gets `None` and waits for one.
    pub fn start(&mut self) -> Result<Option<ControlMessage>, SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::AlreadyStarted);
        }

        let schedule = self.config.key_schedule;
        let init = match self.role {
            Role::Agent => {
                let initiator = Initiator::new(&self.agent_id, self.secret.clone(), schedule)?;
                let init = initiator.init_message();
                self.pending = Pending::Initiator(initiator);
                Some(init)
            }
            Role::Controller => {
                let responder = Responder::new(&self.agent_id, self.secret.clone(), schedule)?;
                self.pending = Pending::Responder(responder);
                None
            }
        };

        self.state = SessionState::Handshaking;
        debug!(agent_id = %self.agent_id, session_id = %self.id, role = ?self.role, "Handshake started");
        Ok(init)
    }

    /// Process one inbound message
    pub fn handle(&mut self, msg: ControlMessage) -> Result<SessionOutput, SessionError> {
        match (self.state, msg) {
            (SessionState::Active, ControlMessage::Encrypted(envelope)) => self.open(&envelope),
            (SessionState::Active, other) => {
                warn!(
                    agent_id = %self.agent_id,
                    session_id = %self.id,
                    "Ignoring {} on active session",
                    other.kind()
                );
                Ok(SessionOutput::Ignored)
            }
            (_, ControlMessage::Encrypted(_)) => {
                warn!(
                    agent_id = %self.agent_id,
                    session_id = %self.id,
                    state = %self.state,
                    "Rejecting encrypted envelope before handshake completion"
                );
                Err(SessionError::NotActive)
            }
            (SessionState::Handshaking, msg) => self.complete_handshake(&msg),
            (SessionState::Disconnected, other) => Err(SessionError::UnexpectedMessage(other.kind())),
        }
    }

    fn complete_handshake(&mut self, msg: &ControlMessage) -> Result<SessionOutput, SessionError> {
        let result: Result<(Option<ControlMessage>, SessionKey), HandshakeError> =
            match std::mem::replace(&mut self.pending, Pending::None) {
                Pending::Initiator(initiator) => initiator.finish(msg).map(|key| (None, key)),
                Pending::Responder(responder) => {
                    responder.respond(msg).map(|(ack, key)| (Some(ack), key))
                }
                Pending::None => return Err(SessionError::UnexpectedMessage(msg.kind())),
            };

        match result {
            Ok((reply, key)) => {
                self.key = Some(key);
                self.decrypt_failures = 0;
                self.state = SessionState::Active;
                debug!(agent_id = %self.agent_id, session_id = %self.id, "Session active");
                Ok(SessionOutput::Activated { reply })
            }
            Err(e) => {
                self.disconnect();
                Err(e.into())
            }
        }
    }

    fn open(&mut self, envelope: &proxyfarm_proto::Envelope) -> Result<SessionOutput, SessionError> {
        let key = self.key.as_ref().ok_or(SessionError::NotActive)?;

        let body = match crypto::open(key, envelope) {
            Ok(body) => {
                self.decrypt_failures = 0;
                body
            }
            Err(e) => {
                self.decrypt_failures += 1;
                warn!(
                    agent_id = %self.agent_id,
                    session_id = %self.id,
                    failures = self.decrypt_failures,
                    "Dropping envelope: {}",
                    e
                );
                if let Some(max) = self.config.max_consecutive_decrypt_failures {
                    if self.decrypt_failures >= max {
                        return Err(SessionError::KeyDesync(self.decrypt_failures));
                    }
                }
                return Ok(SessionOutput::Ignored);
            }
        };

        match Event::from_envelope(body) {
            Ok(Event::Unknown { event }) => {
                warn!(agent_id = %self.agent_id, "Dropping unknown event type {}", event);
                Ok(SessionOutput::Ignored)
            }
            Ok(event) => Ok(SessionOutput::Event(event)),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "Dropping malformed event payload: {}", e);
                Ok(SessionOutput::Ignored)
            }
        }
    }

    /// Encrypt an outbound event
    pub fn seal(&self, event: &Event) -> Result<ControlMessage, SessionError> {
        let key = match (self.state, &self.key) {
            (SessionState::Active, Some(key)) => key,
            _ => return Err(SessionError::NotActive),
        };
        let envelope = crypto::seal(key, &event.to_envelope()?)?;
        Ok(ControlMessage::Encrypted(envelope))
    }

    /// Drop the session key and any pending handshake
    pub fn disconnect(&mut self) {
        if self.state != SessionState::Disconnected {
            debug!(agent_id = %self.agent_id, session_id = %self.id, "Session disconnected");
        }
        self.key = None;
        self.pending = Pending::None;
        self.decrypt_failures = 0;
        self.state = SessionState::Disconnected;
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("agent_id", &self.agent_id)
            .field("state", &self.state)
            .finish()
    }
}
