//! Nonce exchange proving knowledge of the shared secret
//!
//! ```text
//! Agent (Initiator)                       Controller (Responder)
//!   INIT { nonceAgent }          ─────▶
//!                                ◀─────   ACK { nonceController, mac, agentId }
//!   verify mac + agentId
//!   derive session key                    derive session key
//! ```
//!
//! Only the controller proves itself; a controller holding the wrong secret is
//! rejected by the agent. An agent holding the wrong secret derives a different
//! session key and none of its envelopes will open.

use proxyfarm_proto::{ControlMessage, NONCE_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

use crate::keys::{KeySchedule, SessionKey, SharedSecret};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Unexpected message during handshake: {0}")]
    UnexpectedMessage(&'static str),

    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("Malformed MAC")]
    MalformedMac,

    #[error("MAC verification failed")]
    MacMismatch,

    #[error("Controller addressed agent {got}, expected {expected}")]
    AgentIdMismatch { expected: String, got: String },

    #[error("No shared key configured (awaiting pairing)")]
    EmptySecret,

    #[error("Key derivation failed")]
    KeyDerivation,
}

/// Fresh random handshake nonce, wiped on drop
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, HandshakeError> {
        let mut bytes = [0u8; NONCE_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| HandshakeError::InvalidNonce(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Drop for Nonce {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", self.to_hex())
    }
}

/// Agent side of the handshake
#[derive(Debug)]
pub struct Initiator {
    agent_id: String,
    secret: SharedSecret,
    schedule: KeySchedule,
    nonce_agent: Nonce,
}

impl Initiator {
    pub fn new(
        agent_id: impl Into<String>,
        secret: SharedSecret,
        schedule: KeySchedule,
    ) -> Result<Self, HandshakeError> {
        if secret.is_empty() {
            return Err(HandshakeError::EmptySecret);
        }
        Ok(Self {
            agent_id: agent_id.into(),
            secret,
            schedule,
            nonce_agent: Nonce::generate(),
        })
    }

    /// The INIT message opening this attempt
    pub fn init_message(&self) -> ControlMessage {
        ControlMessage::Init {
            nonce_agent: self.nonce_agent.to_hex(),
        }
    }

    /// Verify the controller's ACK and derive the session key.
    ///
    /// Consumes the initiator: a failed attempt cannot be retried with the
    /// same nonce.
    pub fn finish(self, msg: &ControlMessage) -> Result<SessionKey, HandshakeError> {
        let (nonce_controller, mac, agent_id) = match msg {
            ControlMessage::Ack {
                nonce_controller,
                mac,
                agent_id,
            } => (nonce_controller, mac, agent_id),
            other => return Err(HandshakeError::UnexpectedMessage(other.kind())),
        };

        if *agent_id != self.agent_id {
            return Err(HandshakeError::AgentIdMismatch {
                expected: self.agent_id.clone(),
                got: agent_id.clone(),
            });
        }

        let nonce_controller = Nonce::from_hex(nonce_controller)?;

        let mut received = [0u8; 32];
        hex::decode_to_slice(mac, &mut received).map_err(|_| HandshakeError::MalformedMac)?;

        let mut expected = self
            .schedule
            .mac(&self.secret, &self.nonce_agent, &nonce_controller)?;
        let valid: bool = expected.ct_eq(&received).into();
        expected.zeroize();

        if !valid {
            return Err(HandshakeError::MacMismatch);
        }

        debug!(agent_id = %self.agent_id, schedule = %self.schedule, "Controller MAC verified");
        self.schedule
            .session_key(&self.secret, &self.nonce_agent, &nonce_controller)
    }
}

/// Controller side of the handshake
#[derive(Debug)]
pub struct Responder {
    agent_id: String,
    secret: SharedSecret,
    schedule: KeySchedule,
}

impl Responder {
    /// `agent_id` is the identity the controller believes it is talking to
    pub fn new(
        agent_id: impl Into<String>,
        secret: SharedSecret,
        schedule: KeySchedule,
    ) -> Result<Self, HandshakeError> {
        if secret.is_empty() {
            return Err(HandshakeError::EmptySecret);
        }
        Ok(Self {
            agent_id: agent_id.into(),
            secret,
            schedule,
        })
    }

    /// Answer an INIT: returns the ACK to send and the derived session key
    pub fn respond(
        self,
        msg: &ControlMessage,
    ) -> Result<(ControlMessage, SessionKey), HandshakeError> {
        let nonce_agent = match msg {
            ControlMessage::Init { nonce_agent } => Nonce::from_hex(nonce_agent)?,
            other => return Err(HandshakeError::UnexpectedMessage(other.kind())),
        };

        let nonce_controller = Nonce::generate();
        let mut mac = self
            .schedule
            .mac(&self.secret, &nonce_agent, &nonce_controller)?;
        let key = self
            .schedule
            .session_key(&self.secret, &nonce_agent, &nonce_controller)?;

        let ack = ControlMessage::Ack {
            nonce_controller: nonce_controller.to_hex(),
            mac: hex::encode(mac),
            agent_id: self.agent_id.clone(),
        };
        mac.zeroize();

        Ok((ack, key))
    }
}
