//! Control-plane cryptography
//!
//! - [`handshake`]: nonce exchange and shared-key proof (INIT / ACK)
//! - [`keys`]: shared secret, session key, and the key schedules
//! - [`channel`]: AES-256-GCM envelope sealing for established sessions

pub mod channel;
pub mod handshake;
pub mod keys;

pub use channel::{open, seal, ChannelError};
pub use handshake::{HandshakeError, Initiator, Nonce, Responder};
pub use keys::{KeySchedule, SessionKey, SharedSecret};
