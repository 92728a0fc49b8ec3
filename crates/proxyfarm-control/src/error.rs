//! Control-plane errors

use proxyfarm_crypto::{ChannelError, HandshakeError};
use proxyfarm_proto::CodecError;
use thiserror::Error;

use crate::desired::DesiredStateError;
use crate::driver::DriverError;

/// Errors raised by a single [`ControlSession`](crate::session::ControlSession)
#[derive(Debug, Error)]
pub enum SessionError {
    /// Envelopes may only be sealed or opened once the handshake completed
    #[error("Session is not active")]
    NotActive,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Unexpected {0} message in current state")]
    UnexpectedMessage(&'static str),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Event encoding error: {0}")]
    Event(#[from] serde_json::Error),

    /// Too many consecutive envelopes failed to decrypt; the peers no longer
    /// share a key and must handshake again
    #[error("Key desynchronized after {0} consecutive decryption failures")]
    KeyDesync(u32),
}

/// Errors raised by the controller and agent runtimes
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The agent hung up after our ACK without sending a valid envelope,
    /// which is how it rejects our MAC
    #[error("Agent closed the connection before confirming the session key")]
    HandshakeRejected,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Agent not connected: {0}")]
    NotConnected(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Desired state unavailable: {0}")]
    DesiredState(#[from] DesiredStateError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}
