//! Proxy farm protocol definitions
//!
//! This crate defines the control-plane wire messages exchanged between the
//! Controller and its Agents, the typed events carried inside encrypted
//! envelopes, the uplink/agent data model, and the frame codec.

pub mod codec;
pub mod messages;
pub mod model;

pub use codec::{CodecError, ControlCodec};
pub use messages::*;
pub use model::*;

/// Maximum control frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Handshake nonce length in bytes (hex-encoded on the wire)
pub const NONCE_LEN: usize = 16;
