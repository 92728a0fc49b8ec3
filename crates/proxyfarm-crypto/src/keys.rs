//! Shared secrets, session keys and key derivation

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::handshake::{HandshakeError, Nonce};

type HmacSha256 = Hmac<Sha256>;

const HARDENED_MAC_INFO: &[u8] = b"proxyfarm/v1/handshake-mac";
const HARDENED_KEY_INFO: &[u8] = b"proxyfarm/v1/session-key";

/// Pre-shared agent secret. Never leaves the process; wiped on drop.
#[derive(Clone)]
pub struct SharedSecret {
    bytes: Vec<u8>,
}

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            bytes: secret.into().into_bytes(),
        }
    }

    /// Generate a fresh random secret (32 bytes, hex encoded)
    pub fn generate() -> String {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let encoded = hex::encode(raw);
        raw.zeroize();
        encoded
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// 256-bit AES-GCM key for one connection
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0.ct_eq(&other.0).into()
    }
}

/// How the handshake MAC and the session key are derived from the shared secret.
///
/// Both peers must agree on the schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySchedule {
    /// MAC and session key are the same HMAC output (wire compatible with
    /// deployed agents)
    #[default]
    Compat,
    /// HKDF-SHA256 with the nonce transcript as salt, separate outputs for
    /// the MAC and the key
    Hardened,
}

impl KeySchedule {
    /// Handshake MAC proving knowledge of the shared secret
    pub fn mac(
        &self,
        secret: &SharedSecret,
        nonce_agent: &Nonce,
        nonce_controller: &Nonce,
    ) -> Result<[u8; 32], HandshakeError> {
        let transcript = transcript(nonce_agent, nonce_controller);
        match self {
            KeySchedule::Compat => hmac_sha256(secret.as_bytes(), transcript.as_bytes()),
            KeySchedule::Hardened => {
                hkdf_expand(secret.as_bytes(), transcript.as_bytes(), HARDENED_MAC_INFO)
            }
        }
    }

    /// Session key for the connection identified by the nonce pair
    pub fn session_key(
        &self,
        secret: &SharedSecret,
        nonce_agent: &Nonce,
        nonce_controller: &Nonce,
    ) -> Result<SessionKey, HandshakeError> {
        let transcript = transcript(nonce_agent, nonce_controller);
        let bytes = match self {
            KeySchedule::Compat => hmac_sha256(secret.as_bytes(), transcript.as_bytes())?,
            KeySchedule::Hardened => {
                hkdf_expand(secret.as_bytes(), transcript.as_bytes(), HARDENED_KEY_INFO)?
            }
        };
        Ok(SessionKey(bytes))
    }
}

impl std::fmt::Display for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySchedule::Compat => write!(f, "compat"),
            KeySchedule::Hardened => write!(f, "hardened"),
        }
    }
}

/// `hex(nonce_agent) ":" hex(nonce_controller)`
fn transcript(nonce_agent: &Nonce, nonce_controller: &Nonce) -> String {
    format!("{}:{}", nonce_agent.to_hex(), nonce_controller.to_hex())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], HandshakeError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| HandshakeError::KeyDerivation)?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn hkdf_expand(secret: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], HandshakeError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out)
        .map_err(|_| HandshakeError::KeyDerivation)?;
    Ok(out)
}
