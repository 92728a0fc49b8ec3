//! AES-256-GCM envelope sealing
//!
//! Each envelope carries its own random 12-byte IV. The GCM tag is split off
//! the ciphertext and every field is base64 encoded on the wire.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use proxyfarm_proto::{Envelope, EventEnvelope};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::keys::SessionKey;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Envelope body serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid base64 in envelope: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid IV length: {0} bytes")]
    InvalidIvLength(usize),

    #[error("Invalid tag length: {0} bytes")]
    InvalidTagLength(usize),

    #[error("Encryption failed")]
    Encrypt,

    /// Wrong key, or the ciphertext/tag was modified in transit
    #[error("Decryption failed")]
    Decrypt,
}

/// Encrypt an event body under the session key
pub fn seal(key: &SessionKey, body: &EventEnvelope) -> Result<Envelope, ChannelError> {
    let plaintext = serde_json::to_vec(body)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_ref())
        .map_err(|_| ChannelError::Encrypt)?;

    // aes-gcm appends the tag to the ciphertext
    let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

    Ok(Envelope {
        iv: STANDARD.encode(iv),
        ciphertext: STANDARD.encode(ciphertext),
        tag: STANDARD.encode(tag),
    })
}

/// Decrypt and parse an envelope. Any authentication failure is an error.
pub fn open(key: &SessionKey, envelope: &Envelope) -> Result<EventEnvelope, ChannelError> {
    let iv = STANDARD.decode(&envelope.iv)?;
    let mut ciphertext = STANDARD.decode(&envelope.ciphertext)?;
    let tag = STANDARD.decode(&envelope.tag)?;

    if iv.len() != IV_LEN {
        return Err(ChannelError::InvalidIvLength(iv.len()));
    }
    if tag.len() != TAG_LEN {
        return Err(ChannelError::InvalidTagLength(tag.len()));
    }

    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| ChannelError::Decrypt)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> EventEnvelope {
        EventEnvelope {
            event: "LOG".to_string(),
            payload: json!({"level": "INFO", "msg": "modem_1 online"}),
        }
    }

    fn tamper(field: &str) -> String {
        let mut raw = STANDARD.decode(field).unwrap();
        raw[0] ^= 0x01;
        STANDARD.encode(raw)
    }

    #[test]
    fn test_seal_open() {
        let key = SessionKey::from_bytes([7u8; 32]);
        let sealed = seal(&key, &body()).unwrap();

        assert_eq!(STANDARD.decode(&sealed.iv).unwrap().len(), IV_LEN);
        assert_eq!(STANDARD.decode(&sealed.tag).unwrap().len(), TAG_LEN);
        assert_eq!(open(&key, &sealed).unwrap(), body());
    }

    #[test]
    fn test_fresh_iv_per_envelope() {
        let key = SessionKey::from_bytes([7u8; 32]);
        let a = seal(&key, &body()).unwrap();
        let b = seal(&key, &body()).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&SessionKey::from_bytes([7u8; 32]), &body()).unwrap();
        let result = open(&SessionKey::from_bytes([8u8; 32]), &sealed);
        assert!(matches!(result, Err(ChannelError::Decrypt)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SessionKey::from_bytes([7u8; 32]);
        let mut sealed = seal(&key, &body()).unwrap();
        sealed.ciphertext = tamper(&sealed.ciphertext);
        assert!(matches!(open(&key, &sealed), Err(ChannelError::Decrypt)));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = SessionKey::from_bytes([7u8; 32]);
        let mut sealed = seal(&key, &body()).unwrap();
        sealed.tag = tamper(&sealed.tag);
        assert!(matches!(open(&key, &sealed), Err(ChannelError::Decrypt)));
    }

    #[test]
    fn test_short_iv_rejected() {
        let key = SessionKey::from_bytes([7u8; 32]);
        let mut sealed = seal(&key, &body()).unwrap();
        sealed.iv = STANDARD.encode([0u8; 8]);
        assert!(matches!(
            open(&key, &sealed),
            Err(ChannelError::InvalidIvLength(8))
        ));
    }

    #[test]
    fn test_bad_base64_rejected() {
        let key = SessionKey::from_bytes([7u8; 32]);
        let mut sealed = seal(&key, &body()).unwrap();
        sealed.ciphertext = "not base64!".to_string();
        assert!(matches!(open(&key, &sealed), Err(ChannelError::Encoding(_))));
    }
}
