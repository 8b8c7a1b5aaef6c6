//! Replication-payload encryption using AES-256-GCM.
//!
//! Envelope payloads between peer nodes are sealed independently with a
//! random 12-byte nonce prepended to the ciphertext. AES-GCM authenticates
//! each chunk, so a tampered payload is rejected rather than parsed as
//! garbage. The per-segment *extra* region exists to absorb [`OVERHEAD`]
//! so one sealed chunk fits in one segment.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};

use crate::error::Error;

/// AES-256-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Sealed-chunk overhead: nonce plus tag.
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// A 256-bit key for sealing replication payloads.
///
/// Stored inline. Implements `Clone` but prints redacted so key material
/// never lands in logs.
#[derive(Clone)]
pub struct AesKey {
    bytes: [u8; 32],
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesKey")
            .field("bytes", &"[redacted]")
            .finish()
    }
}

impl AesKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }
}

/// Seal a payload chunk: returns `nonce || ciphertext || tag`.
pub fn seal(plain: &[u8], key: &AesKey) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.bytes));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ct = cipher.encrypt(&nonce, plain).map_err(|_| Error::Crypto)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a sealed chunk produced by [`seal`]. Fails on truncation, tamper,
/// or key mismatch.
pub fn open(sealed: &[u8], key: &AesKey) -> Result<Vec<u8>, Error> {
    if sealed.len() < OVERHEAD {
        return Err(Error::Crypto);
    }
    let (nonce, ct) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.bytes));
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| Error::Crypto)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AesKey {
        AesKey::from_bytes([7u8; 32])
    }

    #[test]
    fn seal_open_round_trip() {
        let sealed = seal(b"replicated frame", &key()).unwrap();
        assert_eq!(sealed.len(), 16 + OVERHEAD);
        let plain = open(&sealed, &key()).unwrap();
        assert_eq!(plain, b"replicated frame");
    }

    #[test]
    fn tamper_is_rejected() {
        let mut sealed = seal(b"payload", &key()).unwrap();
        let n = sealed.len();
        sealed[n - 1] ^= 0x01;
        assert!(open(&sealed, &key()).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = seal(b"payload", &key()).unwrap();
        let other = AesKey::from_bytes([9u8; 32]);
        assert!(open(&sealed, &other).is_err());
    }

    #[test]
    fn truncated_is_rejected() {
        assert!(open(&[0u8; 8], &key()).is_err());
    }

    #[test]
    fn debug_redacts_key_material() {
        let s = format!("{:?}", key());
        assert!(s.contains("redacted"));
        assert!(!s.contains('7'));
    }
}
