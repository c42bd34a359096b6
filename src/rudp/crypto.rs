//! Per-segment authenticated encryption, applied strictly to the payload.
//!
//! The handshake trusts the first datagram: the client generates a fresh
//! session key and ships it in cleartext inside the SYN payload. This is
//! not resistant to an active man-in-the-middle and is documented as such
//! rather than fixed — see `SPEC_FULL.md` §9. Every segment after the
//! handshake is sealed with AES-256-GCM under that key, with a fresh
//! random nonce embedded ahead of the ciphertext in the envelope.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext shorter than the nonce it should carry")]
    Truncated,
    #[error("authentication tag mismatch")]
    TagMismatch,
}

/// A freshly generated session key, carried in the clear inside the SYN.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Seals and opens segment payloads for one connection. `None` means the
/// connection was opened with encryption disabled: the envelope format on
/// the wire is unchanged, but `seal`/`open` become the identity function.
/// This toggle is a local testing convenience, never negotiated with the
/// peer.
pub enum CryptoEnvelope {
    Enabled(Aes256Gcm),
    Disabled,
}

impl CryptoEnvelope {
    pub fn new(key: &[u8], enabled: bool) -> CryptoEnvelope {
        if !enabled {
            return CryptoEnvelope::Disabled;
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        CryptoEnvelope::Enabled(Aes256Gcm::new(key))
    }

    /// Encrypts `plaintext` into a self-contained envelope: `nonce ||
    /// ciphertext || tag`. The wire payload length grows by
    /// `NONCE_LEN + 16` bytes relative to the plaintext.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        match self {
            CryptoEnvelope::Disabled => plaintext.to_vec(),
            CryptoEnvelope::Enabled(cipher) => {
                let mut nonce_bytes = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);

                // Only MAX_RETRIES retransmissions of a 1024-byte payload
                // are ever in flight for one segment, so an encryption
                // failure here can only mean a misconfigured cipher.
                let ciphertext = cipher
                    .encrypt(nonce, plaintext)
                    .expect("AES-256-GCM encryption of a bounded payload cannot fail");

                let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                envelope.extend_from_slice(&nonce_bytes);
                envelope.extend_from_slice(&ciphertext);
                envelope
            }
        }
    }

    /// Opens an envelope produced by `seal`. Any failure — truncation or a
    /// bad authentication tag — is reported as `CryptoError`; callers
    /// treat both identically to a checksum failure: drop the segment,
    /// change no state.
    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            CryptoEnvelope::Disabled => Ok(envelope.to_vec()),
            CryptoEnvelope::Enabled(cipher) => {
                if envelope.len() < NONCE_LEN {
                    return Err(CryptoError::Truncated);
                }
                let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
                let nonce = Nonce::from_slice(nonce_bytes);

                cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| CryptoError::TagMismatch)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trips() {
        let key = generate_key();
        let envelope = CryptoEnvelope::new(&key, true);
        let plaintext = b"the quick brown fox";

        let sealed = envelope.seal(plaintext);
        assert_ne!(sealed, plaintext);

        let opened = envelope.open(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn disabled_envelope_is_identity() {
        let envelope = CryptoEnvelope::new(&[0u8; KEY_LEN], false);
        let plaintext = b"plaintext on the wire";
        let sealed = envelope.seal(plaintext);
        assert_eq!(sealed, plaintext);
        assert_eq!(envelope.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let key = generate_key();
        let envelope = CryptoEnvelope::new(&key, true);
        let mut sealed = envelope.seal(b"authenticated payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert_eq!(envelope.open(&sealed), Err(CryptoError::TagMismatch));
    }

    #[test]
    fn different_keys_cannot_open_each_others_segments() {
        let a = CryptoEnvelope::new(&generate_key(), true);
        let b = CryptoEnvelope::new(&generate_key(), true);

        let sealed = a.seal(b"secret");
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn generated_keys_are_not_trivially_repeated() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
    }
}
