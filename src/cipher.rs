use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::session::SessionKey;

/// Nonce prefix length on the wire.
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("payload could not be decrypted")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Seals a tunnel payload under a session key. Wire form is
/// `nonce(12) || ciphertext+tag`, with a fresh random nonce per packet.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ciphertext);
    Ok(wire)
}

/// Opens a sealed payload. Failure is a per-packet event: callers drop
/// the datagram and keep the session alive.
pub fn open(key: &SessionKey, wire: &[u8]) -> Result<Vec<u8>, CipherError> {
    if wire.len() < NONCE_LEN {
        return Err(CipherError::DecryptionFailed);
    }

    let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = [7u8; 32];
        let wire = seal(&key, b"payload").unwrap();
        assert_eq!(open(&key, &wire).unwrap(), b"payload");
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = [7u8; 32];
        let first = seal(&key, b"payload").unwrap();
        let second = seal(&key, b"payload").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_open_wrong_key() {
        let wire = seal(&[7u8; 32], b"payload").unwrap();
        assert_eq!(open(&[8u8; 32], &wire), Err(CipherError::DecryptionFailed));
    }

    #[test]
    fn test_open_tampered() {
        let key = [7u8; 32];
        let mut wire = seal(&key, b"payload").unwrap();
        *wire.last_mut().unwrap() ^= 0x01;
        assert_eq!(open(&key, &wire), Err(CipherError::DecryptionFailed));
    }

    #[test]
    fn test_open_truncated() {
        let key = [7u8; 32];
        assert_eq!(open(&key, &[0u8; 5]), Err(CipherError::DecryptionFailed));
    }
}
