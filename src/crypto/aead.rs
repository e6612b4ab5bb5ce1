//! AEAD operations
//!
//! ChaCha20-Poly1305 for handshake fields and transport payloads, and
//! XChaCha20-Poly1305 for cookie replies. Transport nonces are the 64-bit
//! send counter zero-padded to 96 bits, little-endian in the last 8 bytes.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// AEAD key length.
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length.
pub const XNONCE_LEN: usize = 24;

fn counter_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    bytes.into()
}

/// Encrypt with ChaCha20-Poly1305 under a counter nonce.
pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(
            &counter_nonce(counter),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt with ChaCha20-Poly1305 under a counter nonce.
pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(
            &counter_nonce(counter),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt with XChaCha20-Poly1305 (cookie replies).
pub fn xseal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    XChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt with XChaCha20-Poly1305 (cookie replies).
pub fn xopen(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    XChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [9u8; 32];
        let ct = seal(&key, 5, b"inner ip frame", b"ad").unwrap();
        assert_eq!(ct.len(), 14 + TAG_LEN);
        assert_eq!(open(&key, 5, &ct, b"ad").unwrap(), b"inner ip frame");
    }

    #[test]
    fn wrong_counter_fails() {
        let key = [9u8; 32];
        let ct = seal(&key, 5, b"data", b"").unwrap();
        assert!(open(&key, 6, &ct, b"").is_err());
    }

    #[test]
    fn wrong_ad_fails() {
        let key = [9u8; 32];
        let ct = seal(&key, 0, b"data", b"right").unwrap();
        assert!(open(&key, 0, &ct, b"wrong").is_err());
    }

    #[test]
    fn empty_plaintext_is_just_a_tag() {
        let key = [0u8; 32];
        let ct = seal(&key, 0, &[], b"h").unwrap();
        assert_eq!(ct.len(), TAG_LEN);
        assert!(open(&key, 0, &ct, b"h").unwrap().is_empty());
    }

    #[test]
    fn xchacha_roundtrip() {
        let key = [3u8; 32];
        let nonce = [5u8; 24];
        let ct = xseal(&key, &nonce, &[0xAA; 16], b"mac1").unwrap();
        assert_eq!(xopen(&key, &nonce, &ct, b"mac1").unwrap(), vec![0xAA; 16]);
        assert!(xopen(&key, &nonce, &ct, b"mac2").is_err());
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        let key = [0u8; 32];
        assert!(open(&key, 0, &[1, 2, 3], b"").is_err());
        assert!(xopen(&key, &[0u8; 24], &[1, 2, 3], b"").is_err());
    }
}
