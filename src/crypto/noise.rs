//! Noise IKpsk2 symmetric state
//!
//! The hash/chaining-key transcript shared by both handshake roles, plus
//! derivation of the transport keys and the mac1/cookie label keys.

use zeroize::Zeroize;

use crate::crypto::{aead, blake2s};
use crate::error::CryptoError;

pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";
pub const LABEL_MAC1: &[u8] = b"mac1----";
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Running hash and chaining key during a handshake.
///
/// Zeroized on drop; a completed handshake moves the chaining key out
/// through [`SymmetricState::split`].
#[derive(Clone)]
pub struct SymmetricState {
    pub chaining_key: [u8; 32],
    pub hash: [u8; 32],
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.chaining_key.zeroize();
        self.hash.zeroize();
    }
}

impl SymmetricState {
    /// Initial transcript for a handshake toward `responder_static`.
    ///
    /// Both roles seed the hash with the *responder's* static key; that is
    /// what lets the initiator bind the handshake to the peer it dialed.
    pub fn new(responder_static: &[u8; 32]) -> Self {
        let chaining_key = blake2s::hash(&[CONSTRUCTION]);
        let hash = blake2s::hash(&[&blake2s::hash(&[&chaining_key, IDENTIFIER]), responder_static]);
        Self { chaining_key, hash }
    }

    /// h = HASH(h ‖ data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash(&[&self.hash, data]);
    }

    /// ck = KDF1(ck, input); used for ephemeral public keys.
    pub fn mix_chain(&mut self, input: &[u8]) {
        let [ck] = blake2s::hkdf::<1>(&self.chaining_key, input);
        self.chaining_key = ck;
    }

    /// (ck, k) = KDF2(ck, input); returns the message key.
    pub fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let [ck, key] = blake2s::hkdf::<2>(&self.chaining_key, input);
        self.chaining_key = ck;
        key
    }

    /// (ck, t, k) = KDF3(ck, psk); mixes t into the hash, returns k.
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let [ck, tau, key] = blake2s::hkdf::<3>(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&tau);
        key
    }

    /// AEAD-seal `plaintext` with the transcript hash as AD, then absorb
    /// the ciphertext.
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::seal(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// Inverse of [`encrypt_and_hash`]; absorbs the ciphertext on success.
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::open(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Final key split: (T1, T2) = KDF2(ck, ε).
    ///
    /// The initiator sends with T1 and receives with T2; the responder the
    /// reverse.
    pub fn split(&self, initiator: bool) -> ([u8; 32], [u8; 32]) {
        let [t1, t2] = blake2s::hkdf::<2>(&self.chaining_key, &[]);
        if initiator {
            (t1, t2)
        } else {
            (t2, t1)
        }
    }
}

/// mac1 key for messages addressed to `public`: HASH("mac1----" ‖ public).
pub fn mac1_key(public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash(&[LABEL_MAC1, public])
}

/// XChaCha key for cookie replies from `public`: HASH("cookie--" ‖ public).
pub fn cookie_key(public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash(&[LABEL_COOKIE, public])
}
