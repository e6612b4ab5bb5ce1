//! BLAKE2s primitives
//!
//! Hashing, the 16-byte keyed MAC used for mac1/mac2 and cookies, and the
//! HMAC-based key-derivation chain.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// BLAKE2s-256 output length, also the chaining-key length.
pub const HASH_LEN: usize = 32;

/// Keyed-MAC output length.
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 over the concatenation of the given parts.
pub fn hash(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// BLAKE2s keyed MAC with 16-byte output.
///
/// The key is 32 bytes for mac1 (a derived label key) and 16 bytes for
/// mac2 (the cookie itself); BLAKE2s accepts both lengths directly.
pub fn mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut m = Blake2sMac::<U16>::new_from_slice(key).expect("key fits BLAKE2s");
    MacTrait::update(&mut m, data);
    m.finalize_fixed().into()
}

/// RFC 2104 HMAC over BLAKE2s-256.
///
/// The protocol's KDF is specified in terms of this construction, not the
/// BLAKE2s built-in keying.
pub fn hmac(key: &[u8], data: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut m = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    for part in data {
        Update::update(&mut m, part);
    }
    m.finalize_fixed().into()
}

/// HKDF-style expansion: derive `N` 32-byte outputs from a chaining key
/// and input material, `N` in 1..=3.
///
/// T0 = HMAC(ck, input); T1 = HMAC(T0, 0x1); Tn = HMAC(T0, T(n-1) ‖ n).
pub fn hkdf<const N: usize>(ck: &[u8; HASH_LEN], input: &[u8]) -> [[u8; HASH_LEN]; N] {
    debug_assert!(N >= 1 && N <= 3);
    let prk = hmac(ck, &[input]);

    let mut out = [[0u8; HASH_LEN]; N];
    out[0] = hmac(&prk, &[&[0x01]]);
    for n in 1..N {
        let index = [n as u8 + 1];
        out[n] = hmac(&prk, &[&out[n - 1], &index]);
    }
    out
}
