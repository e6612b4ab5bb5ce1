//! Cookie DoS mitigation
//!
//! Handshake messages carry two trailing MACs. mac1 keys off the
//! receiver's static public key and is always required. mac2 keys off a
//! cookie: a MAC the responder computes over the sender's endpoint with a
//! secret it rotates every two minutes. Under load the responder answers
//! un-cookied handshakes with an encrypted cookie reply instead of doing
//! expensive curve operations.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::{aead, blake2s};
use crate::error::{CryptoError, Result};
use crate::protocol::messages::CookieReply;

/// How long a cookie (and the issuing secret) stays valid.
pub const COOKIE_VALIDITY: Duration = Duration::from_secs(120);

/// Cookie and MAC lengths.
pub const COOKIE_LEN: usize = 16;

/// mac1 over a message prefix, addressed by the receiver's mac1 key.
pub fn compute_mac1(mac1_key: &[u8; 32], msg_prefix: &[u8]) -> [u8; 16] {
    blake2s::mac(mac1_key, msg_prefix)
}

/// Verify mac1 on a received handshake message.
///
/// `mac1_offset` is where the mac begins; everything before it is covered.
pub fn verify_mac1(own_mac1_key: &[u8; 32], msg: &[u8], mac1_offset: usize) -> bool {
    if msg.len() < mac1_offset + COOKIE_LEN {
        return false;
    }
    let expected = blake2s::mac(own_mac1_key, &msg[..mac1_offset]);
    constant_time_eq(&expected, &msg[mac1_offset..mac1_offset + COOKIE_LEN])
}

fn constant_time_eq(a: &[u8; 16], b: &[u8]) -> bool {
    debug_assert_eq!(b.len(), 16);
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn endpoint_bytes(addr: &SocketAddr) -> [u8; 18] {
    let mut out = [0u8; 18];
    let ip = match addr.ip() {
        std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        std::net::IpAddr::V6(v6) => v6.octets(),
    };
    out[..16].copy_from_slice(&ip);
    out[16..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

/// Initiator-side cookie cache for one peer.
#[derive(Default)]
pub struct CookieJar {
    cookie: Option<([u8; COOKIE_LEN], Instant)>,
    /// mac1 of the last handshake message we sent; the AD of any cookie
    /// reply that comes back.
    pub last_mac1: Option<[u8; 16]>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_cookie(&self) -> Option<&[u8; COOKIE_LEN]> {
        match &self.cookie {
            Some((cookie, received)) if received.elapsed() < COOKIE_VALIDITY => Some(cookie),
            _ => None,
        }
    }

    /// Sign mac1 and mac2 in place on an outgoing handshake message.
    ///
    /// mac2 is zeroes unless a fresh cookie is cached. Records the mac1
    /// value for matching a later cookie reply.
    pub fn sign_macs(
        &mut self,
        remote_mac1_key: &[u8; 32],
        msg: &mut [u8],
        mac1_offset: usize,
        mac2_offset: usize,
    ) {
        let mac1 = blake2s::mac(remote_mac1_key, &msg[..mac1_offset]);
        msg[mac1_offset..mac1_offset + COOKIE_LEN].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        if let Some(cookie) = self.fresh_cookie() {
            let mac2 = blake2s::mac(cookie, &msg[..mac2_offset]);
            msg[mac2_offset..mac2_offset + COOKIE_LEN].copy_from_slice(&mac2);
        } else {
            msg[mac2_offset..mac2_offset + COOKIE_LEN].fill(0);
        }
    }

    /// Decrypt and cache the cookie from a reply.
    ///
    /// `remote_cookie_key` is HASH("cookie--" ‖ remote static).
    pub fn consume_reply(
        &mut self,
        reply: &CookieReply,
        remote_cookie_key: &[u8; 32],
    ) -> Result<()> {
        let mac1 = self
            .last_mac1
            .ok_or(CryptoError::Decryption)?;
        let plain = aead::xopen(remote_cookie_key, &reply.nonce, &reply.encrypted_cookie, &mac1)?;
        let cookie: [u8; COOKIE_LEN] = plain.try_into().map_err(|_| CryptoError::Decryption)?;
        self.cookie = Some((cookie, Instant::now()));
        Ok(())
    }

    pub fn clear(&mut self) {
        if let Some((mut cookie, _)) = self.cookie.take() {
            cookie.zeroize();
        }
        self.last_mac1 = None;
    }
}

/// Responder-side cookie issuer.
///
/// Holds the rotating secret; stateless with respect to senders, which is
/// the point: the cookie itself carries the binding to the endpoint.
pub struct CookieIssuer {
    secret: [u8; 32],
    refreshed: Instant,
}

impl Drop for CookieIssuer {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl Default for CookieIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieIssuer {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self {
            secret,
            refreshed: Instant::now(),
        }
    }

    fn current_secret(&mut self) -> [u8; 32] {
        if self.refreshed.elapsed() >= COOKIE_VALIDITY {
            rand::rngs::OsRng.fill_bytes(&mut self.secret);
            self.refreshed = Instant::now();
        }
        self.secret
    }

    /// The cookie for a source endpoint under the current secret.
    pub fn make_cookie(&mut self, src: &SocketAddr) -> [u8; COOKIE_LEN] {
        let secret = self.current_secret();
        blake2s::mac(&secret, &endpoint_bytes(src))
    }

    /// Verify mac2 on a received handshake message against the cookie the
    /// sender should currently hold.
    pub fn verify_mac2(&mut self, msg: &[u8], mac2_offset: usize, src: &SocketAddr) -> bool {
        if msg.len() < mac2_offset + COOKIE_LEN {
            return false;
        }
        let cookie = self.make_cookie(src);
        let expected = blake2s::mac(&cookie, &msg[..mac2_offset]);
        constant_time_eq(&expected, &msg[mac2_offset..mac2_offset + COOKIE_LEN])
    }

    /// Build a cookie reply for a sender that failed the mac2 check.
    ///
    /// `own_cookie_key` is HASH("cookie--" ‖ our static); `mac1` is the
    /// mac1 of the message being answered and becomes the AD.
    pub fn build_reply(
        &mut self,
        own_cookie_key: &[u8; 32],
        receiver_index: u32,
        mac1: &[u8; 16],
        src: &SocketAddr,
    ) -> Result<CookieReply> {
        let cookie = self.make_cookie(src);
        let mut nonce = [0u8; aead::XNONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let sealed = aead::xseal(own_cookie_key, &nonce, &cookie, mac1)?;
        let encrypted_cookie: [u8; 32] = sealed.try_into().map_err(|_| CryptoError::Encryption)?;

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}
