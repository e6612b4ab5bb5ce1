//! Noise IK handshake, both roles
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s. The per-peer state is a
//! tagged variant so every transition is total: a message that does not
//! match the current state is rejected instead of poking at half-valid
//! fields.

use std::time::Instant;

use tai64::Tai64N;
use zeroize::Zeroize;

use crate::crypto::{noise, x25519};
use crate::error::{CryptoError, ProtocolError, Result};
use crate::protocol::messages::{Initiation, Response};

/// The device's long-lived identity plus the keys derived from it.
///
/// Replacing the private key replaces this whole struct, which is what
/// invalidates every in-flight handshake and session.
pub struct StaticIdentity {
    private: [u8; 32],
    pub public: [u8; 32],
    /// Verifies mac1 on messages addressed to us.
    pub mac1_key: [u8; 32],
    /// Seals cookie replies we issue.
    pub cookie_key: [u8; 32],
}

impl Drop for StaticIdentity {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl StaticIdentity {
    pub fn new(private: [u8; 32]) -> Self {
        let public = x25519::public_key(&private);
        Self {
            private,
            public,
            mac1_key: noise::mac1_key(&public),
            cookie_key: noise::cookie_key(&public),
        }
    }

    pub fn dh(&self, public: &[u8; 32]) -> [u8; 32] {
        x25519::dh(&self.private, public)
    }

    pub(crate) fn private_bytes(&self) -> [u8; 32] {
        self.private
    }
}

/// Keys and indices produced by a completed handshake.
pub struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
    pub local_index: u32,
    pub remote_index: u32,
    pub is_initiator: bool,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.send.zeroize();
        self.recv.zeroize();
    }
}

/// Handshake progress for one peer.
enum State {
    Zeroed,
    /// Initiator: sent an initiation, waiting for the response.
    InitiationCreated {
        local_index: u32,
        ephemeral_private: [u8; 32],
        transcript: noise::SymmetricState,
    },
    /// Responder: a response went out; keys are installed but unconfirmed.
    ResponseCreated,
    /// Initiator: response consumed, session installed.
    ResponseConsumed,
}

impl Drop for State {
    fn drop(&mut self) {
        if let State::InitiationCreated {
            ephemeral_private, ..
        } = self
        {
            ephemeral_private.zeroize();
        }
    }
}

/// Per-peer handshake state machine.
pub struct Handshake {
    pub remote_static: [u8; 32],
    /// DH(device static, remote static), computed once at peer add.
    precomputed_ss: [u8; 32],
    psk: [u8; 32],
    state: State,
    /// Greatest TAI64N accepted from this peer (initiation replay defense).
    last_seen_timestamp: Option<Tai64N>,
    /// When we last sent an initiation, for retry pacing.
    pub last_initiation_sent: Option<Instant>,
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.precomputed_ss.zeroize();
        self.psk.zeroize();
    }
}

impl Handshake {
    pub fn new(device: &StaticIdentity, remote_static: [u8; 32], psk: Option<[u8; 32]>) -> Self {
        let mut hs = Self::new_detached(remote_static, psk);
        hs.bind_identity(device);
        hs
    }

    /// A handshake with no device identity yet. Peers can be configured
    /// before the private key is set; [`Handshake::bind_identity`] fills
    /// in the static-static secret once one exists.
    pub fn new_detached(remote_static: [u8; 32], psk: Option<[u8; 32]>) -> Self {
        Self {
            precomputed_ss: [0u8; 32],
            remote_static,
            psk: psk.unwrap_or([0u8; 32]),
            state: State::Zeroed,
            last_seen_timestamp: None,
            last_initiation_sent: None,
        }
    }

    /// Recompute the static-static secret against a (new) device identity.
    /// Any in-flight handshake is void.
    pub fn bind_identity(&mut self, device: &StaticIdentity) {
        self.precomputed_ss.zeroize();
        self.precomputed_ss = device.dh(&self.remote_static);
        self.clear();
    }

    pub(crate) fn precomputed_ss(&self) -> [u8; 32] {
        self.precomputed_ss
    }

    pub fn set_psk(&mut self, psk: Option<[u8; 32]>) {
        self.psk.zeroize();
        self.psk = psk.unwrap_or([0u8; 32]);
    }

    pub fn psk(&self) -> Option<[u8; 32]> {
        if self.psk == [0u8; 32] {
            None
        } else {
            Some(self.psk)
        }
    }

    /// Drop all transient handshake state.
    pub fn clear(&mut self) {
        self.state = State::Zeroed;
        self.last_initiation_sent = None;
    }

    /// Whether an initiation is in flight awaiting a response.
    pub fn is_initiating(&self) -> bool {
        matches!(self.state, State::InitiationCreated { .. })
    }

    /// Local index of the in-flight initiation, if any.
    pub fn local_index(&self) -> Option<u32> {
        match self.state {
            State::InitiationCreated { local_index, .. } => Some(local_index),
            _ => None,
        }
    }

    /// Build a handshake initiation toward this peer.
    ///
    /// The returned message has mac1/mac2 zeroed; the caller signs them
    /// against its cookie state before transmission.
    pub fn create_initiation(
        &mut self,
        device: &StaticIdentity,
        local_index: u32,
    ) -> Result<Initiation> {
        let mut transcript = noise::SymmetricState::new(&self.remote_static);

        let (ephemeral_private, ephemeral_public) = x25519::dh_generate();
        transcript.mix_hash(&ephemeral_public);
        transcript.mix_chain(&ephemeral_public);

        // es
        let key = transcript.mix_key(&x25519::dh(&ephemeral_private, &self.remote_static));
        let encrypted_static = transcript.encrypt_and_hash(&key, &device.public)?;
        let encrypted_static: [u8; 48] = encrypted_static
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        // ss
        let key = transcript.mix_key(&self.precomputed_ss);
        let timestamp = Tai64N::now();
        let encrypted_timestamp = transcript.encrypt_and_hash(&key, &timestamp.to_bytes())?;
        let encrypted_timestamp: [u8; 28] = encrypted_timestamp
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        self.state = State::InitiationCreated {
            local_index,
            ephemeral_private,
            transcript,
        };
        self.last_initiation_sent = Some(Instant::now());

        Ok(Initiation {
            sender_index: local_index,
            ephemeral: ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Initiator: consume a handshake response and derive the session.
    pub fn consume_response(
        &mut self,
        device: &StaticIdentity,
        response: &Response,
    ) -> Result<SessionKeys> {
        let (local_index, ephemeral_private, transcript) = match &self.state {
            State::InitiationCreated {
                local_index,
                ephemeral_private,
                transcript,
            } => (*local_index, *ephemeral_private, transcript.clone()),
            _ => return Err(ProtocolError::InvalidHandshakeState.into()),
        };
        if response.receiver_index != local_index {
            return Err(ProtocolError::UnknownIndex {
                index: response.receiver_index,
            }
            .into());
        }

        let mut transcript = transcript;
        transcript.mix_hash(&response.ephemeral);
        transcript.mix_chain(&response.ephemeral);

        // ee, then se
        transcript.mix_chain(&x25519::dh(&ephemeral_private, &response.ephemeral));
        transcript.mix_chain(&device.dh(&response.ephemeral));

        let key = transcript.mix_key_and_hash(&self.psk);
        transcript.decrypt_and_hash(&key, &response.encrypted_nothing)?;

        let (send, recv) = transcript.split(true);
        self.state = State::ResponseConsumed;

        Ok(SessionKeys {
            send,
            recv,
            local_index,
            remote_index: response.sender_index,
            is_initiator: true,
        })
    }

    /// Responder: the monotone-timestamp replay defense. Accepts the
    /// initiation only if its timestamp is strictly newer than anything
    /// previously seen from this static key.
    pub fn check_and_record_timestamp(&mut self, timestamp: Tai64N) -> Result<()> {
        if let Some(last) = self.last_seen_timestamp {
            if timestamp <= last {
                return Err(ProtocolError::StaleTimestamp.into());
            }
        }
        self.last_seen_timestamp = Some(timestamp);
        Ok(())
    }

    /// Responder: build the response for a consumed initiation and derive
    /// the session. mac1/mac2 on the returned message are zeroed for the
    /// caller to sign.
    pub fn create_response(
        &mut self,
        device: &StaticIdentity,
        consumed: &ConsumedInitiation,
        local_index: u32,
    ) -> Result<(Response, SessionKeys)> {
        let mut transcript = consumed.transcript.clone();

        let (ephemeral_private, ephemeral_public) = x25519::dh_generate();
        transcript.mix_hash(&ephemeral_public);
        transcript.mix_chain(&ephemeral_public);

        // ee, then se
        transcript.mix_chain(&x25519::dh(&ephemeral_private, &consumed.remote_ephemeral));
        transcript.mix_chain(&x25519::dh(&ephemeral_private, &consumed.remote_static));

        let key = transcript.mix_key_and_hash(&self.psk);
        let sealed = transcript.encrypt_and_hash(&key, &[])?;
        let encrypted_nothing: [u8; 16] = sealed.try_into().map_err(|_| CryptoError::Encryption)?;

        let (send, recv) = transcript.split(false);
        self.state = State::ResponseCreated;

        let response = Response {
            sender_index: local_index,
            receiver_index: consumed.remote_index,
            ephemeral: ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        Ok((
            response,
            SessionKeys {
                send,
                recv,
                local_index,
                remote_index: consumed.remote_index,
                is_initiator: false,
            },
        ))
    }
}

/// An initiation whose outer layer decrypted: we know who is knocking but
/// have not yet verified the timestamp against their peer entry.
pub struct PartialInitiation {
    pub remote_static: [u8; 32],
    remote_ephemeral: [u8; 32],
    remote_index: u32,
    encrypted_timestamp: [u8; 28],
    transcript: noise::SymmetricState,
}

/// A fully decrypted initiation, ready for [`Handshake::create_response`].
pub struct ConsumedInitiation {
    pub remote_static: [u8; 32],
    pub remote_ephemeral: [u8; 32],
    pub remote_index: u32,
    pub timestamp: Tai64N,
    transcript: noise::SymmetricState,
}

/// Responder: decrypt the static-key layer of an initiation.
///
/// Identifying the sender requires the device key only; the timestamp
/// layer additionally needs the peer's precomputed static-static secret,
/// so it completes in [`PartialInitiation::verify`] once the peer is found.
pub fn consume_initiation(
    device: &StaticIdentity,
    msg: &Initiation,
) -> Result<PartialInitiation> {
    let mut transcript = noise::SymmetricState::new(&device.public);

    transcript.mix_hash(&msg.ephemeral);
    transcript.mix_chain(&msg.ephemeral);

    // es from the responder side
    let key = transcript.mix_key(&device.dh(&msg.ephemeral));
    let static_plain = transcript.decrypt_and_hash(&key, &msg.encrypted_static)?;
    let remote_static: [u8; 32] = static_plain
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;

    Ok(PartialInitiation {
        remote_static,
        remote_ephemeral: msg.ephemeral,
        remote_index: msg.sender_index,
        encrypted_timestamp: msg.encrypted_timestamp,
        transcript,
    })
}

impl PartialInitiation {
    /// Decrypt the timestamp layer with the peer's static-static secret.
    pub fn verify(mut self, precomputed_ss: &[u8; 32]) -> Result<ConsumedInitiation> {
        let key = self.transcript.mix_key(precomputed_ss);
        let ts_plain = self
            .transcript
            .decrypt_and_hash(&key, &self.encrypted_timestamp)?;
        let ts_bytes: [u8; 12] = ts_plain.try_into().map_err(|_| CryptoError::Decryption)?;
        let timestamp =
            Tai64N::from_slice(&ts_bytes).map_err(|_| CryptoError::Decryption)?;

        Ok(ConsumedInitiation {
            remote_static: self.remote_static,
            remote_ephemeral: self.remote_ephemeral,
            remote_index: self.remote_index,
            timestamp,
            transcript: self.transcript,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identities() -> (StaticIdentity, StaticIdentity) {
        let (a, _) = x25519::dh_generate();
        let (b, _) = x25519::dh_generate();
        (StaticIdentity::new(a), StaticIdentity::new(b))
    }

    fn run_handshake(psk: Option<[u8; 32]>) -> (SessionKeys, SessionKeys) {
        let (init_dev, resp_dev) = identities();

        let mut initiator = Handshake::new(&init_dev, resp_dev.public, psk);
        let mut responder = Handshake::new(&resp_dev, init_dev.public, psk);

        let init_msg = initiator.create_initiation(&init_dev, 101).unwrap();

        let partial = consume_initiation(&resp_dev, &init_msg).unwrap();
        assert_eq!(partial.remote_static, init_dev.public);

        let consumed = partial.verify(&resp_dev.dh(&init_dev.public)).unwrap();
        responder
            .check_and_record_timestamp(consumed.timestamp)
            .unwrap();
        let (resp_msg, resp_keys) = responder
            .create_response(&resp_dev, &consumed, 202)
            .unwrap();

        let init_keys = initiator.consume_response(&init_dev, &resp_msg).unwrap();
        (init_keys, resp_keys)
    }

    #[test]
    fn full_handshake_derives_matching_keys() {
        let (init_keys, resp_keys) = run_handshake(None);
        assert_eq!(init_keys.send, resp_keys.recv);
        assert_eq!(init_keys.recv, resp_keys.send);
        assert_eq!(init_keys.local_index, 101);
        assert_eq!(init_keys.remote_index, 202);
        assert_eq!(resp_keys.remote_index, 101);
        assert!(init_keys.is_initiator);
        assert!(!resp_keys.is_initiator);
    }

    #[test]
    fn psk_changes_the_derived_keys() {
        let (without, _) = run_handshake(None);
        let (with, _) = run_handshake(Some([9u8; 32]));
        assert_ne!(without.send, with.send);
    }

    #[test]
    fn mismatched_psk_fails_to_consume_response() {
        let (init_dev, resp_dev) = identities();
        let mut initiator = Handshake::new(&init_dev, resp_dev.public, None);
        let mut responder = Handshake::new(&resp_dev, init_dev.public, Some([1u8; 32]));

        let init_msg = initiator.create_initiation(&init_dev, 1).unwrap();
        let consumed = consume_initiation(&resp_dev, &init_msg)
            .unwrap()
            .verify(&resp_dev.dh(&init_dev.public))
            .unwrap();
        let (resp_msg, _) = responder.create_response(&resp_dev, &consumed, 2).unwrap();

        assert!(initiator.consume_response(&init_dev, &resp_msg).is_err());
    }

    #[test]
    fn response_to_wrong_index_rejected() {
        let (init_dev, resp_dev) = identities();
        let mut initiator = Handshake::new(&init_dev, resp_dev.public, None);
        let mut responder = Handshake::new(&resp_dev, init_dev.public, None);

        let init_msg = initiator.create_initiation(&init_dev, 5).unwrap();
        let consumed = consume_initiation(&resp_dev, &init_msg)
            .unwrap()
            .verify(&resp_dev.dh(&init_dev.public))
            .unwrap();
        let (mut resp_msg, _) = responder.create_response(&resp_dev, &consumed, 6).unwrap();
        resp_msg.receiver_index = 99;

        assert!(initiator.consume_response(&init_dev, &resp_msg).is_err());
    }

    #[test]
    fn response_without_initiation_rejected() {
        let (init_dev, resp_dev) = identities();
        let mut hs = Handshake::new(&init_dev, resp_dev.public, None);
        let bogus = Response {
            sender_index: 1,
            receiver_index: 2,
            ephemeral: [0u8; 32],
            encrypted_nothing: [0u8; 16],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        assert!(hs.consume_response(&init_dev, &bogus).is_err());
    }

    #[test]
    fn initiation_from_unknown_device_key_fails() {
        let (init_dev, resp_dev) = identities();
        let (other_dev, _) = identities();
        let mut initiator = Handshake::new(&init_dev, resp_dev.public, None);
        let init_msg = initiator.create_initiation(&init_dev, 1).unwrap();

        // Addressed to resp_dev; a different responder cannot open it.
        assert!(consume_initiation(&other_dev, &init_msg).is_err());
    }

    #[test]
    fn timestamp_replay_is_rejected() {
        let (init_dev, resp_dev) = identities();
        let mut responder = Handshake::new(&resp_dev, init_dev.public, None);

        let now = Tai64N::now();
        responder.check_and_record_timestamp(now).unwrap();
        assert!(responder.check_and_record_timestamp(now).is_err());

        let later = Tai64N::now();
        if later > now {
            responder.check_and_record_timestamp(later).unwrap();
        }
    }

    #[test]
    fn replayed_initiation_cannot_downgrade_timestamp() {
        let (init_dev, resp_dev) = identities();
        let mut initiator = Handshake::new(&init_dev, resp_dev.public, None);
        let mut responder = Handshake::new(&resp_dev, init_dev.public, None);
        let ss = resp_dev.dh(&init_dev.public);

        let first = initiator.create_initiation(&init_dev, 1).unwrap();
        let first_ts = consume_initiation(&resp_dev, &first)
            .unwrap()
            .verify(&ss)
            .unwrap()
            .timestamp;
        responder.check_and_record_timestamp(first_ts).unwrap();

        // Replaying the exact same message yields the same timestamp.
        let replay_ts = consume_initiation(&resp_dev, &first)
            .unwrap()
            .verify(&ss)
            .unwrap()
            .timestamp;
        assert!(responder.check_and_record_timestamp(replay_ts).is_err());
    }
}
