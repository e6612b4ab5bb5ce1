//! Session keypairs and the three-slot rotation
//!
//! A keypair is the pair of symmetric AEAD keys derived from one completed
//! handshake. Each peer holds up to three: `previous`, `current`, and
//! `next`. Sending uses `current`; receiving accepts any of the three so
//! rotation never drops in-flight traffic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use zeroize::Zeroize;

use crate::crypto::aead;
use crate::device::timers::{
    REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME,
    RECEIVE_REJECT_GRACE,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::SessionKeys;
use crate::protocol::messages::TransportHeader;
use crate::protocol::replay::ReplayFilter;

/// One installed session.
pub struct Keypair {
    pub local_index: u32,
    pub remote_index: u32,
    send_key: [u8; 32],
    recv_key: [u8; 32],
    pub created: Instant,
    pub is_initiator: bool,
    send_counter: AtomicU64,
    /// Responder sessions may not send until the peer proves it holds the
    /// keys by sending one valid transport message.
    confirmed: AtomicBool,
    replay: Mutex<ReplayFilter>,
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
    }
}

impl Keypair {
    pub fn new(keys: SessionKeys) -> Self {
        Self {
            local_index: keys.local_index,
            remote_index: keys.remote_index,
            send_key: keys.send,
            recv_key: keys.recv,
            created: Instant::now(),
            is_initiator: keys.is_initiator,
            send_counter: AtomicU64::new(0),
            confirmed: AtomicBool::new(keys.is_initiator),
            replay: Mutex::new(ReplayFilter::new()),
        }
    }

    /// Seal a padded plaintext into a complete transport datagram,
    /// consuming the next nonce.
    pub fn encrypt(&self, padded: &[u8]) -> Result<Vec<u8>> {
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        if counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired.into());
        }
        let sealed = aead::seal(&self.send_key, counter, padded, &[])?;
        Ok(TransportHeader::assemble(self.remote_index, counter, &sealed))
    }

    /// Open a transport datagram: authenticate, then run the counter
    /// through the replay window. Marks the keypair confirmed on success.
    pub fn decrypt(&self, datagram: &[u8]) -> Result<(u64, Vec<u8>)> {
        let header = TransportHeader::from_bytes(datagram)?;
        if header.counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired.into());
        }
        let plain = aead::open(
            &self.recv_key,
            header.counter,
            TransportHeader::payload(datagram),
            &[],
        )?;
        if !self.replay.lock().check_and_update(header.counter) {
            return Err(ProtocolError::ReplayDetected {
                counter: header.counter,
            }
            .into());
        }
        self.confirmed.store(true, Ordering::Release);
        Ok((header.counter, plain))
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    pub fn sent_messages(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    /// Usable for sending: confirmed, young enough, nonce space left.
    pub fn usable_for_sending(&self) -> bool {
        self.is_confirmed()
            && self.created.elapsed() < REJECT_AFTER_TIME
            && self.sent_messages() < REJECT_AFTER_MESSAGES
    }

    /// Usable for receiving: the send bounds plus a reordering grace.
    pub fn usable_for_receiving(&self) -> bool {
        self.created.elapsed() < REJECT_AFTER_TIME + RECEIVE_REJECT_GRACE
    }

    /// Whether the initiator should negotiate a replacement.
    pub fn wants_rekey(&self) -> bool {
        self.is_initiator
            && (self.created.elapsed() >= REKEY_AFTER_TIME
                || self.sent_messages() >= REKEY_AFTER_MESSAGES)
    }
}

/// The per-peer previous/current/next slots.
#[derive(Default)]
pub struct KeypairSlots {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

impl KeypairSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly derived keypair.
    ///
    /// An initiator session becomes `current` immediately (the responder
    /// proved itself by answering). A responder session waits in `next`
    /// until confirmed. Returns the local indices of any sessions this
    /// displaced, so the caller can retire them from the index table.
    pub fn install(&mut self, keypair: Arc<Keypair>) -> Vec<u32> {
        let mut retired = Vec::new();
        if keypair.is_initiator {
            if let Some(next) = self.next.take() {
                retired.extend(self.previous.take().map(|k| k.local_index));
                self.previous = Some(next);
            } else {
                retired.extend(self.previous.take().map(|k| k.local_index));
                self.previous = self.current.take();
            }
            self.current = Some(keypair);
        } else {
            retired.extend(self.next.take().map(|k| k.local_index));
            self.next = Some(keypair);
        }
        retired
    }

    /// First valid receive under `next`: rotate it into `current`.
    ///
    /// `previous` is dropped (and zeroized), `current` shifts down.
    pub fn promote(&mut self, local_index: u32) -> Vec<u32> {
        let promotable = self
            .next
            .as_ref()
            .map(|k| k.local_index == local_index)
            .unwrap_or(false);
        if !promotable {
            return Vec::new();
        }
        let mut retired = Vec::new();
        retired.extend(self.previous.take().map(|k| k.local_index));
        self.previous = self.current.take();
        self.current = self.next.take();
        retired
    }

    /// Look up a receive-capable keypair by local index.
    pub fn find_by_index(&self, local_index: u32) -> Option<Arc<Keypair>> {
        [&self.current, &self.previous, &self.next]
            .into_iter()
            .flatten()
            .find(|k| k.local_index == local_index && k.usable_for_receiving())
            .cloned()
    }

    /// The keypair to encrypt with right now, if any.
    pub fn current_sendable(&self) -> Option<Arc<Keypair>> {
        self.current
            .as_ref()
            .filter(|k| k.usable_for_sending())
            .cloned()
    }

    pub fn current(&self) -> Option<Arc<Keypair>> {
        self.current.clone()
    }

    pub fn next_index(&self) -> Option<u32> {
        self.next.as_ref().map(|k| k.local_index)
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_none() && self.current.is_none() && self.next.is_none()
    }

    /// Drop every slot, returning the retired indices.
    pub fn clear(&mut self) -> Vec<u32> {
        let mut retired = Vec::new();
        for slot in [&mut self.previous, &mut self.current, &mut self.next] {
            retired.extend(slot.take().map(|k| k.local_index));
        }
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(local: u32, remote: u32, initiator: bool) -> SessionKeys {
        SessionKeys {
            send: [local as u8; 32],
            recv: [remote as u8; 32],
            local_index: local,
            remote_index: remote,
            is_initiator: initiator,
        }
    }

    fn pair(local: u32, initiator: bool) -> Arc<Keypair> {
        Arc::new(Keypair::new(keys(local, local + 100, initiator)))
    }

    #[test]
    fn encrypt_decrypt_roundtrip_with_replay() {
        let a = Keypair::new(keys(1, 2, true));
        let b = Keypair::new(SessionKeys {
            send: [2u8; 32],
            recv: [1u8; 32],
            local_index: 2,
            remote_index: 1,
            is_initiator: false,
        });

        let datagram = a.encrypt(b"sixteen byte pad").unwrap();
        let (counter, plain) = b.decrypt(&datagram).unwrap();
        assert_eq!(counter, 0);
        assert_eq!(plain, b"sixteen byte pad");

        // Replaying the same datagram fails the window.
        assert!(b.decrypt(&datagram).is_err());
    }

    #[test]
    fn decrypt_confirms_a_responder_keypair() {
        let responder = Keypair::new(SessionKeys {
            send: [2u8; 32],
            recv: [1u8; 32],
            local_index: 2,
            remote_index: 1,
            is_initiator: false,
        });
        assert!(!responder.usable_for_sending());

        let initiator = Keypair::new(keys(1, 2, true));
        assert!(initiator.usable_for_sending());

        let datagram = initiator.encrypt(&[]).unwrap();
        responder.decrypt(&datagram).unwrap();
        assert!(responder.usable_for_sending());
    }

    #[test]
    fn initiator_install_replaces_current() {
        let mut slots = KeypairSlots::new();
        assert!(slots.install(pair(1, true)).is_empty());
        assert!(slots.install(pair(2, true)).is_empty());
        // 1 moved to previous; a third install retires it.
        let retired = slots.install(pair(3, true));
        assert_eq!(retired, vec![1]);
        assert_eq!(slots.current_sendable().unwrap().local_index, 3);
    }

    #[test]
    fn responder_install_waits_in_next_until_promoted() {
        let mut slots = KeypairSlots::new();
        slots.install(pair(1, true));
        slots.install(pair(2, false));

        // Unconfirmed: still sending under 1.
        assert_eq!(slots.current_sendable().unwrap().local_index, 1);
        assert_eq!(slots.next_index(), Some(2));

        // A receive under 2 promotes it.
        slots.promote(2);
        assert!(slots.next_index().is_none());
        assert_eq!(slots.current().unwrap().local_index, 2);
        // 1 is still reachable as previous for receive.
        assert!(slots.find_by_index(1).is_some());
    }

    #[test]
    fn promote_ignores_non_next_indices() {
        let mut slots = KeypairSlots::new();
        slots.install(pair(1, true));
        slots.install(pair(2, false));
        assert!(slots.promote(1).is_empty());
        assert_eq!(slots.next_index(), Some(2));
    }

    #[test]
    fn promotion_retires_previous() {
        let mut slots = KeypairSlots::new();
        slots.install(pair(1, true));
        slots.install(pair(2, true));
        slots.install(pair(3, false));
        // previous=1, current=2, next=3.
        let retired = slots.promote(3);
        assert_eq!(retired, vec![1]);
        assert_eq!(slots.current().unwrap().local_index, 3);
        assert!(slots.find_by_index(2).is_some());
    }

    #[test]
    fn clear_returns_all_indices() {
        let mut slots = KeypairSlots::new();
        slots.install(pair(1, true));
        slots.install(pair(2, true));
        slots.install(pair(3, false));
        let mut retired = slots.clear();
        retired.sort_unstable();
        assert_eq!(retired, vec![1, 2, 3]);
        assert!(slots.is_empty());
    }

    #[test]
    fn find_by_index_spans_all_slots() {
        let mut slots = KeypairSlots::new();
        slots.install(pair(1, true));
        slots.install(pair(2, true));
        slots.install(pair(3, false));
        for idx in [1, 2, 3] {
            assert_eq!(slots.find_by_index(idx).unwrap().local_index, idx);
        }
        assert!(slots.find_by_index(9).is_none());
    }
}
