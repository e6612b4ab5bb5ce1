//! Per-peer timer state machine
//!
//! All protocol timing constants live here. Each peer carries a set of
//! deadline slots driven by send/receive/handshake events; a device tick
//! task polls [`Timers::fire`] and acts on whatever came due. Rearming is
//! replace-the-deadline, cancelling is clearing the slot.

use std::time::{Duration, Instant};

use rand::Rng;

/// Initiate a rekey after this many messages under one keypair.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Refuse to use a keypair after this many messages.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13) - 1;

/// Initiate a rekey once the current keypair is this old (initiator only).
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Refuse to use a keypair older than this.
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Give up a handshake attempt after retrying for this long.
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Retransmit an unanswered initiation after this long (plus jitter).
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound of the uniform jitter added to `REKEY_TIMEOUT`.
pub const REKEY_TIMEOUT_JITTER: Duration = Duration::from_millis(334);

/// Send a keepalive if we received data but sent nothing for this long.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Destroy all key material after this long with no new handshake.
pub const ZERO_KEYS_AFTER: Duration = Duration::from_secs(180 * 3);

/// Grace added to `REJECT_AFTER_TIME` on the receive side for reordering.
pub const RECEIVE_REJECT_GRACE: Duration = Duration::from_secs(10);

/// `REKEY_TIMEOUT` with its random jitter applied.
pub fn jittered_rekey_timeout() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..REKEY_TIMEOUT_JITTER.as_millis() as u64);
    REKEY_TIMEOUT + Duration::from_millis(jitter)
}

/// Something a due deadline asks the device to do for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// No response within the rekey timeout; send the initiation again.
    RetransmitHandshake,
    /// Retried for `REKEY_ATTEMPT_TIME`; stop trying and drop staged data.
    AbandonHandshake,
    /// Received data but sent nothing; send an empty transport message.
    SendKeepalive,
    /// Sent data but nothing authenticated came back; negotiate new keys.
    NewHandshake,
    /// Long idle; zeroize every keypair.
    ZeroKeys,
    /// Persistent keepalive interval elapsed.
    PersistentKeepalive,
}

/// Deadline slots for one peer.
#[derive(Default)]
pub struct Timers {
    retransmit_handshake: Option<Instant>,
    /// Set when an attempt starts; bounds the whole retry sequence.
    handshake_attempt_deadline: Option<Instant>,
    send_keepalive: Option<Instant>,
    new_handshake: Option<Instant>,
    zero_keys: Option<Instant>,
    persistent_keepalive_at: Option<Instant>,
    persistent_interval: Option<Duration>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// An outgoing data-carrying transport message left this peer.
    pub fn on_data_sent(&mut self) {
        if self.new_handshake.is_none() {
            self.new_handshake = Some(Instant::now() + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
        }
    }

    /// Any authenticated transport message left this peer (data or
    /// keepalive): the peer does not need our keepalive for a while.
    pub fn on_any_packet_sent(&mut self) {
        self.send_keepalive = None;
        if let Some(interval) = self.persistent_interval {
            self.persistent_keepalive_at = Some(Instant::now() + interval);
        }
    }

    /// An authenticated data-carrying message arrived.
    pub fn on_data_received(&mut self) {
        if self.send_keepalive.is_none() {
            self.send_keepalive = Some(Instant::now() + KEEPALIVE_TIMEOUT);
        }
    }

    /// Any authenticated message arrived (data, keepalive, or handshake).
    pub fn on_authenticated_packet_received(&mut self) {
        self.new_handshake = None;
    }

    /// We sent a handshake initiation.
    pub fn on_handshake_initiated(&mut self) {
        let now = Instant::now();
        self.retransmit_handshake = Some(now + jittered_rekey_timeout());
        if self.handshake_attempt_deadline.is_none() {
            self.handshake_attempt_deadline = Some(now + REKEY_ATTEMPT_TIME);
        }
    }

    /// A handshake completed (either role); new secrets exist.
    pub fn on_handshake_complete(&mut self) {
        self.retransmit_handshake = None;
        self.handshake_attempt_deadline = None;
        self.zero_keys = Some(Instant::now() + ZERO_KEYS_AFTER);
        if let Some(interval) = self.persistent_interval {
            self.persistent_keepalive_at = Some(Instant::now() + interval);
        }
    }

    /// Configure (or disable, with 0) the persistent keepalive.
    pub fn set_persistent_keepalive(&mut self, secs: u16) {
        if secs == 0 {
            self.persistent_interval = None;
            self.persistent_keepalive_at = None;
        } else {
            let interval = Duration::from_secs(u64::from(secs));
            self.persistent_interval = Some(interval);
            self.persistent_keepalive_at = Some(Instant::now() + interval);
        }
    }

    pub fn persistent_keepalive(&self) -> u16 {
        self.persistent_interval
            .map(|d| d.as_secs() as u16)
            .unwrap_or(0)
    }

    /// Cancel everything. Used on peer removal and device down.
    pub fn clear(&mut self) {
        self.retransmit_handshake = None;
        self.handshake_attempt_deadline = None;
        self.send_keepalive = None;
        self.new_handshake = None;
        self.zero_keys = None;
        self.persistent_keepalive_at = None;
    }

    /// Collect and clear every deadline that is due at `now`.
    pub fn fire(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut events = Vec::new();

        if take_due(&mut self.retransmit_handshake, now) {
            let abandoned = self
                .handshake_attempt_deadline
                .map(|d| now >= d)
                .unwrap_or(false);
            if abandoned {
                self.handshake_attempt_deadline = None;
                events.push(TimerEvent::AbandonHandshake);
            } else {
                events.push(TimerEvent::RetransmitHandshake);
            }
        }
        if take_due(&mut self.send_keepalive, now) {
            events.push(TimerEvent::SendKeepalive);
        }
        if take_due(&mut self.new_handshake, now) {
            events.push(TimerEvent::NewHandshake);
        }
        if take_due(&mut self.zero_keys, now) {
            events.push(TimerEvent::ZeroKeys);
        }
        if take_due(&mut self.persistent_keepalive_at, now) {
            if let Some(interval) = self.persistent_interval {
                self.persistent_keepalive_at = Some(now + interval);
            }
            events.push(TimerEvent::PersistentKeepalive);
        }

        events
    }
}

fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    match slot {
        Some(deadline) if now >= *deadline => {
            *slot = None;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_protocol() {
        assert_eq!(REKEY_AFTER_MESSAGES, 1u64 << 60);
        assert_eq!(REJECT_AFTER_MESSAGES, u64::MAX - 8192 - 1);
        assert_eq!(REKEY_AFTER_TIME.as_secs(), 120);
        assert_eq!(REJECT_AFTER_TIME.as_secs(), 180);
        assert_eq!(ZERO_KEYS_AFTER.as_secs(), 540);
    }

    #[test]
    fn data_sent_arms_new_handshake_once() {
        let mut t = Timers::new();
        t.on_data_sent();
        let later = Instant::now() + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT + Duration::from_millis(1);
        // Sending again does not push the deadline out.
        t.on_data_sent();
        assert_eq!(t.fire(later), vec![TimerEvent::NewHandshake]);
        // Cleared after firing.
        assert!(t.fire(later + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn authenticated_receive_cancels_new_handshake() {
        let mut t = Timers::new();
        t.on_data_sent();
        t.on_authenticated_packet_received();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(t.fire(later).is_empty());
    }

    #[test]
    fn keepalive_armed_by_receive_cancelled_by_send() {
        let mut t = Timers::new();
        t.on_data_received();
        t.on_any_packet_sent();
        assert!(t.fire(Instant::now() + KEEPALIVE_TIMEOUT).is_empty());

        t.on_data_received();
        assert_eq!(
            t.fire(Instant::now() + KEEPALIVE_TIMEOUT),
            vec![TimerEvent::SendKeepalive]
        );
    }

    #[test]
    fn retransmit_until_attempt_deadline() {
        let mut t = Timers::new();
        t.on_handshake_initiated();

        let mid = Instant::now() + REKEY_TIMEOUT + REKEY_TIMEOUT_JITTER;
        assert_eq!(t.fire(mid), vec![TimerEvent::RetransmitHandshake]);

        // The device re-initiates, which re-arms; past the attempt window
        // the next expiry abandons instead.
        t.on_handshake_initiated();
        let past_attempt = Instant::now() + REKEY_ATTEMPT_TIME + REKEY_TIMEOUT;
        assert_eq!(t.fire(past_attempt), vec![TimerEvent::AbandonHandshake]);
    }

    #[test]
    fn handshake_complete_schedules_zero_keys() {
        let mut t = Timers::new();
        t.on_handshake_initiated();
        t.on_handshake_complete();
        assert!(t.fire(Instant::now() + REKEY_TIMEOUT * 4).is_empty());
        assert_eq!(
            t.fire(Instant::now() + ZERO_KEYS_AFTER),
            vec![TimerEvent::ZeroKeys]
        );
    }

    #[test]
    fn persistent_keepalive_rearms() {
        let mut t = Timers::new();
        t.set_persistent_keepalive(25);
        assert_eq!(t.persistent_keepalive(), 25);

        let due = Instant::now() + Duration::from_secs(25);
        assert_eq!(t.fire(due), vec![TimerEvent::PersistentKeepalive]);
        assert_eq!(
            t.fire(due + Duration::from_secs(25)),
            vec![TimerEvent::PersistentKeepalive]
        );

        t.set_persistent_keepalive(0);
        assert!(t.fire(due + Duration::from_secs(100)).is_empty());
    }

    #[test]
    fn clear_cancels_everything() {
        let mut t = Timers::new();
        t.on_data_sent();
        t.on_data_received();
        t.on_handshake_initiated();
        t.set_persistent_keepalive(1);
        t.clear();
        assert!(t.fire(Instant::now() + Duration::from_secs(600)).is_empty());
    }
}
