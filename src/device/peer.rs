//! Per-peer state
//!
//! A peer is a static public key plus everything negotiated around it:
//! endpoint, handshake progress, installed keypairs, timers, allowed-IP
//! prefixes, and the staging queue frames wait in while no session exists.
//! Fast-path counters and sequence numbers are atomics; everything else
//! sits behind one short-held lock.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::keypair::KeypairSlots;
use crate::device::pipeline::{InboundResult, OutboundResult};
use crate::device::timers::Timers;
use crate::protocol::cookie::CookieJar;
use crate::protocol::handshake::Handshake;

/// Staged frames per peer before the oldest is dropped.
pub const STAGED_QUEUE_LIMIT: usize = 1024;

/// Depth of the per-peer ordered sinks.
pub const SINK_QUEUE_DEPTH: usize = 1024;

#[derive(Default)]
pub struct PeerCounters {
    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub staged_drops: AtomicU64,
    pub auth_failures: AtomicU64,
    pub replay_drops: AtomicU64,
}

pub struct Peer {
    pub public_key: [u8; 32],
    pub counters: PeerCounters,
    inner: Mutex<PeerInner>,
    outbound_seq: AtomicU64,
    inbound_seq: AtomicU64,
    tx_sink: mpsc::Sender<OutboundResult>,
    rx_sink: mpsc::Sender<InboundResult>,
    /// Ordered sink tasks, aborted when the peer is removed.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct PeerInner {
    pub endpoint: Option<SocketAddr>,
    pub handshake: Handshake,
    pub cookie: CookieJar,
    pub keypairs: KeypairSlots,
    pub timers: Timers,
    /// Authoritative prefix list, mirrored into the device trie.
    pub allowed_ips: Vec<(IpAddr, u8)>,
    pub last_handshake: Option<SystemTime>,
    pub staged: VecDeque<Vec<u8>>,
    pub protocol_version: u8,
}

impl Peer {
    /// Channel pairs for the ordered sinks; the device spawns the sink
    /// tasks around the receivers and registers them with
    /// [`Peer::attach_tasks`].
    pub fn channels() -> (
        (mpsc::Sender<OutboundResult>, mpsc::Receiver<OutboundResult>),
        (mpsc::Sender<InboundResult>, mpsc::Receiver<InboundResult>),
    ) {
        (
            mpsc::channel(SINK_QUEUE_DEPTH),
            mpsc::channel(SINK_QUEUE_DEPTH),
        )
    }

    pub fn new(
        public_key: [u8; 32],
        handshake: Handshake,
        tx_sink: mpsc::Sender<OutboundResult>,
        rx_sink: mpsc::Sender<InboundResult>,
    ) -> Self {
        Self {
            public_key,
            counters: PeerCounters::default(),
            inner: Mutex::new(PeerInner {
                endpoint: None,
                handshake,
                cookie: CookieJar::new(),
                keypairs: KeypairSlots::new(),
                timers: Timers::new(),
                allowed_ips: Vec::new(),
                last_handshake: None,
                staged: VecDeque::new(),
                protocol_version: 1,
            }),
            outbound_seq: AtomicU64::new(0),
            inbound_seq: AtomicU64::new(0),
            tx_sink,
            rx_sink,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PeerInner> {
        self.inner.lock()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.inner.lock().endpoint
    }

    pub fn next_outbound_seq(&self) -> u64 {
        self.outbound_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_inbound_seq(&self) -> u64 {
        self.inbound_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn tx_sink(&self) -> mpsc::Sender<OutboundResult> {
        self.tx_sink.clone()
    }

    pub fn rx_sink(&self) -> mpsc::Sender<InboundResult> {
        self.rx_sink.clone()
    }

    pub fn attach_tasks(&self, tasks: Vec<JoinHandle<()>>) {
        self.tasks.lock().extend(tasks);
    }

    pub fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl PeerInner {
    /// Queue a frame while no sendable keypair exists. Bounded;
    /// the oldest staged frame is dropped on overflow.
    pub fn stage(&mut self, frame: Vec<u8>, counters: &PeerCounters) {
        if self.staged.len() >= STAGED_QUEUE_LIMIT {
            self.staged.pop_front();
            counters.staged_drops.fetch_add(1, Ordering::Relaxed);
        }
        self.staged.push_back(frame);
    }

    /// Take everything staged for encryption under a fresh keypair.
    pub fn unstage_all(&mut self) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut self.staged)
    }
}
