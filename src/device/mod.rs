//! Device orchestration
//!
//! One [`Device`] owns the identity key, the peer and index tables, the
//! allowed-IPs routing trie, the crypto worker pools, and the lifecycle
//! (`Up`/`Down`/`Close`). Frames flow TUN → trie → staging/encrypt pool →
//! ordered transmit → bind, and bind → demux → decrypt pool → ordered
//! receive → TUN. Handshake traffic takes a dedicated slow-path task so
//! curve operations never stall the data plane.
//!
//! Lock order is device tables → peer → keypair internals, never
//! reversed, and no lock is held across an await point.

pub mod allowed_ips;
pub mod index;
pub mod ip;
pub mod keypair;
pub mod peer;
pub mod pipeline;
pub mod rate_limiter;
pub mod timers;
pub mod uapi;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::noise;
use crate::error::{DeviceError, Result};
use crate::net::{UdpBind, MAX_DATAGRAM};
use crate::protocol::cookie::{self, CookieIssuer};
use crate::protocol::handshake::{self, Handshake, StaticIdentity};
use crate::protocol::messages::{
    message_type, CookieReply, Initiation, MessageType, Response, TransportHeader,
};
use crate::tun::Tun;

use allowed_ips::AllowedIps;
use index::{IndexPurpose, IndexTable};
use keypair::Keypair;
use peer::Peer;
use pipeline::{
    spawn_decrypt_pool, spawn_encrypt_pool, DecryptJob, EncryptJob, InboundDrop, InboundResult,
    OutboundResult, SequencedQueue, WorkerPool,
};
use rate_limiter::RateLimiter;
use timers::TimerEvent;

/// How often the timer task sweeps peer deadlines.
const TIMER_TICK: Duration = Duration::from_millis(250);

/// Depth of the handshake slow-path queue.
const HANDSHAKE_QUEUE_DEPTH: usize = 256;

/// Transport datagram overhead: 16-byte header plus 16-byte tag.
const TRANSPORT_OVERHEAD: usize = 32;

const STATE_DOWN: u8 = 0;
const STATE_UP: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub listen_port: u16,
    pub fwmark: u32,
    /// Crypto workers per direction; 0 picks from available parallelism.
    pub crypto_workers: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            fwmark: 0,
            crypto_workers: 0,
        }
    }
}

/// Silent-drop counters, one per error class on the data path.
#[derive(Default)]
pub struct DeviceCounters {
    pub malformed: AtomicU64,
    pub unroutable: AtomicU64,
    pub unknown_index: AtomicU64,
    pub handshake_drops: AtomicU64,
    pub rate_limited: AtomicU64,
    pub reverse_path_drops: AtomicU64,
    pub pipeline_drops: AtomicU64,
}

pub(crate) struct DeviceInner {
    state: AtomicU8,
    identity: RwLock<Option<Arc<StaticIdentity>>>,
    peers: RwLock<HashMap<[u8; 32], Arc<Peer>>>,
    routes: RwLock<AllowedIps<Arc<Peer>>>,
    index: IndexTable<Arc<Peer>>,
    limiter: RateLimiter,
    cookies: Mutex<CookieIssuer>,
    bind: RwLock<Option<Arc<UdpBind>>>,
    listen_port: Mutex<u16>,
    fwmark: Mutex<u32>,
    tun_writer: mpsc::Sender<Vec<u8>>,
    encrypt_pool: WorkerPool<EncryptJob>,
    decrypt_pool: WorkerPool<DecryptJob>,
    handshake_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    pub(crate) counters: DeviceCounters,
    /// Tasks alive only while `Up` (socket receive loops).
    run_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Tasks alive for the device's lifetime.
    base_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The userspace tunnel device.
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Build a device around a TUN seam. Must run inside a tokio runtime;
    /// the TUN reader, timer sweep, and crypto pools start immediately,
    /// idle until [`Device::up`].
    pub fn new(tun: Tun, config: DeviceConfig) -> Self {
        let workers = if config.crypto_workers == 0 {
            pipeline::default_parallelism()
        } else {
            config.crypto_workers
        };
        let (encrypt_pool, mut base_tasks) = spawn_encrypt_pool(workers);
        let (decrypt_pool, decrypt_tasks) = spawn_decrypt_pool(workers);
        base_tasks.extend(decrypt_tasks);

        let (handshake_tx, handshake_rx) = mpsc::channel(HANDSHAKE_QUEUE_DEPTH);
        let tun_reader = tun.take_reader().expect("fresh Tun has its reader");

        let inner = Arc::new(DeviceInner {
            state: AtomicU8::new(STATE_DOWN),
            identity: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            routes: RwLock::new(AllowedIps::new()),
            index: IndexTable::new(),
            limiter: RateLimiter::new(),
            cookies: Mutex::new(CookieIssuer::new()),
            bind: RwLock::new(None),
            listen_port: Mutex::new(config.listen_port),
            fwmark: Mutex::new(config.fwmark),
            tun_writer: tun.writer(),
            encrypt_pool,
            decrypt_pool,
            handshake_tx,
            counters: DeviceCounters::default(),
            run_tasks: Mutex::new(Vec::new()),
            base_tasks: Mutex::new(Vec::new()),
        });

        base_tasks.push(tokio::spawn(tun_reader_loop(inner.clone(), tun_reader)));
        base_tasks.push(tokio::spawn(handshake_loop(inner.clone(), handshake_rx)));
        base_tasks.push(tokio::spawn(timer_loop(inner.clone())));
        inner.base_tasks.lock().extend(base_tasks);

        Self { inner }
    }

    /// Install (or with all zeroes, clear) the device private key. All
    /// handshakes and sessions die with the old key.
    pub fn set_private_key(&self, key: [u8; 32]) {
        let identity = if key == [0u8; 32] {
            None
        } else {
            Some(Arc::new(StaticIdentity::new(key)))
        };
        *self.inner.identity.write() = identity.clone();

        let peers: Vec<_> = self.inner.peers.read().values().cloned().collect();
        for peer in peers {
            let mut g = peer.lock();
            let retired = g.keypairs.clear();
            self.inner.index.remove_all(retired);
            if let Some(idx) = g.handshake.local_index() {
                self.inner.index.remove(idx);
            }
            match &identity {
                Some(id) => g.handshake.bind_identity(id),
                None => g.handshake.clear(),
            }
        }
    }

    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.inner.identity.read().as_ref().map(|id| id.public)
    }

    pub(crate) fn private_key(&self) -> Option<[u8; 32]> {
        self.inner
            .identity
            .read()
            .as_ref()
            .map(|id| id.private_bytes())
    }

    /// Snapshot of all peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.read().values().cloned().collect()
    }

    /// Data-path drop counters.
    pub fn counters(&self) -> &DeviceCounters {
        &self.inner.counters
    }

    pub fn has_identity(&self) -> bool {
        self.inner.identity.read().is_some()
    }

    /// Configured port (may be 0 = ephemeral); the bound port once up.
    pub fn listen_port(&self) -> u16 {
        if let Some(bind) = self.inner.bind.read().as_ref() {
            return bind.port();
        }
        *self.inner.listen_port.lock()
    }

    /// Change the listen port, rebinding live if the device is up.
    pub async fn set_listen_port(&self, port: u16) -> Result<()> {
        *self.inner.listen_port.lock() = port;
        if self.inner.state.load(Ordering::Acquire) == STATE_UP {
            self.inner.close_bind();
            self.inner.open_bind().await?;
        }
        Ok(())
    }

    pub fn fwmark(&self) -> u32 {
        *self.inner.fwmark.lock()
    }

    pub fn set_fwmark(&self, mark: u32) {
        *self.inner.fwmark.lock() = mark;
        if let Some(bind) = self.inner.bind.read().as_ref() {
            bind.set_fwmark(mark);
        }
    }

    /// Bring the device up: bind sockets and start the receive loops.
    pub async fn up(&self) -> Result<()> {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_CLOSED => return Err(DeviceError::Closed.into()),
            STATE_UP => return Ok(()),
            _ => {}
        }
        self.inner.open_bind().await?;
        self.inner.state.store(STATE_UP, Ordering::Release);
        tracing::info!("device up on port {}", self.listen_port());

        // Peers with persistent keepalive announce themselves.
        let peers: Vec<_> = self.inner.peers.read().values().cloned().collect();
        for peer in peers {
            let wants = {
                let g = peer.lock();
                g.timers.persistent_keepalive() != 0 && g.endpoint.is_some()
            };
            if wants {
                self.inner.initiate_handshake(&peer, false).await;
            }
        }
        Ok(())
    }

    /// Take the device down: stop receive loops, release the bind, and
    /// zeroize every session.
    pub fn down(&self) {
        if self.inner.state.load(Ordering::Acquire) == STATE_CLOSED {
            return;
        }
        self.inner.state.store(STATE_DOWN, Ordering::Release);
        self.inner.close_bind();

        let peers: Vec<_> = self.inner.peers.read().values().cloned().collect();
        for peer in peers {
            let mut g = peer.lock();
            let retired = g.keypairs.clear();
            self.inner.index.remove_all(retired);
            if let Some(idx) = g.handshake.local_index() {
                self.inner.index.remove(idx);
            }
            g.handshake.clear();
            g.cookie.clear();
            g.timers.clear();
            g.staged.clear();
        }
        tracing::info!("device down");
    }

    /// Terminal shutdown.
    pub fn close(&self) {
        self.down();
        self.inner.state.store(STATE_CLOSED, Ordering::Release);
        for peer in self.inner.peers.read().values() {
            peer.abort_tasks();
        }
        for task in self.inner.base_tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn is_up(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_UP
    }

    /// Fetch or create the peer for `public_key`.
    pub fn ensure_peer(&self, public_key: [u8; 32]) -> Arc<Peer> {
        let mut peers = self.inner.peers.write();
        if let Some(existing) = peers.get(&public_key) {
            return existing.clone();
        }

        let handshake = match self.inner.identity.read().as_ref() {
            Some(id) => Handshake::new(id, public_key, None),
            None => Handshake::new_detached(public_key, None),
        };
        let ((tx_sink, tx_rx), (rx_sink, rx_rx)) = Peer::channels();
        let peer = Arc::new(Peer::new(public_key, handshake, tx_sink, rx_sink));

        peer.attach_tasks(vec![
            tokio::spawn(peer_tx_loop(self.inner.clone(), peer.clone(), tx_rx)),
            tokio::spawn(peer_rx_loop(self.inner.clone(), peer.clone(), rx_rx)),
        ]);
        peers.insert(public_key, peer.clone());
        peer
    }

    pub fn get_peer(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        self.inner.peers.read().get(public_key).cloned()
    }

    /// Remove one peer: routes, indices, tasks, timers, secrets.
    pub fn remove_peer(&self, public_key: &[u8; 32]) -> bool {
        let Some(peer) = self.inner.peers.write().remove(public_key) else {
            return false;
        };
        self.inner
            .routes
            .write()
            .remove_matching(&|p: &Arc<Peer>| Arc::ptr_eq(p, &peer));
        self.inner.index.retain(|p| !Arc::ptr_eq(p, &peer));
        peer.abort_tasks();

        let mut g = peer.lock();
        g.keypairs.clear();
        g.handshake.clear();
        g.cookie.clear();
        g.timers.clear();
        g.staged.clear();
        true
    }

    /// Remove every peer (UAPI `replace_peers=true`).
    pub fn clear_peers(&self) {
        let keys: Vec<[u8; 32]> = self.inner.peers.read().keys().copied().collect();
        for key in keys {
            self.remove_peer(&key);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// Append an allowed-IP prefix to a peer, stealing the exact prefix
    /// from any previous owner.
    pub fn add_allowed_ip(&self, peer: &Arc<Peer>, prefix: IpAddr, bits: u8) {
        let mut routes = self.inner.routes.write();
        if let Some(previous) = routes.remove_exact(prefix, bits) {
            if !Arc::ptr_eq(&previous, peer) {
                previous
                    .lock()
                    .allowed_ips
                    .retain(|(p, b)| !(*p == prefix && *b == bits));
            }
        }
        routes.insert(prefix, bits, peer.clone());
        drop(routes);

        let mut g = peer.lock();
        if !g.allowed_ips.contains(&(prefix, bits)) {
            g.allowed_ips.push((prefix, bits));
        }
    }

    /// Drop all of a peer's allowed-IPs (UAPI `replace_allowed_ips`).
    pub fn clear_allowed_ips(&self, peer: &Arc<Peer>) {
        self.inner
            .routes
            .write()
            .remove_matching(&|p: &Arc<Peer>| Arc::ptr_eq(p, peer));
        peer.lock().allowed_ips.clear();
    }

    /// Route an inner address to its owning peer, if any.
    pub fn lookup_route(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.inner.routes.read().lookup(addr)
    }

    /// Trigger a handshake by user request.
    pub async fn trigger_handshake(&self, peer: &Arc<Peer>) {
        self.inner.initiate_handshake(peer, true).await;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

impl DeviceInner {
    fn is_up(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_UP
    }

    fn current_bind(&self) -> Option<Arc<UdpBind>> {
        self.bind.read().clone()
    }

    fn current_identity(&self) -> Option<Arc<StaticIdentity>> {
        self.identity.read().clone()
    }

    async fn open_bind(self: &Arc<Self>) -> Result<()> {
        let port = *self.listen_port.lock();
        let fwmark = *self.fwmark.lock();
        let bind = Arc::new(UdpBind::open(port, fwmark).await?);

        let mut run_tasks = self.run_tasks.lock();
        for socket in bind.sockets() {
            run_tasks.push(tokio::spawn(udp_receive_loop(self.clone(), socket)));
        }
        drop(run_tasks);
        *self.bind.write() = Some(bind);
        Ok(())
    }

    fn close_bind(&self) {
        for task in self.run_tasks.lock().drain(..) {
            task.abort();
        }
        *self.bind.write() = None;
    }

    /// Route one frame from the TUN: trie lookup, then encrypt or stage.
    async fn handle_outbound_frame(self: &Arc<Self>, frame: Vec<u8>) {
        let Some(dst) = ip::destination(&frame) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(peer) = self.routes.read().lookup(dst) else {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("no route to {}", dst);
            return;
        };

        let keypair = peer.lock().keypairs.current_sendable();
        match keypair {
            Some(kp) => {
                self.dispatch_encrypt(&peer, kp.clone(), frame);
                if kp.wants_rekey() {
                    self.initiate_handshake(&peer, false).await;
                }
            }
            None => {
                let start_handshake = {
                    let mut g = peer.lock();
                    g.stage(frame, &peer.counters);
                    !g.handshake.is_initiating()
                };
                if start_handshake {
                    self.initiate_handshake(&peer, false).await;
                }
                // A handshake may have completed between the keypair check
                // and staging; drain rather than strand the frame.
                self.flush_staged(&peer);
            }
        }
    }

    /// Hand a frame to the encryption pool under `kp`, preserving order
    /// through the peer's sequence space.
    fn dispatch_encrypt(&self, peer: &Arc<Peer>, kp: Arc<Keypair>, frame: Vec<u8>) {
        let seq = peer.next_outbound_seq();
        let accepted = self.encrypt_pool.dispatch(EncryptJob {
            keypair: kp,
            seq,
            frame,
            done: peer.tx_sink(),
        });
        if !accepted {
            self.counters.pipeline_drops.fetch_add(1, Ordering::Relaxed);
            // Release the sequence slot so the sink does not wait for it.
            let _ = peer.tx_sink().try_send(OutboundResult {
                seq,
                datagram: None,
            });
        }
    }

    /// Encrypt-and-send an empty payload (keepalive) under the current
    /// keypair, if one exists.
    fn send_keepalive(&self, peer: &Arc<Peer>) {
        let Some(kp) = peer.lock().keypairs.current_sendable() else {
            return;
        };
        self.dispatch_encrypt(peer, kp, Vec::new());
    }

    /// Push staged frames through a (newly usable) keypair.
    fn flush_staged(&self, peer: &Arc<Peer>) {
        let (kp, frames) = {
            let mut g = peer.lock();
            match g.keypairs.current_sendable() {
                Some(kp) if !g.staged.is_empty() => (kp, g.unstage_all()),
                _ => return,
            }
        };
        for frame in frames {
            self.dispatch_encrypt(peer, kp.clone(), frame);
        }
    }

    /// Begin (or retry) a handshake toward a peer. Paced to one
    /// initiation per `REKEY_TIMEOUT` unless `force`.
    async fn initiate_handshake(self: &Arc<Self>, peer: &Arc<Peer>, force: bool) {
        let Some(identity) = self.current_identity() else {
            return;
        };

        let (bytes, endpoint) = {
            let mut g = peer.lock();
            if !force {
                let recently = g
                    .handshake
                    .last_initiation_sent
                    .map(|at| at.elapsed() < timers::REKEY_TIMEOUT)
                    .unwrap_or(false);
                if g.handshake.is_initiating() && recently {
                    return;
                }
            }
            let Some(endpoint) = g.endpoint else {
                tracing::trace!("handshake wanted but peer has no endpoint");
                return;
            };

            if let Some(stale) = g.handshake.local_index() {
                self.index.remove(stale);
            }
            let local_index = self.index.assign(IndexPurpose::Handshake, peer.clone());
            let msg = match g.handshake.create_initiation(&identity, local_index) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("failed to create initiation: {}", e);
                    self.index.remove(local_index);
                    return;
                }
            };
            let mut bytes = msg.to_bytes().to_vec();
            let mac1_key = noise::mac1_key(&peer.public_key);
            g.cookie.sign_macs(
                &mac1_key,
                &mut bytes,
                Initiation::MAC1_OFFSET,
                Initiation::MAC2_OFFSET,
            );
            g.timers.on_handshake_initiated();
            (bytes, endpoint)
        };

        if let Some(bind) = self.current_bind() {
            if let Err(e) = bind.send_to(&bytes, endpoint).await {
                tracing::debug!("initiation send failed: {}", e);
            } else {
                tracing::debug!("sent handshake initiation to {}", endpoint);
            }
        }
    }

    /// Transport fast path: resolve the receiver index and queue the
    /// datagram for a decryption worker.
    fn handle_transport(&self, datagram: &[u8], src: SocketAddr) {
        let Ok(header) = TransportHeader::from_bytes(datagram) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some((purpose, peer)) = self.index.get(header.receiver_index) else {
            self.counters.unknown_index.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if purpose != IndexPurpose::Keypair {
            self.counters.unknown_index.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(kp) = peer.lock().keypairs.find_by_index(header.receiver_index) else {
            self.counters.unknown_index.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let seq = peer.next_inbound_seq();
        let accepted = self.decrypt_pool.dispatch(DecryptJob {
            keypair: kp.clone(),
            seq,
            datagram: datagram.to_vec(),
            src,
            done: peer.rx_sink(),
        });
        if !accepted {
            self.counters.pipeline_drops.fetch_add(1, Ordering::Relaxed);
            let _ = peer.rx_sink().try_send(InboundResult {
                seq,
                src,
                keypair: kp,
                outcome: Err(InboundDrop::QueueFull),
            });
        }
    }

    /// Slow path: initiations, responses, and cookie replies.
    async fn handle_handshake_datagram(self: &Arc<Self>, datagram: Vec<u8>, src: SocketAddr) {
        match message_type(&datagram) {
            Ok(MessageType::Initiation) => self.handle_initiation(&datagram, src).await,
            Ok(MessageType::Response) => self.handle_response(&datagram, src).await,
            Ok(MessageType::CookieReply) => self.handle_cookie_reply(&datagram),
            _ => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Shared mac1 + under-load cookie gate for initiations/responses.
    /// Returns false when the message must not be processed further.
    async fn handshake_gate(
        self: &Arc<Self>,
        identity: &StaticIdentity,
        datagram: &[u8],
        src: SocketAddr,
        mac1_offset: usize,
        mac2_offset: usize,
        sender_index: u32,
    ) -> bool {
        if !cookie::verify_mac1(&identity.mac1_key, datagram, mac1_offset) {
            self.counters.handshake_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if !self.limiter.under_load() {
            return true;
        }
        if self
            .cookies
            .lock()
            .verify_mac2(datagram, mac2_offset, &src)
        {
            return true;
        }

        // Under load and no proof of reachability: answer with a cookie
        // (paced) instead of spending DH time.
        if self.limiter.allow_cookie_reply(src.ip()) {
            let mac1: [u8; 16] = datagram[mac1_offset..mac1_offset + 16]
                .try_into()
                .expect("mac1 range checked");
            let reply = self
                .cookies
                .lock()
                .build_reply(&identity.cookie_key, sender_index, &mac1, &src);
            if let (Ok(reply), Some(bind)) = (reply, self.current_bind()) {
                let _ = bind.send_to(&reply.to_bytes(), src).await;
            }
        } else {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    async fn handle_initiation(self: &Arc<Self>, datagram: &[u8], src: SocketAddr) {
        let Some(identity) = self.current_identity() else {
            return;
        };
        let Ok(msg) = Initiation::from_bytes(datagram) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !self
            .handshake_gate(
                &identity,
                datagram,
                src,
                Initiation::MAC1_OFFSET,
                Initiation::MAC2_OFFSET,
                msg.sender_index,
            )
            .await
        {
            return;
        }

        let partial = match handshake::consume_initiation(&identity, &msg) {
            Ok(partial) => partial,
            Err(_) => {
                self.counters.handshake_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let Some(peer) = self.peers.read().get(&partial.remote_static).cloned() else {
            self.counters.handshake_drops.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("initiation from unconfigured peer");
            return;
        };

        let ss = peer.lock().handshake.precomputed_ss();
        let consumed = match partial.verify(&ss) {
            Ok(consumed) => consumed,
            Err(_) => {
                self.counters.handshake_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let response_bytes = {
            let mut g = peer.lock();
            if g.handshake.check_and_record_timestamp(consumed.timestamp).is_err() {
                self.counters.handshake_drops.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("initiation replay (stale timestamp)");
                return;
            }

            let local_index = self.index.assign(IndexPurpose::Keypair, peer.clone());
            let (response, keys) =
                match g.handshake.create_response(&identity, &consumed, local_index) {
                    Ok(out) => out,
                    Err(e) => {
                        tracing::debug!("failed to create response: {}", e);
                        self.index.remove(local_index);
                        return;
                    }
                };

            let retired = g.keypairs.install(Arc::new(Keypair::new(keys)));
            self.index.remove_all(retired);

            g.endpoint = Some(src);
            g.last_handshake = Some(SystemTime::now());
            g.timers.on_handshake_complete();
            g.timers.on_authenticated_packet_received();

            let mut bytes = response.to_bytes().to_vec();
            let mac1_key = noise::mac1_key(&peer.public_key);
            g.cookie.sign_macs(
                &mac1_key,
                &mut bytes,
                Response::MAC1_OFFSET,
                Response::MAC2_OFFSET,
            );
            bytes
        };

        if let Some(bind) = self.current_bind() {
            if let Err(e) = bind.send_to(&response_bytes, src).await {
                tracing::debug!("response send failed: {}", e);
            } else {
                tracing::debug!("handshake response sent to {}", src);
            }
        }
    }

    async fn handle_response(self: &Arc<Self>, datagram: &[u8], src: SocketAddr) {
        let Some(identity) = self.current_identity() else {
            return;
        };
        let Ok(msg) = Response::from_bytes(datagram) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !self
            .handshake_gate(
                &identity,
                datagram,
                src,
                Response::MAC1_OFFSET,
                Response::MAC2_OFFSET,
                msg.sender_index,
            )
            .await
        {
            return;
        }

        let Some((IndexPurpose::Handshake, peer)) = self.index.get(msg.receiver_index) else {
            self.counters.unknown_index.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let installed = {
            let mut g = peer.lock();
            let keys = match g.handshake.consume_response(&identity, &msg) {
                Ok(keys) => keys,
                Err(_) => {
                    self.counters.handshake_drops.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let retired = g.keypairs.install(Arc::new(Keypair::new(keys)));
            self.index.remove_all(retired);
            self.index.set_purpose(msg.receiver_index, IndexPurpose::Keypair);

            g.endpoint = Some(src);
            g.last_handshake = Some(SystemTime::now());
            g.timers.on_handshake_complete();
            g.timers.on_authenticated_packet_received();
            !g.staged.is_empty()
        };
        tracing::debug!("handshake completed as initiator with {}", src);

        // Confirm the session: the responder cannot send until it has
        // received one transport message under the new keys.
        if installed {
            self.flush_staged(&peer);
        } else {
            self.send_keepalive(&peer);
        }
    }

    fn handle_cookie_reply(&self, datagram: &[u8]) {
        let Ok(msg) = CookieReply::from_bytes(datagram) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some((_, peer)) = self.index.get(msg.receiver_index) else {
            self.counters.unknown_index.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let cookie_key = noise::cookie_key(&peer.public_key);
        let mut g = peer.lock();
        if g.cookie.consume_reply(&msg, &cookie_key).is_ok() {
            tracing::debug!("cached cookie from peer");
        } else {
            self.counters.handshake_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Timer sweep actions for one peer.
    async fn run_timer_events(self: &Arc<Self>, peer: &Arc<Peer>, events: Vec<TimerEvent>) {
        for event in events {
            match event {
                TimerEvent::RetransmitHandshake => {
                    tracing::debug!("handshake retransmit");
                    self.initiate_handshake(peer, true).await;
                }
                TimerEvent::AbandonHandshake => {
                    tracing::debug!("handshake attempt abandoned");
                    let mut g = peer.lock();
                    if let Some(idx) = g.handshake.local_index() {
                        self.index.remove(idx);
                    }
                    g.handshake.clear();
                    g.staged.clear();
                }
                TimerEvent::SendKeepalive | TimerEvent::PersistentKeepalive => {
                    self.send_keepalive(peer);
                }
                TimerEvent::NewHandshake => {
                    self.initiate_handshake(peer, false).await;
                }
                TimerEvent::ZeroKeys => {
                    tracing::debug!("zeroing keys after long idle");
                    let mut g = peer.lock();
                    let retired = g.keypairs.clear();
                    self.index.remove_all(retired);
                    if let Some(idx) = g.handshake.local_index() {
                        self.index.remove(idx);
                    }
                    g.handshake.clear();
                }
            }
        }
    }
}

/// Frames leaving through the TUN reader.
async fn tun_reader_loop(inner: Arc<DeviceInner>, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if !inner.is_up() {
            continue;
        }
        inner.handle_outbound_frame(frame).await;
    }
}

/// One receive loop per bound socket.
async fn udp_receive_loop(inner: Arc<DeviceInner>, socket: Arc<tokio::net::UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(ok) => ok,
            Err(e) => {
                // Transient per-datagram errors (e.g. connection-refused
                // surfaced by a previous send) do not end the loop.
                tracing::debug!("udp receive failed: {}", e);
                continue;
            }
        };
        let datagram = &buf[..len];
        match message_type(datagram) {
            Ok(MessageType::Transport) => inner.handle_transport(datagram, src),
            Ok(_) => {
                if inner
                    .handshake_tx
                    .try_send((datagram.to_vec(), src))
                    .is_err()
                {
                    inner.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The handshake slow path.
async fn handshake_loop(
    inner: Arc<DeviceInner>,
    mut rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
) {
    while let Some((datagram, src)) = rx.recv().await {
        inner.handle_handshake_datagram(datagram, src).await;
    }
}

/// Periodic sweep of peer deadlines and rekey conditions.
async fn timer_loop(inner: Arc<DeviceInner>) {
    let mut tick = tokio::time::interval(TIMER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        if !inner.is_up() {
            continue;
        }
        let now = Instant::now();
        let peers: Vec<_> = inner.peers.read().values().cloned().collect();
        for peer in peers {
            let (events, wants_rekey) = {
                let mut g = peer.lock();
                let events = g.timers.fire(now);
                let wants_rekey = g
                    .keypairs
                    .current()
                    .map(|kp| kp.wants_rekey())
                    .unwrap_or(false)
                    && !g.handshake.is_initiating();
                (events, wants_rekey)
            };
            inner.run_timer_events(&peer, events).await;
            if wants_rekey {
                inner.initiate_handshake(&peer, false).await;
            }
        }
    }
}

/// Ordered transmit: release encrypted datagrams in sequence order.
async fn peer_tx_loop(
    inner: Arc<DeviceInner>,
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<OutboundResult>,
) {
    let mut queue = SequencedQueue::new();
    while let Some(result) = rx.recv().await {
        for datagram in queue.push(result.seq, result.datagram) {
            let Some(datagram) = datagram else { continue };
            let Some(endpoint) = peer.endpoint() else {
                continue;
            };
            let Some(bind) = inner.current_bind() else {
                continue;
            };
            if bind.send_to(&datagram, endpoint).await.is_ok() {
                peer.counters
                    .tx_bytes
                    .fetch_add(datagram.len() as u64, Ordering::Relaxed);
                let is_keepalive = datagram.len() == TRANSPORT_OVERHEAD;
                let mut g = peer.lock();
                g.timers.on_any_packet_sent();
                if !is_keepalive {
                    g.timers.on_data_sent();
                }
            }
        }
    }
}

/// Ordered receive: endpoint roaming, keypair promotion, reverse-path
/// check, then delivery to the TUN.
async fn peer_rx_loop(
    inner: Arc<DeviceInner>,
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<InboundResult>,
) {
    let mut queue = SequencedQueue::new();
    while let Some(result) = rx.recv().await {
        for item in queue.push(result.seq, result) {
            let (counter, padded) = match item.outcome {
                Ok(ok) => ok,
                Err(InboundDrop::AuthFailure) => {
                    peer.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(InboundDrop::Replay) => {
                    peer.counters.replay_drops.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(InboundDrop::Expired) | Err(InboundDrop::QueueFull) => {
                    inner.counters.pipeline_drops.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let _ = counter;

            {
                let mut g = peer.lock();
                // Decryption succeeded: this endpoint is authenticated.
                if g.endpoint != Some(item.src) {
                    tracing::debug!("peer endpoint roamed to {}", item.src);
                    g.endpoint = Some(item.src);
                }
                let retired = g.keypairs.promote(item.keypair.local_index);
                inner.index.remove_all(retired);
                g.timers.on_authenticated_packet_received();
                if !padded.is_empty() {
                    g.timers.on_data_received();
                }
            }
            peer.counters
                .rx_bytes
                .fetch_add((padded.len() + TRANSPORT_OVERHEAD) as u64, Ordering::Relaxed);

            // A promotion may have made the staging queue sendable.
            inner.flush_staged(&peer);

            if padded.is_empty() {
                tracing::trace!("keepalive received");
                continue;
            }

            let Some(src_ip) = ip::source(&padded) else {
                inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let routed = inner.routes.read().lookup(src_ip);
            if !routed.map(|p| Arc::ptr_eq(&p, &peer)).unwrap_or(false) {
                inner
                    .counters
                    .reverse_path_drops
                    .fetch_add(1, Ordering::Relaxed);
                tracing::trace!("reverse-path check failed for {}", src_ip);
                continue;
            }

            let Some(len) = ip::total_len(&padded).filter(|l| *l <= padded.len()) else {
                inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let mut frame = padded;
            frame.truncate(len);
            let _ = inner.tun_writer.try_send(frame);
        }
    }
}
