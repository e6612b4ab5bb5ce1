//! Parallel crypto pipeline
//!
//! Bulk AEAD runs on pools of worker tasks fed over sharded channels, the
//! way the rest of the packet plumbing already moves frames. Workers are
//! stateless with respect to ordering: every job carries a per-peer
//! sequence number and every result goes to a per-peer [`SequencedQueue`]
//! sink, which releases strictly in sequence no matter which worker
//! finished first.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::device::keypair::Keypair;
use crate::protocol::messages::padded_len;

/// Per-channel depth; combined with the shard count this bounds in-flight
/// crypto work.
const WORKER_QUEUE_DEPTH: usize = 256;

/// How many out-of-order results a sink holds before skipping a gap.
const REORDER_LIMIT: usize = 512;

/// Restores sequence order at a sink.
///
/// Results arrive tagged with the sequence number assigned at admission;
/// `push` buffers them and returns the run that became contiguous. A gap
/// can only appear if a job was dropped on admission, so when the buffer
/// outgrows `REORDER_LIMIT` the queue skips ahead to the oldest pending
/// entry rather than stalling the peer forever.
pub struct SequencedQueue<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for SequencedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SequencedQueue<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, seq: u64, item: T) -> Vec<T> {
        if seq < self.next {
            // Sequence already released (admission dropped then re-used
            // numbers would be a bug upstream); discard.
            return Vec::new();
        }
        self.pending.insert(seq, item);

        if self.pending.len() > REORDER_LIMIT {
            if let Some((&oldest, _)) = self.pending.iter().next() {
                self.next = oldest;
            }
        }

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Outcome of one encryption job, in the peer's transmit order.
pub struct OutboundResult {
    pub seq: u64,
    /// `None` when the keypair refused the nonce (retired mid-flight).
    pub datagram: Option<Vec<u8>>,
}

/// One frame to encrypt for one peer.
pub struct EncryptJob {
    pub keypair: Arc<Keypair>,
    pub seq: u64,
    pub frame: Vec<u8>,
    pub done: mpsc::Sender<OutboundResult>,
}

/// Outcome of one decryption job, in the peer's receive order.
pub struct InboundResult {
    pub seq: u64,
    pub src: SocketAddr,
    pub keypair: Arc<Keypair>,
    /// `Ok((counter, padded plaintext))`, or the drop reason.
    pub outcome: Result<(u64, Vec<u8>), InboundDrop>,
}

/// Why an inbound datagram was silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDrop {
    AuthFailure,
    Replay,
    Expired,
    QueueFull,
}

/// One transport datagram to decrypt for one peer.
pub struct DecryptJob {
    pub keypair: Arc<Keypair>,
    pub seq: u64,
    pub datagram: Vec<u8>,
    pub src: SocketAddr,
    pub done: mpsc::Sender<InboundResult>,
}

/// Sharded senders feeding a pool of worker tasks.
pub struct WorkerPool<J> {
    shards: Vec<mpsc::Sender<J>>,
    cursor: AtomicUsize,
}

impl<J> WorkerPool<J> {
    /// Hand a job to the pool. `false` means every shard was full and the
    /// job was dropped; the caller counts it.
    pub fn dispatch(&self, job: J) -> bool {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let n = self.shards.len();
        let mut job = job;
        for i in 0..n {
            match self.shards[(start + i) % n].try_send(job) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(j))
                | Err(mpsc::error::TrySendError::Closed(j)) => job = j,
            }
        }
        false
    }
}

/// Number of crypto workers per direction for this host.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 16)
}

/// Spawn the encryption pool: pad, seal, forward in sequence.
pub fn spawn_encrypt_pool(workers: usize) -> (WorkerPool<EncryptJob>, Vec<tokio::task::JoinHandle<()>>) {
    let mut shards = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, mut rx) = mpsc::channel::<EncryptJob>(WORKER_QUEUE_DEPTH);
        shards.push(tx);
        handles.push(tokio::spawn(async move {
            while let Some(mut job) = rx.recv().await {
                job.frame.resize(padded_len(job.frame.len()), 0);
                let datagram = job.keypair.encrypt(&job.frame).ok();
                let _ = job
                    .done
                    .send(OutboundResult {
                        seq: job.seq,
                        datagram,
                    })
                    .await;
            }
        }));
    }
    (
        WorkerPool {
            shards,
            cursor: AtomicUsize::new(0),
        },
        handles,
    )
}

/// Spawn the decryption pool: open, replay-check, forward in sequence.
pub fn spawn_decrypt_pool(workers: usize) -> (WorkerPool<DecryptJob>, Vec<tokio::task::JoinHandle<()>>) {
    let mut shards = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, mut rx) = mpsc::channel::<DecryptJob>(WORKER_QUEUE_DEPTH);
        shards.push(tx);
        handles.push(tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = if !job.keypair.usable_for_receiving() {
                    Err(InboundDrop::Expired)
                } else {
                    job.keypair.decrypt(&job.datagram).map_err(|e| match e {
                        crate::error::FerrotunError::Protocol(
                            crate::error::ProtocolError::ReplayDetected { .. },
                        ) => InboundDrop::Replay,
                        crate::error::FerrotunError::Protocol(
                            crate::error::ProtocolError::SessionExpired,
                        ) => InboundDrop::Expired,
                        _ => InboundDrop::AuthFailure,
                    })
                };
                let _ = job
                    .done
                    .send(InboundResult {
                        seq: job.seq,
                        src: job.src,
                        keypair: job.keypair,
                        outcome,
                    })
                    .await;
            }
        }));
    }
    (
        WorkerPool {
            shards,
            cursor: AtomicUsize::new(0),
        },
        handles,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::SessionKeys;

    #[test]
    fn sequenced_queue_releases_in_order() {
        let mut q = SequencedQueue::new();
        assert!(q.push(1, "b").is_empty());
        assert!(q.push(2, "c").is_empty());
        assert_eq!(q.push(0, "a"), vec!["a", "b", "c"]);
        assert_eq!(q.push(3, "d"), vec!["d"]);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn sequenced_queue_ignores_released_sequences() {
        let mut q = SequencedQueue::new();
        assert_eq!(q.push(0, "a"), vec!["a"]);
        assert!(q.push(0, "dup").is_empty());
        assert_eq!(q.push(1, "b"), vec!["b"]);
    }

    #[test]
    fn sequenced_queue_skips_a_permanent_gap() {
        let mut q = SequencedQueue::new();
        // Sequence 0 never arrives.
        for seq in 1..=(REORDER_LIMIT as u64) {
            assert!(q.push(seq, seq).is_empty());
        }
        let released = q.push(REORDER_LIMIT as u64 + 1, REORDER_LIMIT as u64 + 1);
        assert_eq!(released.first(), Some(&1));
        assert_eq!(released.len(), REORDER_LIMIT + 1);
    }

    fn test_keypair(initiator: bool) -> Arc<Keypair> {
        Arc::new(Keypair::new(SessionKeys {
            send: [1u8; 32],
            recv: [2u8; 32],
            local_index: 10,
            remote_index: 20,
            is_initiator: initiator,
        }))
    }

    #[tokio::test]
    async fn encrypt_pool_pads_and_seals() {
        let (pool, _handles) = spawn_encrypt_pool(2);
        let (done_tx, mut done_rx) = mpsc::channel(8);

        let kp = test_keypair(true);
        for seq in 0..4u64 {
            assert!(pool.dispatch(EncryptJob {
                keypair: kp.clone(),
                seq,
                frame: vec![0xAB; 21],
                done: done_tx.clone(),
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let result = done_rx.recv().await.unwrap();
            let datagram = result.datagram.unwrap();
            // 16B header + 32B padded payload + 16B tag.
            assert_eq!(datagram.len(), 16 + 32 + 16);
            seen.push(result.seq);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn decrypt_pool_reports_auth_failures() {
        let (pool, _handles) = spawn_decrypt_pool(1);
        let (done_tx, mut done_rx) = mpsc::channel(8);

        let kp = test_keypair(false);
        let mut bogus = vec![4u8, 0, 0, 0];
        bogus.extend_from_slice(&10u32.to_le_bytes());
        bogus.extend_from_slice(&0u64.to_le_bytes());
        bogus.extend_from_slice(&[0u8; 16]);

        assert!(pool.dispatch(DecryptJob {
            keypair: kp,
            seq: 0,
            datagram: bogus,
            src: "127.0.0.1:1".parse().unwrap(),
            done: done_tx,
        }));

        let result = done_rx.recv().await.unwrap();
        assert_eq!(result.outcome.unwrap_err(), InboundDrop::AuthFailure);
    }
}
