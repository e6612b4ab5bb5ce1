//! TUN device seam
//!
//! The device core consumes IP frames over a channel pair, so the
//! platform interface is just a pump on the other end. `Tun::native`
//! attaches a real interface via tun-rs; `Tun::memory` returns an
//! in-process pair used by tests and embedding programs.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;

/// Frames buffered in each direction before drops.
const FRAME_QUEUE: usize = 1024;

/// Default interface MTU.
pub const DEFAULT_MTU: u16 = 1420;

pub struct Tun {
    /// Frames read from the interface, taken once by the device.
    reader: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    /// Frames to write out the interface.
    writer: mpsc::Sender<Vec<u8>>,
    mtu: u16,
    name: String,
}

/// The far end of a memory TUN: inject frames as if the OS routed them
/// into the interface, and collect what the device delivers.
pub struct MemoryTunHandle {
    pub inject: mpsc::Sender<Vec<u8>>,
    pub delivered: mpsc::Receiver<Vec<u8>>,
}

impl Tun {
    /// An in-memory interface.
    pub fn memory(mtu: u16) -> (Self, MemoryTunHandle) {
        let (inject_tx, inject_rx) = mpsc::channel(FRAME_QUEUE);
        let (deliver_tx, deliver_rx) = mpsc::channel(FRAME_QUEUE);
        (
            Self {
                reader: Mutex::new(Some(inject_rx)),
                writer: deliver_tx,
                mtu,
                name: "memtun".to_string(),
            },
            MemoryTunHandle {
                inject: inject_tx,
                delivered: deliver_rx,
            },
        )
    }

    /// A real TUN interface with pump tasks attached.
    #[cfg(unix)]
    pub fn native(address: std::net::Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self> {
        use crate::error::TunnelError;

        check_privileges();

        let device = tun_rs::DeviceBuilder::new()
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;
        let name = device
            .name()
            .map_err(|e| TunnelError::CreateFailed {
                reason: format!("failed to get device name: {}", e),
            })?;
        tracing::info!("created TUN device {} ({}/{})", name, address, prefix_len);

        let device = std::sync::Arc::new(device);
        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE);
        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE);

        let reader_dev = device.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; usize::from(mtu) + 64];
            loop {
                match reader_dev.recv(&mut buf).await {
                    Ok(len) => {
                        if read_tx.send(buf[..len].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("TUN read failed: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if let Err(e) = device.send(&frame).await {
                    tracing::warn!("TUN write failed: {}", e);
                }
            }
        });

        Ok(Self {
            reader: Mutex::new(Some(read_rx)),
            writer: write_tx,
            mtu,
            name,
        })
    }

    /// Take the outbound frame stream. Yields once; the device owns it.
    pub fn take_reader(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.reader.lock().take()
    }

    /// Sender for frames headed out the interface.
    pub fn writer(&self) -> mpsc::Sender<Vec<u8>> {
        self.writer.clone()
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(unix)]
fn check_privileges() {
    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("running without root; TUN creation may fail");
        #[cfg(target_os = "linux")]
        tracing::warn!("either run as root or grant CAP_NET_ADMIN: sudo setcap cap_net_admin=eip ferrotun");
    }
}
