//! ferrotun - userspace WireGuard tunnel
//!
//! Implements the secure tunnel protocol end to end: the Noise IK
//! handshake, the transport data plane with sliding-window anti-replay,
//! per-peer timers and keypair rotation, allowed-IPs routing, cookie DoS
//! mitigation, and the textual control protocol.
//!
//! # Usage
//!
//! ```no_run
//! use ferrotun::{Device, DeviceConfig, Tun, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> ferrotun::Result<()> {
//!     let tun = Tun::native("10.0.0.2".parse().unwrap(), 24, 1420)?;
//!     let device = Device::new(tun, DeviceConfig::default());
//!
//!     let config = TunnelConfig::from_file("tunnel.conf")?;
//!     config.apply(&device).await?;
//!     device.up().await?;
//!     tokio::signal::ctrl_c().await?;
//!     device.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod net;
pub mod protocol;
pub mod tun;

pub use config::TunnelConfig;
pub use device::uapi;
pub use device::{Device, DeviceConfig};
pub use error::{FerrotunError, Result};
pub use tun::Tun;
