//! Configuration file parsing
//!
//! Standard `[Interface]`/`[Peer]` configuration files with base64 keys,
//! applied to a device through the same path the control protocol uses.

mod parser;

pub use parser::{InterfaceConfig, PeerConfig, TunnelConfig};
