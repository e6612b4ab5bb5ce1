//! `.conf` file parser
//!
//! Parses the conventional tunnel configuration format:
//!
//! ```text
//! [Interface]
//! PrivateKey = <base64>
//! Address = 10.0.0.2/24
//! ListenPort = 51820
//!
//! [Peer]
//! PublicKey = <base64>
//! AllowedIPs = 10.0.0.0/24
//! Endpoint = 192.0.2.1:51820
//! PersistentKeepalive = 25
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::{IpNet, Ipv4Net};

use crate::device::Device;
use crate::error::{ConfigError, Result};

/// A parsed configuration file.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

/// `[Interface]` section.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: [u8; 32],
    /// Interface addresses; the first one configures the TUN.
    pub address: Vec<Ipv4Net>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub mtu: Option<u16>,
}

/// `[Peer]` section.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

enum Section {
    Interface,
    Peer,
}

impl TunnelConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> std::result::Result<Self, ConfigError> {
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers = Vec::new();
        let mut section = None;
        let mut pending: Option<PeerBuilder> = None;

        for (n, raw) in content.lines().enumerate() {
            let line_num = n + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = pending.take() {
                    peers.push(peer.build()?);
                }
                section = Some(Section::Interface);
                continue;
            }
            if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = pending.take() {
                    peers.push(peer.build()?);
                }
                section = Some(Section::Peer);
                pending = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("expected 'key = value', got: {}", line),
                });
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(|| InterfaceConfig {
                        private_key: [0u8; 32],
                        address: Vec::new(),
                        listen_port: None,
                        fwmark: None,
                        mtu: None,
                    });
                    match key.as_str() {
                        "privatekey" => iface.private_key = parse_key(value, "PrivateKey")?,
                        "address" => {
                            for part in value.split(',') {
                                let part = part.trim();
                                if part.is_empty() {
                                    continue;
                                }
                                let net: IpNet =
                                    part.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: part.to_string(),
                                    })?;
                                if let IpNet::V4(v4) = net {
                                    iface.address.push(v4);
                                }
                            }
                        }
                        "listenport" => {
                            iface.listen_port =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("invalid ListenPort: {}", value),
                                })?);
                        }
                        "fwmark" => {
                            iface.fwmark =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("invalid FwMark: {}", value),
                                })?);
                        }
                        "mtu" => {
                            iface.mtu =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("invalid MTU: {}", value),
                                })?);
                        }
                        _ => {
                            tracing::debug!("ignoring interface key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = pending.as_mut().expect("peer section has a builder");
                    match key.as_str() {
                        "publickey" => peer.public_key = Some(parse_key(value, "PublicKey")?),
                        "presharedkey" => {
                            peer.preshared_key = Some(parse_key(value, "PresharedKey")?)
                        }
                        "endpoint" => {
                            peer.endpoint =
                                Some(value.parse().map_err(|_| ConfigError::InvalidAddress {
                                    value: value.to_string(),
                                })?)
                        }
                        "allowedips" => {
                            for part in value.split(',') {
                                let part = part.trim();
                                if part.is_empty() {
                                    continue;
                                }
                                peer.allowed_ips.push(part.parse().map_err(|_| {
                                    ConfigError::InvalidCidr {
                                        value: part.to_string(),
                                    }
                                })?);
                            }
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("invalid PersistentKeepalive: {}", value),
                                })?);
                        }
                        _ => {
                            tracing::debug!("ignoring peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = pending.take() {
            peers.push(peer.build()?);
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".to_string(),
        })?;
        if interface.private_key == [0u8; 32] {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }

        Ok(Self { interface, peers })
    }

    /// Public key of the configured identity.
    pub fn public_key(&self) -> [u8; 32] {
        crate::crypto::x25519::public_key(&self.interface.private_key)
    }

    /// Apply the whole configuration to a device, the same way a `set`
    /// transaction would.
    pub async fn apply(&self, device: &Device) -> Result<()> {
        device.set_private_key(self.interface.private_key);
        if let Some(port) = self.interface.listen_port {
            device.set_listen_port(port).await?;
        }
        if let Some(mark) = self.interface.fwmark {
            device.set_fwmark(mark);
        }
        for peer_config in &self.peers {
            let peer = device.ensure_peer(peer_config.public_key);
            {
                let mut g = peer.lock();
                g.handshake.set_psk(peer_config.preshared_key);
                if let Some(endpoint) = peer_config.endpoint {
                    g.endpoint = Some(endpoint);
                }
                if let Some(secs) = peer_config.persistent_keepalive {
                    g.timers.set_persistent_keepalive(secs);
                }
            }
            for net in &peer_config.allowed_ips {
                let (addr, bits): (IpAddr, u8) = (net.addr(), net.prefix_len());
                device.add_allowed_ip(&peer, addr, bits);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn build(self) -> std::result::Result<PeerConfig, ConfigError> {
        Ok(PeerConfig {
            public_key: self.public_key.ok_or(ConfigError::MissingField {
                field: "PublicKey in [Peer]".to_string(),
            })?,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

fn parse_key(value: &str, field: &str) -> std::result::Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Address = 10.0.0.2/24
ListenPort = 51820

[Peer]
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
AllowedIPs = 10.0.0.0/24, 192.168.4.0/24
Endpoint = 192.0.2.151:51820
PersistentKeepalive = 25
"#;

    #[test]
    fn parses_interface_and_peer() {
        let config = TunnelConfig::parse(TEST_CONFIG).unwrap();
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.address[0].to_string(), "10.0.0.2/24");
        assert_eq!(config.peers.len(), 1);

        let peer = &config.peers[0];
        assert_eq!(peer.endpoint.unwrap().to_string(), "192.0.2.151:51820");
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert_eq!(peer.allowed_ips.len(), 2);
    }

    #[test]
    fn missing_private_key_is_an_error() {
        assert!(TunnelConfig::parse("[Interface]\nAddress = 10.0.0.2/24\n").is_err());
    }

    #[test]
    fn missing_interface_is_an_error() {
        let config = "[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n";
        assert!(TunnelConfig::parse(config).is_err());
    }

    #[test]
    fn bad_base64_is_an_error() {
        let config = "[Interface]\nPrivateKey = not-base64!\n";
        assert!(TunnelConfig::parse(config).is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let config = "# leading comment\n\n[Interface]\n# inner\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n";
        let parsed = TunnelConfig::parse(config).unwrap();
        assert!(parsed.peers.is_empty());
    }

    #[tokio::test]
    async fn apply_populates_a_device() {
        let (tun, _handle) = crate::tun::Tun::memory(1420);
        let device = Device::new(tun, crate::device::DeviceConfig::default());
        let config = TunnelConfig::parse(TEST_CONFIG).unwrap();
        config.apply(&device).await.unwrap();

        assert_eq!(device.public_key(), Some(config.public_key()));
        assert_eq!(device.peer_count(), 1);
        assert!(device.lookup_route("192.168.4.9".parse().unwrap()).is_some());
    }
}
