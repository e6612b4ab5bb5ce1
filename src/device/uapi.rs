//! Textual control protocol
//!
//! Line-oriented `key=value` requests over a stream transport, terminated
//! by an empty line. `get=1` dumps device and peer state; `set=1` applies
//! a configuration transaction. Keys are applied in order and the first
//! failing line aborts the remainder, reported as `errno=N`.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::device::peer::Peer;
use crate::device::Device;
use crate::error::{ConfigError, FerrotunError, Result};

/// Apply a full request (without the trailing empty line) and render the
/// response, including the final `errno=` line.
pub async fn handle_request(device: &Device, request: &str) -> String {
    let mut lines = request.lines();
    match lines.next() {
        Some("get=1") => {
            let mut out = render_get(device);
            out.push_str("errno=0\n\n");
            out
        }
        Some("set=1") => match apply_set(device, lines).await {
            Ok(()) => "errno=0\n\n".to_string(),
            Err(e) => {
                tracing::debug!("set transaction failed: {}", e);
                format!("errno={}\n\n", e.errno())
            }
        },
        _ => format!(
            "errno={}\n\n",
            FerrotunError::Config(ConfigError::ParseError {
                line: 1,
                message: "expected get=1 or set=1".into(),
            })
            .errno()
        ),
    }
}

fn render_get(device: &Device) -> String {
    let mut out = String::new();

    if let Some(key) = device.private_key() {
        out.push_str(&format!("private_key={}\n", hex::encode(key)));
    }
    out.push_str(&format!("listen_port={}\n", device.listen_port()));
    if device.fwmark() != 0 {
        out.push_str(&format!("fwmark={}\n", device.fwmark()));
    }

    for peer in device.peers() {
        out.push_str(&format!("public_key={}\n", hex::encode(peer.public_key)));
        let g = peer.lock();
        if let Some(psk) = g.handshake.psk() {
            out.push_str(&format!("preshared_key={}\n", hex::encode(psk)));
        }
        if let Some(endpoint) = g.endpoint {
            out.push_str(&format!("endpoint={}\n", endpoint));
        }
        out.push_str(&format!(
            "persistent_keepalive_interval={}\n",
            g.timers.persistent_keepalive()
        ));
        for (prefix, bits) in &g.allowed_ips {
            out.push_str(&format!("allowed_ip={}/{}\n", prefix, bits));
        }
        if let Some(at) = g.last_handshake {
            if let Ok(since) = at.duration_since(UNIX_EPOCH) {
                out.push_str(&format!("last_handshake_time_sec={}\n", since.as_secs()));
                out.push_str(&format!(
                    "last_handshake_time_nsec={}\n",
                    since.subsec_nanos()
                ));
            }
        }
        out.push_str(&format!("protocol_version={}\n", g.protocol_version));
        drop(g);
        out.push_str(&format!(
            "rx_bytes={}\n",
            peer.counters
                .rx_bytes
                .load(std::sync::atomic::Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "tx_bytes={}\n",
            peer.counters
                .tx_bytes
                .load(std::sync::atomic::Ordering::Relaxed)
        ));
    }
    out
}

/// Peer block state while applying a `set`.
struct PeerBlock {
    peer: Option<Arc<Peer>>,
    /// `update_only` referenced an unknown peer: silently skip the block.
    skipping: bool,
    /// The `public_key` line created this peer within this transaction.
    created_now: bool,
}

async fn apply_set(device: &Device, lines: std::str::Lines<'_>) -> Result<()> {
    let mut block = PeerBlock {
        peer: None,
        skipping: false,
        created_now: false,
    };

    for (n, line) in lines.enumerate() {
        if line.is_empty() {
            break;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| parse_error(n, line))?;

        match key {
            // Device-level keys.
            "private_key" => {
                device.set_private_key(parse_key(value)?);
            }
            "listen_port" => {
                let port: u16 = value.parse().map_err(|_| invalid(value))?;
                device.set_listen_port(port).await?;
            }
            "fwmark" => {
                let mark: u32 = value.parse().map_err(|_| invalid(value))?;
                device.set_fwmark(mark);
            }
            "replace_peers" => {
                if value != "true" {
                    return Err(invalid(value));
                }
                device.clear_peers();
            }

            // A public_key line opens a new peer block.
            "public_key" => {
                let public_key = parse_key(value)?;
                let created_now = device.get_peer(&public_key).is_none();
                block = PeerBlock {
                    peer: Some(device.ensure_peer(public_key)),
                    skipping: false,
                    created_now,
                };
            }

            // Peer-level keys.
            "remove" => {
                if value != "true" {
                    return Err(invalid(value));
                }
                if let Some(peer) = block.peer.take() {
                    device.remove_peer(&peer.public_key);
                }
                block.skipping = true;
            }
            "update_only" => {
                if value != "true" {
                    return Err(invalid(value));
                }
                if block.created_now {
                    if let Some(peer) = block.peer.take() {
                        device.remove_peer(&peer.public_key);
                    }
                    block.skipping = true;
                }
            }
            "preshared_key" => {
                if let Some(peer) = current_peer(&block)? {
                    let psk = if value.is_empty() {
                        None
                    } else {
                        Some(parse_key(value)?)
                    };
                    peer.lock().handshake.set_psk(psk);
                }
            }
            "endpoint" => {
                if let Some(peer) = current_peer(&block)? {
                    let endpoint: SocketAddr = value.parse().map_err(|_| invalid(value))?;
                    peer.lock().endpoint = Some(endpoint);
                }
            }
            "persistent_keepalive_interval" => {
                if let Some(peer) = current_peer(&block)? {
                    let secs: u16 = value.parse().map_err(|_| invalid(value))?;
                    peer.lock().timers.set_persistent_keepalive(secs);
                }
            }
            "replace_allowed_ips" => {
                if value != "true" {
                    return Err(invalid(value));
                }
                if let Some(peer) = current_peer(&block)? {
                    device.clear_allowed_ips(&peer);
                }
            }
            "allowed_ip" => {
                if let Some(peer) = current_peer(&block)? {
                    let (prefix, bits) = parse_cidr(value)?;
                    device.add_allowed_ip(&peer, prefix, bits);
                }
            }
            "protocol_version" => {
                if value != "1" {
                    return Err(invalid(value));
                }
                if let Some(peer) = current_peer(&block)? {
                    peer.lock().protocol_version = 1;
                }
            }

            other => {
                return Err(FerrotunError::Config(ConfigError::ParseError {
                    line: n + 2,
                    message: format!("unknown key: {}", other),
                }));
            }
        }
    }
    Ok(())
}

/// The peer of the current block, `None` while skipping, error when a
/// peer-level key appears with no block open.
fn current_peer(block: &PeerBlock) -> Result<Option<Arc<Peer>>> {
    if block.skipping {
        return Ok(None);
    }
    block
        .peer
        .clone()
        .map(Some)
        .ok_or_else(|| crate::error::ProtocolError::UnknownPeer.into())
}

fn parse_error(n: usize, line: &str) -> FerrotunError {
    FerrotunError::Config(ConfigError::ParseError {
        line: n + 2,
        message: format!("expected key=value, got: {}", line),
    })
}

fn invalid(value: &str) -> FerrotunError {
    FerrotunError::Config(ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}

fn parse_key(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value).map_err(|_| {
        FerrotunError::Config(ConfigError::InvalidKey {
            field: "key".into(),
        })
    })?;
    bytes.try_into().map_err(|_| {
        FerrotunError::Config(ConfigError::InvalidKey {
            field: "key".into(),
        })
    })
}

fn parse_cidr(value: &str) -> Result<(IpAddr, u8)> {
    let net: ipnet::IpNet = value.parse().map_err(|_| {
        FerrotunError::Config(ConfigError::InvalidCidr {
            value: value.to_string(),
        })
    })?;
    Ok((net.addr(), net.prefix_len()))
}

/// Serve the protocol on a UNIX socket. One line-buffered request per
/// read; responses end with the blank line the protocol requires.
#[cfg(unix)]
pub async fn serve(device: Arc<Device>, socket_path: &Path) -> Result<()> {
    use tokio::net::UnixListener;

    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(FerrotunError::System)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(FerrotunError::System)?;
    }
    let listener = UnixListener::bind(socket_path).map_err(FerrotunError::System)?;
    tracing::info!("control socket at {}", socket_path.display());

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!("control accept failed: {}", e);
                continue;
            }
        };
        let device = device.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut request = String::new();
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if line == "\n" {
                            let response = handle_request(&device, &request).await;
                            if writer.write_all(response.as_bytes()).await.is_err() {
                                break;
                            }
                            request.clear();
                        } else {
                            request.push_str(&line);
                        }
                    }
                    Err(e) => {
                        tracing::debug!("control read failed: {}", e);
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::tun::Tun;

    fn test_device() -> Device {
        let (tun, _handle) = Tun::memory(1420);
        Device::new(tun, DeviceConfig::default())
    }

    const KEY_A: &str = "603e3a60d7c5d77a005f82b224f89f2527ab4b14d93aaa3ec4c884d95f00d641";
    const PEER_B: &str = "f928d4f6c1b86c12f2562c10b734c872512a1c03f6a2ba15d12ce8e22138bf7c";

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let device = test_device();
        let set = format!(
            "set=1\nprivate_key={}\nlisten_port=0\npublic_key={}\nendpoint=192.0.2.7:51820\n\
             persistent_keepalive_interval=25\nallowed_ip=192.168.4.28/32\nallowed_ip=10.0.0.0/8\n",
            KEY_A, PEER_B
        );
        let response = handle_request(&device, &set).await;
        assert_eq!(response, "errno=0\n\n");

        let get = handle_request(&device, "get=1").await;
        assert!(get.contains(&format!("private_key={}", KEY_A)));
        assert!(get.contains(&format!("public_key={}", PEER_B)));
        assert!(get.contains("endpoint=192.0.2.7:51820"));
        assert!(get.contains("persistent_keepalive_interval=25"));
        assert!(get.contains("allowed_ip=192.168.4.28/32"));
        assert!(get.contains("allowed_ip=10.0.0.0/8"));
        assert!(get.contains("protocol_version=1"));
        assert!(get.ends_with("errno=0\n\n"));
    }

    #[tokio::test]
    async fn invalid_key_reports_einval() {
        let device = test_device();
        let response = handle_request(&device, "set=1\nprivate_key=zz\n").await;
        assert_eq!(response, "errno=22\n\n");
    }

    #[tokio::test]
    async fn unknown_key_reports_eproto() {
        let device = test_device();
        let response = handle_request(&device, "set=1\nbogus_key=1\n").await;
        assert_eq!(response, "errno=71\n\n");
    }

    #[tokio::test]
    async fn peer_key_without_block_is_rejected() {
        let device = test_device();
        let response = handle_request(&device, "set=1\nallowed_ip=10.0.0.0/8\n").await;
        assert_eq!(response, "errno=2\n\n");
    }

    #[tokio::test]
    async fn remove_and_replace_peers() {
        let device = test_device();
        let set = format!(
            "set=1\nprivate_key={}\npublic_key={}\nallowed_ip=10.0.0.0/8\n",
            KEY_A, PEER_B
        );
        assert_eq!(handle_request(&device, &set).await, "errno=0\n\n");
        assert_eq!(device.peer_count(), 1);

        let remove = format!("set=1\npublic_key={}\nremove=true\n", PEER_B);
        assert_eq!(handle_request(&device, &remove).await, "errno=0\n\n");
        assert_eq!(device.peer_count(), 0);

        let set = format!("set=1\npublic_key={}\nallowed_ip=10.0.0.0/8\n", PEER_B);
        assert_eq!(handle_request(&device, &set).await, "errno=0\n\n");
        assert_eq!(
            handle_request(&device, "set=1\nreplace_peers=true\n").await,
            "errno=0\n\n"
        );
        assert_eq!(device.peer_count(), 0);
    }

    #[tokio::test]
    async fn update_only_skips_unknown_peer() {
        let device = test_device();
        let set = format!(
            "set=1\npublic_key={}\nupdate_only=true\nallowed_ip=10.0.0.0/8\n",
            PEER_B
        );
        assert_eq!(handle_request(&device, &set).await, "errno=0\n\n");
        assert_eq!(device.peer_count(), 0);
    }

    #[tokio::test]
    async fn replace_allowed_ips_rebuilds_routes() {
        let device = test_device();
        let set = format!(
            "set=1\nprivate_key={}\npublic_key={}\nallowed_ip=10.0.0.0/8\nallowed_ip=10.1.0.0/16\n",
            KEY_A, PEER_B
        );
        assert_eq!(handle_request(&device, &set).await, "errno=0\n\n");
        assert!(device.lookup_route("10.1.2.3".parse().unwrap()).is_some());

        let replace = format!(
            "set=1\npublic_key={}\nreplace_allowed_ips=true\nallowed_ip=172.16.0.0/12\n",
            PEER_B
        );
        assert_eq!(handle_request(&device, &replace).await, "errno=0\n\n");
        assert!(device.lookup_route("10.1.2.3".parse().unwrap()).is_none());
        assert!(device.lookup_route("172.16.5.5".parse().unwrap()).is_some());

        let get = handle_request(&device, "get=1").await;
        assert!(!get.contains("allowed_ip=10.0.0.0/8"));
        assert!(get.contains("allowed_ip=172.16.0.0/12"));
    }

    #[tokio::test]
    async fn preshared_key_set_and_clear() {
        let device = test_device();
        let psk = "9d8f1c6e5b4a39281706f5e4d3c2b1a09d8f1c6e5b4a39281706f5e4d3c2b1a0";
        let set = format!(
            "set=1\nprivate_key={}\npublic_key={}\npreshared_key={}\n",
            KEY_A, PEER_B, psk
        );
        assert_eq!(handle_request(&device, &set).await, "errno=0\n\n");
        assert!(handle_request(&device, "get=1")
            .await
            .contains(&format!("preshared_key={}", psk)));

        let clear = format!("set=1\npublic_key={}\npreshared_key=\n", PEER_B);
        assert_eq!(handle_request(&device, &clear).await, "errno=0\n\n");
        assert!(!handle_request(&device, "get=1").await.contains("preshared_key="));
    }
}
