//! UDP bind abstraction
//!
//! Opens IPv4 and IPv6 sockets on one configured port (0 for ephemeral)
//! and routes outgoing datagrams by the destination family. An endpoint
//! is a plain `SocketAddr`; equality is (family, address, port).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::{NetworkError, Result};

/// Maximum UDP datagram we will receive.
pub const MAX_DATAGRAM: usize = 65535;

pub struct UdpBind {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
    port: u16,
}

impl UdpBind {
    /// Bind both families on `port`. The IPv4 socket is required; IPv6 is
    /// best-effort (it reuses whatever port IPv4 resolved to).
    pub async fn open(port: u16, fwmark: u32) -> Result<Self> {
        let v4_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let v4 = UdpSocket::bind(v4_addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: v4_addr.to_string(),
                reason: e.to_string(),
            })?;
        let bound_port = v4
            .local_addr()
            .map_err(NetworkError::Io)?
            .port();

        let v6_addr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, bound_port, 0, 0));
        let v6 = match UdpSocket::bind(v6_addr).await {
            Ok(sock) => Some(Arc::new(sock)),
            Err(e) => {
                tracing::debug!("IPv6 bind on port {} unavailable: {}", bound_port, e);
                None
            }
        };

        let bind = Self {
            v4: Some(Arc::new(v4)),
            v6,
            port: bound_port,
        };
        if fwmark != 0 {
            bind.set_fwmark(fwmark);
        }
        Ok(bind)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sockets to run receive loops on.
    pub fn sockets(&self) -> Vec<Arc<UdpSocket>> {
        self.v4.iter().chain(self.v6.iter()).cloned().collect()
    }

    /// Send one datagram to `endpoint`, choosing the socket by family.
    pub async fn send_to(&self, datagram: &[u8], endpoint: SocketAddr) -> Result<()> {
        let socket = match endpoint {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        }
        .ok_or(NetworkError::NoEndpoint)?;

        socket
            .send_to(datagram, endpoint)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Apply an fwmark to both sockets (Linux only; elsewhere a no-op).
    pub fn set_fwmark(&self, mark: u32) {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            for socket in self.sockets() {
                let fd = socket.as_raw_fd();
                let rc = unsafe {
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_MARK,
                        &mark as *const u32 as *const libc::c_void,
                        std::mem::size_of::<u32>() as libc::socklen_t,
                    )
                };
                if rc != 0 {
                    tracing::warn!("failed to set fwmark {} on fd {}", mark, fd);
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = mark;
        }
    }
}
