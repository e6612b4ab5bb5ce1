//! Minimal inner-IP frame inspection
//!
//! The data plane only needs the version nibble, the source/destination
//! addresses, and the true datagram length (to strip transport padding).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// IP version from the first nibble, if the frame is plausibly IP.
pub fn version(frame: &[u8]) -> Option<u8> {
    match frame.first().map(|b| b >> 4) {
        Some(4) => Some(4),
        Some(6) => Some(6),
        _ => None,
    }
}

/// Destination address of an inner frame.
pub fn destination(frame: &[u8]) -> Option<IpAddr> {
    match version(frame)? {
        4 if frame.len() >= IPV4_HEADER_LEN => {
            let octets: [u8; 4] = frame[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if frame.len() >= IPV6_HEADER_LEN => {
            let octets: [u8; 16] = frame[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Source address of an inner frame (reverse-path checks).
pub fn source(frame: &[u8]) -> Option<IpAddr> {
    match version(frame)? {
        4 if frame.len() >= IPV4_HEADER_LEN => {
            let octets: [u8; 4] = frame[12..16].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if frame.len() >= IPV6_HEADER_LEN => {
            let octets: [u8; 16] = frame[8..24].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Declared total length, used to strip block padding after decryption.
pub fn total_len(frame: &[u8]) -> Option<usize> {
    match version(frame)? {
        4 if frame.len() >= IPV4_HEADER_LEN => {
            Some(u16::from_be_bytes([frame[2], frame[3]]) as usize)
        }
        6 if frame.len() >= IPV6_HEADER_LEN => {
            Some(u16::from_be_bytes([frame[4], frame[5]]) as usize + IPV6_HEADER_LEN)
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn test_ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; total];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    frame[8] = 64; // ttl
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    frame[20..].copy_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_fields() {
        let frame = test_ipv4_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            b"data",
        );
        assert_eq!(version(&frame), Some(4));
        assert_eq!(source(&frame), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(
            destination(&frame),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
        );
        assert_eq!(total_len(&frame), Some(24));
    }

    #[test]
    fn ipv6_fields() {
        let mut frame = vec![0u8; 40];
        frame[0] = 0x60;
        frame[4..6].copy_from_slice(&8u16.to_be_bytes());
        frame[8..24].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        frame[24..40].copy_from_slice(&Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1).octets());

        assert_eq!(version(&frame), Some(6));
        assert_eq!(source(&frame), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(total_len(&frame), Some(48));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(version(&[0x15, 0, 0]), None);
        assert_eq!(destination(&[0x45; 4]), None);
        assert_eq!(total_len(&[]), None);
    }
}
