// ADHOCD — NETWORK: INNER IP PARSING
// Minimal extraction from the encapsulated datagrams: version, src/dst
// addresses and the upper protocol number. The daemon never rewrites the
// inner packet; checksums and options are the endpoints' business.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IPv4 protocol / IPv6 next-header.
    pub proto: u8,
}

/// Parse the leading IP header of a raw datagram (as read from the TUN
/// device with IFF_NO_PI: no prefix, version nibble first). None for
/// anything that is not a complete IPv4/IPv6 header.
pub fn parse_datagram(pkt: &[u8]) -> Option<DatagramInfo> {
    match pkt.first()? >> 4 {
        4 => {
            if pkt.len() < 20 {
                return None;
            }
            let src = Ipv4Addr::new(pkt[12], pkt[13], pkt[14], pkt[15]);
            let dst = Ipv4Addr::new(pkt[16], pkt[17], pkt[18], pkt[19]);
            Some(DatagramInfo {
                src: IpAddr::V4(src),
                dst: IpAddr::V4(dst),
                proto: pkt[9],
            })
        }
        6 => {
            if pkt.len() < 40 {
                return None;
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&pkt[8..24]);
            dst.copy_from_slice(&pkt[24..40]);
            Some(DatagramInfo {
                src: IpAddr::V6(Ipv6Addr::from(src)),
                dst: IpAddr::V6(Ipv6Addr::from(dst)),
                proto: pkt[6],
            })
        }
        _ => None,
    }
}

/// Destinations flooded instead of routed: IPv4/IPv6 multicast and the
/// crude .255 IPv4 broadcast convention of the mesh subnets.
pub fn is_flood_destination(dst: &IpAddr) -> bool {
    match dst {
        IpAddr::V4(a) => a.is_multicast() || a.is_broadcast() || a.octets()[3] == 255,
        IpAddr::V6(a) => a.is_multicast(),
    }
}
