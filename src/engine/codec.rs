// ADHOCD — ENGINE: CODEC MODULE
// The wire header family carried between the Ethernet header and the
// encapsulated IP datagram. One-byte type tag first (low nibble = kind,
// high nibble = per-kind flag bits), all multi-byte integers little-endian,
// no padding between fields.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

/// Custom EtherType for adhocd frames on the physical interface.
pub const ETH_P_ADHOC: u16 = 0x7777;

pub type Mac = [u8; 6];

pub const BROADCAST_MAC: Mac = [0xFF; 6];

/// IEEE 802.3 Ethernet header. 14 bytes on wire: dst(6) + src(6) + ethertype(2).
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct EthernetHeader {
    pub dst: Mac,
    pub src: Mac,
    pub ethertype: u16,
}

pub const ETH_HDR_SIZE: usize = mem::size_of::<EthernetHeader>();
const _: () = assert!(ETH_HDR_SIZE == 14);

// Type tags (low nibble of the first byte).
pub const TYPE_UNICAST: u8 = 0x0;
pub const TYPE_BROADCAST: u8 = 0x1;
pub const TYPE_RREQ4: u8 = 0x2;
pub const TYPE_RREQ6: u8 = 0x3;
pub const TYPE_RREP4: u8 = 0x4;
pub const TYPE_RREP6: u8 = 0x5;
pub const TYPE_HELLO: u8 = 0x6;
pub const TYPE_ACK: u8 = 0x7;
pub const TYPE_REWARD: u8 = 0x8;
pub const TYPE_RELIABLE: u8 = 0x9;

// HELLO flag bits (high nibble of the type tag).
pub const HELLO_HAS_IPV4: u8 = 0x10;
pub const HELLO_HAS_IPV6: u8 = 0x20;

/// Longest header in the family (RREQ6: tag + hop + 2×16B ip + 2×u32).
pub const MAX_HDR_SIZE: usize = 42;

pub fn mac_str(mac: &Mac) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer shorter than the kind's minimum length, or fields inconsistent.
    #[error("malformed header")]
    MalformedHeader,
    /// First-byte tag does not name a known header kind.
    #[error("unknown header kind 0x{0:02x}")]
    UnknownKind(u8),
}

// ============================================================================
// MESSAGE KINDS
// ============================================================================

/// Unicast data header. Payload = IP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unicast {
    pub ttl: u8,
    pub dst_mac: Mac,
    pub src_mac: Mac,
}

/// Broadcast data header. Payload = IP datagram, flooded with a TTL cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub broadcast_id: u32,
    pub ttl: u8,
    pub src_node_id: u32,
}

/// Route request, flooded toward `dst_ip`. The v4/v6 wire variant is chosen
/// from the address family at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rreq {
    pub hop_count: u8,
    pub dst_ip: IpAddr,
    pub src_ip: IpAddr,
    pub rreq_id: u32,
    pub bcast_id: u32,
}

/// Route reply, unicast back along the reverse path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrep {
    pub hop_count: u8,
    pub dst_ip: IpAddr,
    pub src_ip: IpAddr,
    pub tx_mac: Mac,
}

/// Periodic neighbor beacon carrying the advertised tunnel addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub node_id: u32,
    pub tx_count: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Acknowledgement for a RELIABLE_DATA frame. `msg_id` carries the 32-bit
/// message hash the sender keyed its retransmit record under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub msg_id: u32,
    pub tx_mac: Mac,
}

/// Scalar feedback attributing a forwarding outcome to `neighbor_mac`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reward {
    pub reward_value: f32,
    pub msg_hash: u32,
    pub neighbor_mac: Mac,
}

/// Unicast data header transmitted with stop-and-wait ARQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableData {
    pub msg_id: u32,
    pub dst_mac: Mac,
    pub src_mac: Mac,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Unicast(Unicast),
    Broadcast(Broadcast),
    Rreq(Rreq),
    Rrep(Rrep),
    Hello(Hello),
    Ack(Ack),
    Reward(Reward),
    ReliableData(ReliableData),
}

// ============================================================================
// CURSOR PRIMITIVES
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::MalformedHeader);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32_le(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.u32_le()?))
    }

    fn mac(&mut self) -> Result<Mac, CodecError> {
        let b = self.take(6)?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(b);
        Ok(mac)
    }

    fn ipv4(&mut self) -> Result<Ipv4Addr, CodecError> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    fn ipv6(&mut self) -> Result<Ipv6Addr, CodecError> {
        let b = self.take(16)?;
        let mut oct = [0u8; 16];
        oct.copy_from_slice(b);
        Ok(Ipv6Addr::from(oct))
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer {
            buf: Vec::with_capacity(MAX_HDR_SIZE),
        }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f32_le(&mut self, v: f32) {
        self.u32_le(v.to_bits());
    }
    fn mac(&mut self, m: &Mac) {
        self.buf.extend_from_slice(m);
    }
    fn ip(&mut self, ip: &IpAddr) {
        match ip {
            IpAddr::V4(a) => self.buf.extend_from_slice(&a.octets()),
            IpAddr::V6(a) => self.buf.extend_from_slice(&a.octets()),
        }
    }
}

// ============================================================================
// ENCODE / DECODE
// ============================================================================

impl Message {
    /// Encode the header. Payload (for data-carrying kinds) is appended by
    /// the caller; see [`build_frame`]. Mixed v4/v6 addresses in an
    /// RREQ/RREP are a caller bug and surface as `MalformedHeader`.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = Writer::new();
        match self {
            Message::Unicast(m) => {
                w.u8(TYPE_UNICAST);
                w.u8(m.ttl);
                w.mac(&m.dst_mac);
                w.mac(&m.src_mac);
            }
            Message::Broadcast(m) => {
                w.u8(TYPE_BROADCAST);
                w.u32_le(m.broadcast_id);
                w.u8(m.ttl);
                w.u32_le(m.src_node_id);
            }
            Message::Rreq(m) => {
                w.u8(rreq_tag(&m.dst_ip, &m.src_ip, TYPE_RREQ4, TYPE_RREQ6)?);
                w.u8(m.hop_count);
                w.ip(&m.dst_ip);
                w.ip(&m.src_ip);
                w.u32_le(m.rreq_id);
                w.u32_le(m.bcast_id);
            }
            Message::Rrep(m) => {
                w.u8(rreq_tag(&m.dst_ip, &m.src_ip, TYPE_RREP4, TYPE_RREP6)?);
                w.u8(m.hop_count);
                w.ip(&m.dst_ip);
                w.ip(&m.src_ip);
                w.mac(&m.tx_mac);
            }
            Message::Hello(m) => {
                let mut tag = TYPE_HELLO;
                if m.ipv4.is_some() {
                    tag |= HELLO_HAS_IPV4;
                }
                if m.ipv6.is_some() {
                    tag |= HELLO_HAS_IPV6;
                }
                w.u8(tag);
                w.u32_le(m.node_id);
                w.u32_le(m.tx_count);
                if let Some(v4) = m.ipv4 {
                    w.buf.extend_from_slice(&v4.octets());
                }
                if let Some(v6) = m.ipv6 {
                    w.buf.extend_from_slice(&v6.octets());
                }
            }
            Message::Ack(m) => {
                w.u8(TYPE_ACK);
                w.u32_le(m.msg_id);
                w.mac(&m.tx_mac);
            }
            Message::Reward(m) => {
                w.u8(TYPE_REWARD);
                w.f32_le(m.reward_value);
                w.u32_le(m.msg_hash);
                w.mac(&m.neighbor_mac);
            }
            Message::ReliableData(m) => {
                w.u8(TYPE_RELIABLE);
                w.u32_le(m.msg_id);
                w.mac(&m.dst_mac);
                w.mac(&m.src_mac);
            }
        }
        Ok(w.buf)
    }

    /// Decode one header from the front of `buf`. Returns the message and the
    /// number of bytes consumed; the remainder is the payload (if any).
    pub fn decode(buf: &[u8]) -> Result<(Message, usize), CodecError> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let kind = tag & 0x0F;
        let flags = tag & 0xF0;
        // Only HELLO defines flag bits.
        if flags != 0 && kind != TYPE_HELLO {
            return Err(CodecError::UnknownKind(tag));
        }
        let msg = match kind {
            TYPE_UNICAST => Message::Unicast(Unicast {
                ttl: r.u8()?,
                dst_mac: r.mac()?,
                src_mac: r.mac()?,
            }),
            TYPE_BROADCAST => Message::Broadcast(Broadcast {
                broadcast_id: r.u32_le()?,
                ttl: r.u8()?,
                src_node_id: r.u32_le()?,
            }),
            TYPE_RREQ4 => Message::Rreq(Rreq {
                hop_count: r.u8()?,
                dst_ip: IpAddr::V4(r.ipv4()?),
                src_ip: IpAddr::V4(r.ipv4()?),
                rreq_id: r.u32_le()?,
                bcast_id: r.u32_le()?,
            }),
            TYPE_RREQ6 => Message::Rreq(Rreq {
                hop_count: r.u8()?,
                dst_ip: IpAddr::V6(r.ipv6()?),
                src_ip: IpAddr::V6(r.ipv6()?),
                rreq_id: r.u32_le()?,
                bcast_id: r.u32_le()?,
            }),
            TYPE_RREP4 => Message::Rrep(Rrep {
                hop_count: r.u8()?,
                dst_ip: IpAddr::V4(r.ipv4()?),
                src_ip: IpAddr::V4(r.ipv4()?),
                tx_mac: r.mac()?,
            }),
            TYPE_RREP6 => Message::Rrep(Rrep {
                hop_count: r.u8()?,
                dst_ip: IpAddr::V6(r.ipv6()?),
                src_ip: IpAddr::V6(r.ipv6()?),
                tx_mac: r.mac()?,
            }),
            TYPE_HELLO => {
                if flags & !(HELLO_HAS_IPV4 | HELLO_HAS_IPV6) != 0 {
                    return Err(CodecError::UnknownKind(tag));
                }
                let node_id = r.u32_le()?;
                let tx_count = r.u32_le()?;
                let ipv4 = if flags & HELLO_HAS_IPV4 != 0 {
                    Some(r.ipv4()?)
                } else {
                    None
                };
                let ipv6 = if flags & HELLO_HAS_IPV6 != 0 {
                    Some(r.ipv6()?)
                } else {
                    None
                };
                Message::Hello(Hello {
                    node_id,
                    tx_count,
                    ipv4,
                    ipv6,
                })
            }
            TYPE_ACK => Message::Ack(Ack {
                msg_id: r.u32_le()?,
                tx_mac: r.mac()?,
            }),
            TYPE_REWARD => Message::Reward(Reward {
                reward_value: r.f32_le()?,
                msg_hash: r.u32_le()?,
                neighbor_mac: r.mac()?,
            }),
            TYPE_RELIABLE => Message::ReliableData(ReliableData {
                msg_id: r.u32_le()?,
                dst_mac: r.mac()?,
                src_mac: r.mac()?,
            }),
            _ => return Err(CodecError::UnknownKind(tag)),
        };
        Ok((msg, r.pos))
    }
}

fn rreq_tag(dst: &IpAddr, src: &IpAddr, v4: u8, v6: u8) -> Result<u8, CodecError> {
    match (dst, src) {
        (IpAddr::V4(_), IpAddr::V4(_)) => Ok(v4),
        (IpAddr::V6(_), IpAddr::V6(_)) => Ok(v6),
        _ => Err(CodecError::MalformedHeader),
    }
}

/// Header + payload in one buffer, ready for the transport.
pub fn build_frame(msg: &Message, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut body = msg.encode()?;
    body.extend_from_slice(payload);
    Ok(body)
}

// ============================================================================
// TESTS
// ============================================================================
