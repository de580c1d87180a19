// ADHOCD — NETWORK: FRAME TRANSPORT
// Two variants behind one trait. RawTransport owns an AF_PACKET socket bound
// to the physical interface with the 0x7777 EtherType, so the kernel filters
// foreign traffic for us. VirtualSwitch is an in-process fan-out used by the
// multi-node tests (and as the seam where a production deployment would hang
// a frame-authentication filter).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;

use crate::engine::codec::{Mac, BROADCAST_MAC, ETH_HDR_SIZE, ETH_P_ADHOC};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{op} failed: errno {errno}")]
    Syscall { op: &'static str, errno: i32 },
    #[error("interface {0} not found")]
    NoInterface(String),
    #[error("transport closed")]
    Closed,
}

/// Frame send/receive. `body` is the protocol header + payload; the
/// transport owns the Ethernet framing. `recv_frame` returns None on a poll
/// timeout so workers can observe the shutdown flag between waits.
pub trait FrameTransport: Send + Sync {
    fn send_frame(&self, dst_mac: &Mac, body: &[u8]) -> Result<(), TransportError>;
    fn recv_frame(&self, buf: &mut [u8]) -> Result<Option<(Mac, usize)>, TransportError>;
    fn local_mac(&self) -> Mac;
}

// ============================================================================
// RAW L2 TRANSPORT (AF_PACKET)
// ============================================================================

const RECV_POLL_MS: i32 = 500;
const FRAME_MAX: usize = 2048;

pub struct RawTransport {
    fd: i32,
    ifindex: i32,
    mac: Mac,
}

impl RawTransport {
    /// Bind a raw socket to `iface` for EtherType 0x7777 frames only.
    pub fn open(iface: &str, mac: Mac) -> Result<Self, TransportError> {
        let proto = ETH_P_ADHOC.to_be() as i32;
        // SAFETY: plain socket(2) call; the fd is checked below.
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto) };
        if fd < 0 {
            return Err(TransportError::Syscall {
                op: "socket(AF_PACKET)",
                errno: errno(),
            });
        }

        let ifindex = ifindex_of(fd, iface).ok_or_else(|| {
            // SAFETY: fd was just created by us.
            unsafe { libc::close(fd) };
            TransportError::NoInterface(iface.to_string())
        })?;

        // SAFETY: sockaddr_ll is zero-initializable; all fields set below.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = proto as u16;
        addr.sll_ifindex = ifindex;
        // SAFETY: addr is a valid sockaddr_ll for the bind call.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let errno = errno();
            // SAFETY: fd was just created by us.
            unsafe { libc::close(fd) };
            return Err(TransportError::Syscall { op: "bind", errno });
        }
        Ok(RawTransport { fd, ifindex, mac })
    }
}

impl FrameTransport for RawTransport {
    fn send_frame(&self, dst_mac: &Mac, body: &[u8]) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(ETH_HDR_SIZE + body.len());
        frame.extend_from_slice(dst_mac);
        frame.extend_from_slice(&self.mac);
        frame.extend_from_slice(&ETH_P_ADHOC.to_be_bytes());
        frame.extend_from_slice(body);

        // SAFETY: sockaddr_ll is zero-initializable; all used fields set.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETH_P_ADHOC.to_be();
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(dst_mac);
        // SAFETY: frame and addr are valid for the duration of the call.
        let rc = unsafe {
            libc::sendto(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TransportError::Syscall {
                op: "sendto",
                errno: errno(),
            });
        }
        Ok(())
    }

    fn recv_frame(&self, buf: &mut [u8]) -> Result<Option<(Mac, usize)>, TransportError> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, RECV_POLL_MS) };
        if ready < 0 {
            let e = errno();
            if e == libc::EINTR {
                return Ok(None);
            }
            return Err(TransportError::Syscall { op: "poll", errno: e });
        }
        if ready == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(None);
        }

        let mut raw = [0u8; FRAME_MAX];
        // SAFETY: raw is a valid buffer of FRAME_MAX bytes.
        let n = unsafe { libc::recv(self.fd, raw.as_mut_ptr() as *mut libc::c_void, FRAME_MAX, 0) };
        if n < 0 {
            let e = errno();
            if e == libc::EAGAIN || e == libc::EINTR {
                return Ok(None);
            }
            return Err(TransportError::Syscall { op: "recv", errno: e });
        }
        let n = n as usize;
        if n < ETH_HDR_SIZE {
            return Ok(None);
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&raw[0..6]);
        src.copy_from_slice(&raw[6..12]);
        // Our own transmissions loop back on some drivers; a frame neither
        // addressed to us nor broadcast is not ours to process either.
        if src == self.mac || (dst != self.mac && dst != BROADCAST_MAC) {
            return Ok(None);
        }
        let body_len = n - ETH_HDR_SIZE;
        if body_len > buf.len() {
            return Ok(None);
        }
        buf[..body_len].copy_from_slice(&raw[ETH_HDR_SIZE..n]);
        Ok(Some((src, body_len)))
    }

    fn local_mac(&self) -> Mac {
        self.mac
    }
}

impl Drop for RawTransport {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this transport.
        unsafe { libc::close(self.fd) };
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn ifindex_of(fd: i32, iface: &str) -> Option<i32> {
    let mut req: libc::ifreq = // SAFETY: ifreq is zero-initializable.
        unsafe { std::mem::zeroed() };
    let name = iface.as_bytes();
    if name.len() >= 16 {
        return None;
    }
    for (i, b) in name.iter().enumerate() {
        req.ifr_name[i] = *b as libc::c_char;
    }
    // SAFETY: req is a valid ifreq; SIOCGIFINDEX fills ifr_ifindex.
    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX as _, &mut req) };
    if rc < 0 {
        return None;
    }
    // SAFETY: the union field is valid after a successful SIOCGIFINDEX.
    Some(unsafe { req.ifr_ifru.ifru_ifindex })
}

// ============================================================================
// VIRTUAL TRANSPORT (in-process fan-out)
// ============================================================================

/// Per-link delivery filter: (src, receiver, body) → deliver?. Evaluated
/// once per receiving port (broadcasts included), so tests can model
/// topology, loss and partitions at link granularity.
pub type FrameFilter = Box<dyn Fn(&Mac, &Mac, &[u8]) -> bool + Send + Sync>;

const PORT_QUEUE_DEPTH: usize = 256;

pub struct VirtualSwitch {
    ports: Mutex<HashMap<Mac, Sender<(Mac, Vec<u8>)>>>,
    filter: Mutex<Option<FrameFilter>>,
    pub dropped: AtomicU64,
}

impl VirtualSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(VirtualSwitch {
            ports: Mutex::new(HashMap::new()),
            filter: Mutex::new(None),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn attach(self: &Arc<Self>, mac: Mac, recv_timeout: Duration) -> VirtualPort {
        let (tx, rx) = bounded(PORT_QUEUE_DEPTH);
        self.ports.lock().insert(mac, tx);
        VirtualPort {
            mac,
            rx,
            switch: self.clone(),
            recv_timeout,
        }
    }

    pub fn set_filter(&self, filter: FrameFilter) {
        *self.filter.lock() = Some(filter);
    }

    pub fn clear_filter(&self) {
        *self.filter.lock() = None;
    }

    fn deliver(&self, src: &Mac, dst: &Mac, body: &[u8]) {
        let filter = self.filter.lock();
        let ports = self.ports.lock();
        let targets: Vec<(Mac, &Sender<(Mac, Vec<u8>)>)> = if *dst == BROADCAST_MAC {
            ports
                .iter()
                .filter(|(mac, _)| *mac != src)
                .map(|(mac, tx)| (*mac, tx))
                .collect()
        } else {
            ports.get(dst).map(|tx| (*dst, tx)).into_iter().collect()
        };
        for (receiver, tx) in targets {
            let passes = filter.as_ref().map(|f| f(src, &receiver, body)).unwrap_or(true);
            if !passes {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match tx.try_send((*src, body.to_vec())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn detach(&self, mac: &Mac) {
        self.ports.lock().remove(mac);
    }
}

pub struct VirtualPort {
    mac: Mac,
    rx: Receiver<(Mac, Vec<u8>)>,
    switch: Arc<VirtualSwitch>,
    recv_timeout: Duration,
}

impl FrameTransport for VirtualPort {
    fn send_frame(&self, dst_mac: &Mac, body: &[u8]) -> Result<(), TransportError> {
        self.switch.deliver(&self.mac, dst_mac, body);
        Ok(())
    }

    fn recv_frame(&self, buf: &mut [u8]) -> Result<Option<(Mac, usize)>, TransportError> {
        match self.rx.recv_timeout(self.recv_timeout) {
            Ok((src, body)) => {
                if body.len() > buf.len() {
                    return Ok(None);
                }
                buf[..body.len()].copy_from_slice(&body);
                Ok(Some((src, body.len())))
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn local_mac(&self) -> Mac {
        self.mac
    }
}

impl Drop for VirtualPort {
    fn drop(&mut self) {
        self.switch.detach(&self.mac);
    }
}
