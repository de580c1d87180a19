// ADHOCD — NETWORK: DATAPATH MODULE
// TUN device creation/teardown and the interface plumbing around it.
// Address/MTU/link state go through the `ip` tool; the device itself is an
// ioctl on /dev/net/tun. The TunSink trait is the delivery seam so the
// pipeline can be exercised without a kernel device.

use std::fs::OpenOptions;
use std::os::unix::io::{AsRawFd, RawFd};

use thiserror::Error;

use crate::engine::codec::Mac;

const IFF_TUN: i16 = 0x0001;
const IFF_NO_PI: i16 = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUN_MTU: u32 = 1400;
const READ_POLL_MS: i32 = 500;

#[repr(C)]
struct IfreqTun {
    ifr_name: [u8; 16],
    ifr_flags: i16,
}

#[derive(Debug, Error)]
pub enum TunError {
    #[error("cannot open /dev/net/tun: {0}")]
    Open(std::io::Error),
    #[error("interface name '{0}' too long")]
    NameTooLong(String),
    #[error("{op} failed: errno {errno}")]
    Syscall { op: &'static str, errno: i32 },
}

/// Where inbound datagrams destined to this node are delivered. The real
/// device writes to the TUN fd; tests plug a channel sink instead.
pub trait TunSink: Send + Sync {
    fn deliver(&self, datagram: &[u8]);
}

pub struct TunDevice {
    file: std::fs::File,
    name: String,
}

impl TunDevice {
    /// Create the tunnel interface: TUNSETIFF with IFF_NO_PI (raw datagrams,
    /// no packet-information prefix), non-blocking fd, MTU and link up.
    pub fn create(name: &str) -> Result<TunDevice, TunError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(TunError::Open)?;

        let name_bytes = name.as_bytes();
        if name_bytes.len() > 15 {
            return Err(TunError::NameTooLong(name.to_string()));
        }
        let mut req = IfreqTun {
            ifr_name: [0; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
        };
        req.ifr_name[..name_bytes.len()].copy_from_slice(name_bytes);

        // SAFETY: FFI with a valid fd and a properly laid out ifreq.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &req) };
        if rc < 0 {
            return Err(TunError::Syscall {
                op: "ioctl(TUNSETIFF)",
                errno: last_errno(),
            });
        }

        // Non-blocking: the reader drives the fd through poll().
        // SAFETY: fcntl on an owned fd.
        unsafe {
            let fd = file.as_raw_fd();
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(TunError::Syscall {
                    op: "fcntl(O_NONBLOCK)",
                    errno: last_errno(),
                });
            }
        }

        ip_cmd(&["link", "set", "dev", name, "mtu", &TUN_MTU.to_string()]);
        ip_cmd(&["link", "set", "dev", name, "up"]);
        tracing::info!(iface = name, mtu = TUN_MTU, "tunnel interface created");

        Ok(TunDevice {
            file,
            name: name.to_string(),
        })
    }

    /// Assign an address (CIDR form) to the tunnel.
    pub fn assign_addr(&self, cidr: &str) {
        ip_cmd(&["addr", "add", cidr, "dev", &self.name]);
        tracing::info!(iface = %self.name, addr = cidr, "tunnel address assigned");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Blocking-with-timeout read of the next datagram from the device.
    /// None on timeout (so the worker can check the shutdown flag).
    pub fn read_datagram(&self, buf: &mut [u8]) -> Result<Option<usize>, TunError> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is valid for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, READ_POLL_MS) };
        if ready < 0 {
            let e = last_errno();
            if e == libc::EINTR {
                return Ok(None);
            }
            return Err(TunError::Syscall { op: "poll", errno: e });
        }
        if ready == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(None);
        }
        // SAFETY: buf is a valid writable buffer.
        let n = unsafe {
            libc::read(
                self.fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let e = last_errno();
            if e == libc::EAGAIN || e == libc::EINTR {
                return Ok(None);
            }
            return Err(TunError::Syscall { op: "read", errno: e });
        }
        Ok(Some(n as usize))
    }
}

impl TunSink for TunDevice {
    fn deliver(&self, datagram: &[u8]) {
        // SAFETY: write(2) on an owned fd with a valid buffer. A short or
        // failed write loses one datagram, which IP tolerates.
        let rc = unsafe {
            libc::write(
                self.fd(),
                datagram.as_ptr() as *const libc::c_void,
                datagram.len(),
            )
        };
        if rc < 0 {
            tracing::debug!(errno = last_errno(), "tun write failed");
        }
    }
}

/// The non-persistent TUN device dies with its fd; the explicit link-down is
/// for the abnormal-exit path where the fd may be held a little longer.
pub fn cleanup_tun(name: &str) {
    ip_cmd(&["link", "set", "dev", name, "down"]);
}

fn ip_cmd(args: &[&str]) {
    let _ = std::process::Command::new("ip").args(args).output();
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// ── Interface queries ───────────────────────────────────────────────────

/// Read the hardware MAC of a network interface from sysfs.
pub fn detect_mac(iface: &str) -> Option<Mac> {
    let path = format!("/sys/class/net/{iface}/address");
    let contents = std::fs::read_to_string(path).ok()?;
    parse_mac(contents.trim())
}

pub fn parse_mac(s: &str) -> Option<Mac> {
    let parts: Vec<u8> = s
        .split(':')
        .filter_map(|h| u8::from_str_radix(h, 16).ok())
        .collect();
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&parts);
    Some(mac)
}

/// IPv4 address currently assigned to an interface (SIOCGIFADDR).
pub fn interface_ipv4(iface: &str) -> Option<std::net::Ipv4Addr> {
    let name = iface.as_bytes();
    if name.len() >= 16 {
        return None;
    }
    // SAFETY: plain UDP socket used only as an ioctl handle.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return None;
    }
    // SAFETY: ifreq is zero-initializable.
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, b) in name.iter().enumerate() {
        req.ifr_name[i] = *b as libc::c_char;
    }
    // SAFETY: req is valid; SIOCGIFADDR fills ifr_addr on success.
    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFADDR as _, &mut req) };
    // SAFETY: fd is owned here.
    unsafe { libc::close(fd) };
    if rc < 0 {
        return None;
    }
    // SAFETY: after a successful SIOCGIFADDR the union holds a sockaddr_in.
    let addr = unsafe {
        let sin = &req.ifr_ifru.ifru_addr as *const libc::sockaddr as *const libc::sockaddr_in;
        (*sin).sin_addr.s_addr
    };
    Some(std::net::Ipv4Addr::from(u32::from_be(addr)))
}

/// Channel-backed sink for tests: delivered datagrams land in a receiver.
pub struct ChannelSink {
    tx: crossbeam_channel::Sender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new() -> (ChannelSink, crossbeam_channel::Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ChannelSink { tx }, rx)
    }
}

impl TunSink for ChannelSink {
    fn deliver(&self, datagram: &[u8]) {
        let _ = self.tx.send(datagram.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac_strings() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:0f"),
            Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x0F])
        );
        assert_eq!(parse_mac("aa:bb:cc"), None);
        assert_eq!(parse_mac("zz:bb:cc:dd:ee:ff"), None);
        assert_eq!(parse_mac(""), None);
    }

    #[test]
    fn channel_sink_delivers() {
        let (sink, rx) = ChannelSink::new();
        sink.deliver(b"datagram");
        assert_eq!(rx.try_recv().unwrap(), b"datagram");
    }
}
