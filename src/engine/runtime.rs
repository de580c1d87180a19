// ADHOCD — ENGINE: RUNTIME MODULE
// Infrastructure shared by every worker: monotonic clock, structured fatal
// exit, 32-bit message hashing, drop/forward counters, bounded dedup sets,
// and the Core hub that owns all mutable routing state.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::engine::codec::Mac;
use crate::routing::arq::ArqState;
use crate::routing::neighbors::NeighborTable;
use crate::routing::path::{PendingRoutes, SeenRequestSet};
use crate::routing::reward::{RewardSends, RewardWaits};
use crate::routing::table::RouteTable;

// ============================================================================
// CLOCK / FATAL EXIT
// ============================================================================

/// Monotonic nanoseconds. All protocol timers are driven off this clock so
/// tests can substitute synthetic values.
#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: FFI call with a valid mutable reference to timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

// Exit codes. Printed in the fatal diagnostic line.
pub const E_CONFIG: i32 = 0x10;
pub const E_TUN: i32 = 0x20;
pub const E_RAW: i32 = 0x21;
pub const E_PIDFILE: i32 = 0x30;
pub const E_IPC: i32 = 0x31;
pub const E_WORKER: i32 = 0x40;

/// Structured fatal exit: one diagnostic line, non-zero status.
#[inline(never)]
pub fn fatal(code: i32, msg: &str) -> ! {
    eprintln!("[ADHOCD FATAL 0x{code:02X}] {msg}");
    std::process::exit(code);
}

// ============================================================================
// MESSAGE HASHING
// ============================================================================

fn hash32(parts: &[&[u8]]) -> u32 {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    let digest = h.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// ARQ record key: hash over the reliable message id and the receiving MAC.
/// Sender and receiver compute the same value independently, so the ACK can
/// carry the key without echoing the full record.
pub fn arq_hash(msg_id: u32, receiver_mac: &Mac) -> u32 {
    hash32(&[&msg_id.to_le_bytes(), receiver_mac])
}

/// Reward bookkeeping key: hash over the destination IP and the next-hop MAC.
pub fn reward_hash(dst_ip: &IpAddr, mac: &Mac) -> u32 {
    match dst_ip {
        IpAddr::V4(a) => hash32(&[&a.octets(), mac]),
        IpAddr::V6(a) => hash32(&[&a.octets(), mac]),
    }
}

/// Reliable message id: hash over the inner endpoints and a monotonic
/// counter, so ids from different flows do not collide trivially.
pub fn reliable_msg_id(src_ip: &IpAddr, dst_ip: &IpAddr, counter: u32) -> u32 {
    fn octets(ip: &IpAddr) -> Vec<u8> {
        match ip {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        }
    }
    hash32(&[&octets(src_ip), &octets(dst_ip), &counter.to_le_bytes()])
}

// ============================================================================
// BOUNDED DEDUP SET
// ============================================================================

/// Insert-only set with FIFO eviction once the cap is reached. Used for
/// broadcast ids, RREQ dedup and reliable-delivery suppression.
pub struct SeenSet<T: Clone + Eq + std::hash::Hash> {
    set: std::collections::HashSet<T>,
    order: std::collections::VecDeque<T>,
    cap: usize,
}

impl<T: Clone + Eq + std::hash::Hash> SeenSet<T> {
    pub fn new(cap: usize) -> Self {
        SeenSet {
            set: std::collections::HashSet::with_capacity(cap),
            order: std::collections::VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.set.contains(item)
    }

    /// Returns true if the item was fresh.
    pub fn insert(&mut self, item: T) -> bool {
        if !self.set.insert(item.clone()) {
            return false;
        }
        self.order.push_back(item);
        if self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ============================================================================
// COUNTERS
// ============================================================================

/// Drop/forward telemetry. Dropping is a normal outcome for an IP router;
/// the counters are the only trace.
#[derive(Default)]
pub struct Counters {
    pub rx_frames: AtomicU64,
    pub tx_frames: AtomicU64,
    pub tun_rx: AtomicU64,
    pub tun_delivered: AtomicU64,
    pub forwarded: AtomicU64,
    pub malformed: AtomicU64,
    pub unknown_kind: AtomicU64,
    pub no_route: AtomicU64,
    pub pending_expired: AtomicU64,
    pub pending_overflow: AtomicU64,
    pub broadcast_dup: AtomicU64,
    pub rreq_dup: AtomicU64,
    pub reliable_dup: AtomicU64,
    pub arq_retx: AtomicU64,
    pub arq_exhausted: AtomicU64,
    pub ttl_exceeded: AtomicU64,
    pub send_errors: AtomicU64,
    pub unsupported_l3: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> String {
        let g = |c: &AtomicU64| c.load(Ordering::Relaxed);
        format!(
            "rx:{} tx:{} tun_rx:{} delivered:{} fwd:{} no_route:{} malformed:{} unknown:{} \
             bcast_dup:{} rreq_dup:{} rel_dup:{} arq_retx:{} arq_fail:{} pending_exp:{} \
             pending_ovf:{} ttl_drop:{} send_err:{} bad_l3:{}",
            g(&self.rx_frames),
            g(&self.tx_frames),
            g(&self.tun_rx),
            g(&self.tun_delivered),
            g(&self.forwarded),
            g(&self.no_route),
            g(&self.malformed),
            g(&self.unknown_kind),
            g(&self.broadcast_dup),
            g(&self.rreq_dup),
            g(&self.reliable_dup),
            g(&self.arq_retx),
            g(&self.arq_exhausted),
            g(&self.pending_expired),
            g(&self.pending_overflow),
            g(&self.ttl_exceeded),
            g(&self.send_errors),
            g(&self.unsupported_l3),
        )
    }
}

// ============================================================================
// CORE — the hub all workers share
// ============================================================================

/// Capacity of the dedup sets (broadcast ids, seen RREQs, reliable rx ids).
pub const SEEN_CAP: usize = 256;

/// Process-wide routing state. Components refer to the hub by identity and
/// never to each other; mutation is serialized per structure.
pub struct Core {
    pub cfg: Config,
    pub node_mac: Mac,
    /// Low 32 bits of the interface MAC, advertised in HELLO and BROADCAST.
    pub node_id: u32,

    pub table: Mutex<RouteTable>,
    pub neighbors: Mutex<NeighborTable>,
    pub pending: Mutex<PendingRoutes>,
    pub seen_rreq: Mutex<SeenRequestSet>,
    pub arq: Mutex<ArqState>,
    pub reward_waits: Mutex<RewardWaits>,
    pub reward_sends: Mutex<RewardSends>,
    pub broadcast_seen: Mutex<SeenSet<u32>>,

    seq: AtomicU32,
    pub counters: Counters,
    shutdown: AtomicBool,
}

impl Core {
    pub fn new(cfg: Config, node_mac: Mac) -> Self {
        let node_id = u32::from_le_bytes([node_mac[2], node_mac[3], node_mac[4], node_mac[5]]);
        Core {
            table: Mutex::new(RouteTable::new(&cfg)),
            neighbors: Mutex::new(NeighborTable::new(cfg.neighbor_ttl_ns())),
            pending: Mutex::new(PendingRoutes::new(cfg.pending_queue_max)),
            seen_rreq: Mutex::new(SeenRequestSet::new(SEEN_CAP)),
            arq: Mutex::new(ArqState::new(
                cfg.arq_retry_interval_ns(),
                cfg.arq_max_retries,
                SEEN_CAP,
            )),
            reward_waits: Mutex::new(RewardWaits::new(cfg.reward_wait_ns())),
            reward_sends: Mutex::new(RewardSends::new(cfg.reward_holdown_ns())),
            broadcast_seen: Mutex::new(SeenSet::new(SEEN_CAP)),
            seq: AtomicU32::new(1),
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
            cfg,
            node_mac,
            node_id,
        }
    }

    /// Monotonic id feeding `rreq_id`, `broadcast_id` and reliable `msg_id`.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_set_dedups_and_evicts_fifo() {
        let mut seen = SeenSet::new(3);
        assert!(seen.insert(1));
        assert!(!seen.insert(1));
        assert!(seen.insert(2));
        assert!(seen.insert(3));
        assert!(seen.insert(4)); // evicts 1
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&1));
        assert!(seen.contains(&4));
        assert!(seen.insert(1)); // 1 is fresh again after eviction
    }

    #[test]
    fn hashes_are_stable_and_distinct() {
        let mac_a: Mac = [1, 2, 3, 4, 5, 6];
        let mac_b: Mac = [1, 2, 3, 4, 5, 7];
        assert_eq!(arq_hash(42, &mac_a), arq_hash(42, &mac_a));
        assert_ne!(arq_hash(42, &mac_a), arq_hash(42, &mac_b));
        assert_ne!(arq_hash(42, &mac_a), arq_hash(43, &mac_a));

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let ip6: IpAddr = "fd00::1".parse().unwrap();
        assert_eq!(reward_hash(&ip, &mac_a), reward_hash(&ip, &mac_a));
        assert_ne!(reward_hash(&ip, &mac_a), reward_hash(&ip6, &mac_a));
    }

    #[test]
    fn seq_is_monotonic() {
        let core = Core::new(Config::default(), [2, 0, 0, 0, 0, 1]);
        let a = core.next_seq();
        let b = core.next_seq();
        assert!(b > a);
    }

    #[test]
    fn node_id_from_mac_low_bytes() {
        let core = Core::new(Config::default(), [0xAA, 0xBB, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(core.node_id, u32::from_le_bytes([0x01, 0x02, 0x03, 0x04]));
    }
}
