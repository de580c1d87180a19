// ADHOCD — ROUTING: PATH DISCOVERY STATE
// Reactive discovery bookkeeping: per-destination buffers of datagrams
// awaiting a route (at most one outstanding discovery per destination) and
// the flooded-request dedup set. The RREQ/RREP wire handling lives in the
// dispatch pipeline; this module is the state machine.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use crate::engine::runtime::SeenSet;

/// A destination currently under discovery.
#[derive(Debug)]
pub struct PendingRoute {
    pub rreq_id: u32,
    pub first_issue: u64,
    pub deadline: u64,
    queue: VecDeque<Vec<u8>>,
}

/// What the caller must do after buffering a datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New discovery: issue an RREQ carrying this id.
    SendRreq { rreq_id: u32 },
    /// Discovery already in flight; the datagram joined the buffer.
    Buffered,
    /// Buffer full; the datagram was dropped (newest-drop policy).
    QueueFull,
}

pub struct PendingRoutes {
    map: HashMap<IpAddr, PendingRoute>,
    queue_max: usize,
}

impl PendingRoutes {
    pub fn new(queue_max: usize) -> Self {
        PendingRoutes {
            map: HashMap::new(),
            queue_max,
        }
    }

    /// Buffer `datagram` for `dst`. `alloc_id` is only invoked when a new
    /// discovery actually starts. An entry whose deadline already passed is
    /// dropped and restarted, matching the absent-state transition.
    pub fn enqueue(
        &mut self,
        dst: IpAddr,
        datagram: Vec<u8>,
        now: u64,
        deadline_ns: u64,
        alloc_id: impl FnOnce() -> u32,
    ) -> EnqueueOutcome {
        if let Some(entry) = self.map.get_mut(&dst) {
            if now <= entry.deadline {
                if entry.queue.len() >= self.queue_max {
                    return EnqueueOutcome::QueueFull;
                }
                entry.queue.push_back(datagram);
                return EnqueueOutcome::Buffered;
            }
            // Deadline passed without an RREP; the buffered packets are gone.
            self.map.remove(&dst);
        }
        let rreq_id = alloc_id();
        let mut queue = VecDeque::with_capacity(4);
        queue.push_back(datagram);
        self.map.insert(
            dst,
            PendingRoute {
                rreq_id,
                first_issue: now,
                deadline: now + deadline_ns,
                queue,
            },
        );
        EnqueueOutcome::SendRreq { rreq_id }
    }

    /// A matching RREP arrived: close the discovery and hand back the
    /// buffered datagrams for re-injection.
    pub fn resolve(&mut self, dst: &IpAddr) -> Option<Vec<Vec<u8>>> {
        self.map.remove(dst).map(|p| p.queue.into())
    }

    /// Drop expired discoveries. Returns the number of discarded datagrams
    /// (silent drops, IP semantics).
    pub fn sweep(&mut self, now: u64) -> usize {
        let mut dropped = 0;
        self.map.retain(|_, p| {
            if now > p.deadline {
                dropped += p.queue.len();
                false
            } else {
                true
            }
        });
        dropped
    }

    pub fn contains(&self, dst: &IpAddr) -> bool {
        self.map.contains_key(dst)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Flood suppression for route requests, keyed by (originator, rreq_id).
pub struct SeenRequestSet {
    seen: SeenSet<(IpAddr, u32)>,
}

impl SeenRequestSet {
    pub fn new(cap: usize) -> Self {
        SeenRequestSet {
            seen: SeenSet::new(cap),
        }
    }

    /// Returns true when the request is fresh (and records it).
    pub fn record(&mut self, originator: IpAddr, rreq_id: u32) -> bool {
        self.seen.insert((originator, rreq_id))
    }

    pub fn contains(&self, originator: &IpAddr, rreq_id: u32) -> bool {
        self.seen.contains(&(*originator, rreq_id))
    }
}
