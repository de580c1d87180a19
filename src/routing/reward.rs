// ADHOCD — ROUTING: REWARD LAYER
// Two halves. Wait-side: after forwarding through a neighbor, a short-lived
// record waits for the downstream REWARD; its expiry applies the configured
// timeout penalty. Send-side: on accepting a data frame, emit a REWARD back
// to the upstream node, throttled per (destination, upstream) so intense
// flows do not multiply reward traffic.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::engine::codec::Mac;
use crate::engine::runtime::reward_hash;

/// An expected-but-unseen downstream reward.
#[derive(Debug, Clone)]
pub struct RewardPending {
    pub dst_ip: IpAddr,
    pub mac: Mac,
    pub created: u64,
}

pub struct RewardWaits {
    map: HashMap<(u32, Mac), RewardPending>,
    wait_ns: u64,
}

impl RewardWaits {
    pub fn new(wait_ns: u64) -> Self {
        RewardWaits {
            map: HashMap::new(),
            wait_ns,
        }
    }

    /// Open a pending record for a forward through `mac` toward `dst_ip`.
    /// An already-open key is left untouched (one wait per outcome).
    pub fn open(&mut self, dst_ip: IpAddr, mac: Mac, now: u64) -> bool {
        let key = (reward_hash(&dst_ip, &mac), mac);
        if self.map.contains_key(&key) {
            return false;
        }
        self.map.insert(
            key,
            RewardPending {
                dst_ip,
                mac,
                created: now,
            },
        );
        true
    }

    /// A REWARD arrived. Returns the (dst_ip, mac) to apply the value to, or
    /// None for an unmatched (stale or foreign) reward.
    pub fn settle(&mut self, msg_hash: u32, neighbor_mac: Mac) -> Option<(IpAddr, Mac)> {
        self.map
            .remove(&(msg_hash, neighbor_mac))
            .map(|p| (p.dst_ip, p.mac))
    }

    /// Expire silent waits. The caller applies HOP_REWARD_TIMEOUT to each.
    pub fn sweep(&mut self, now: u64) -> Vec<(IpAddr, Mac)> {
        let wait_ns = self.wait_ns;
        let mut timed_out = Vec::new();
        self.map.retain(|_, p| {
            if now.saturating_sub(p.created) > wait_ns {
                timed_out.push((p.dst_ip, p.mac));
                false
            } else {
                true
            }
        });
        timed_out
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Send-side hold-down: remembers when a reward was last emitted per
/// (destination, upstream) key.
pub struct RewardSends {
    last_sent: HashMap<u32, u64>,
    holdown_ns: u64,
}

impl RewardSends {
    pub fn new(holdown_ns: u64) -> Self {
        RewardSends {
            last_sent: HashMap::new(),
            holdown_ns,
        }
    }

    /// True when a reward should go out now for a frame from `upstream_mac`
    /// toward `dst_ip` (and records the emission time).
    pub fn should_send(&mut self, dst_ip: &IpAddr, upstream_mac: &Mac, now: u64) -> bool {
        let key = reward_hash(dst_ip, upstream_mac);
        match self.last_sent.get(&key) {
            Some(ts) if now.saturating_sub(*ts) <= self.holdown_ns => false,
            _ => {
                self.last_sent.insert(key, now);
                true
            }
        }
    }

    /// Trim stale throttle entries; bounded growth under churn.
    pub fn sweep(&mut self, now: u64) {
        let horizon = self.holdown_ns.saturating_mul(8).max(1);
        self.last_sent
            .retain(|_, ts| now.saturating_sub(*ts) <= horizon);
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }
}
