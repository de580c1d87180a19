// ADHOCD — ROUTING: ROUTE TABLE
// Destination IP → per-neighbor value estimates. The policy (softmax over
// values) is derived on demand; nothing about the distribution is stored.
// The table is the hub of the daemon: every component mutates routing
// knowledge exclusively through `update`/`add_route` here.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::config::Config;
use crate::engine::codec::Mac;
use crate::routing::agent::{ActionSelector, ValueEstimator};

/// One learned action value. `steps` counts applied rewards, for inspection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstValue {
    pub value: f64,
    pub steps: u32,
}

/// Value record for one destination. The underlying map is private; callers
/// go through the entry's operations.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    actions: HashMap<Mac, EstValue>,
}

impl Entry {
    fn update(&mut self, mac: Mac, reward: f64, est: &ValueEstimator) {
        let slot = self.actions.entry(mac).or_insert(EstValue {
            value: est.v_init,
            steps: 0,
        });
        slot.value = est.estimate(slot.value, reward);
        slot.steps += 1;
    }

    fn ensure(&mut self, mac: Mac, v_init: f64) {
        self.actions.entry(mac).or_insert(EstValue {
            value: v_init,
            steps: 0,
        });
    }

    fn remove_action(&mut self, mac: &Mac) {
        self.actions.remove(mac);
    }

    /// Mean over the entry's current values; 0 when empty.
    pub fn avg_value(&self) -> f64 {
        if self.actions.is_empty() {
            return 0.0;
        }
        self.actions.values().map(|e| e.value).sum::<f64>() / self.actions.len() as f64
    }

    pub fn value_of(&self, mac: &Mac) -> Option<f64> {
        self.actions.get(mac).map(|e| e.value)
    }

    pub fn actions(&self) -> impl Iterator<Item = (&Mac, &EstValue)> {
        self.actions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

pub struct RouteTable {
    entries: HashMap<IpAddr, Entry>,
    local_ips: Vec<IpAddr>,
    selector: ActionSelector,
    estimator: ValueEstimator,
    self_reward: f64,
}

impl RouteTable {
    pub fn new(cfg: &Config) -> Self {
        RouteTable {
            entries: HashMap::new(),
            local_ips: Vec::new(),
            selector: ActionSelector::new(cfg),
            estimator: ValueEstimator::new(cfg),
            self_reward: cfg.self_reward,
        }
    }

    /// Register this node's own tunnel addresses. Each gets a self-route so
    /// downstream nodes observing our mean value toward it see a strong
    /// positive signal (the destination itself is the best place to be).
    pub fn set_local_ips(&mut self, node_mac: Mac, ips: Vec<IpAddr>) {
        for ip in &ips {
            self.update(*ip, node_mac, self.self_reward);
        }
        self.local_ips = ips;
    }

    pub fn is_local(&self, ip: &IpAddr) -> bool {
        self.local_ips.contains(ip)
    }

    pub fn local_ips(&self) -> &[IpAddr] {
        &self.local_ips
    }

    /// The node's own address in the same family as `ip`, for RREQ stamping.
    pub fn local_ip_for_family(&self, ip: &IpAddr) -> Option<IpAddr> {
        self.local_ips
            .iter()
            .find(|l| l.is_ipv4() == ip.is_ipv4())
            .copied()
    }

    /// Sample a next hop for `dst` from the softmax over the entry's values,
    /// restricted to currently-alive neighbors. Alive neighbors the entry has
    /// not seen yet join at `V_INIT`; dead neighbors are pruned. None when no
    /// entry exists or every referenced neighbor is dead.
    pub fn best_action(&mut self, dst: &IpAddr, alive: &HashSet<Mac>) -> Option<Mac> {
        let entry = self.entries.get_mut(dst)?;
        // Sync the action set with the live neighbor set before selection.
        let stale: Vec<Mac> = entry
            .actions
            .keys()
            .filter(|m| !alive.contains(*m))
            .copied()
            .collect();
        for mac in stale {
            entry.remove_action(&mac);
        }
        for mac in alive {
            entry.ensure(*mac, self.estimator.v_init);
        }
        let candidates: Vec<(Mac, f64)> = entry
            .actions
            .iter()
            .map(|(mac, est)| (*mac, est.value))
            .collect();
        self.selector.select(&candidates)
    }

    /// Apply `reward` to `(dst, mac)`, creating the entry/action as needed.
    pub fn update(&mut self, dst: IpAddr, mac: Mac, reward: f64) {
        self.entries
            .entry(dst)
            .or_default()
            .update(mac, reward, &self.estimator);
    }

    /// Ensure an entry exists with an action for `mac` at `V_INIT`.
    pub fn add_route(&mut self, dst: IpAddr, mac: Mac) {
        self.entries
            .entry(dst)
            .or_default()
            .ensure(mac, self.estimator.v_init);
    }

    pub fn has_entry(&self, dst: &IpAddr) -> bool {
        self.entries.contains_key(dst)
    }

    pub fn entry(&self, dst: &IpAddr) -> Option<&Entry> {
        self.entries.get(dst)
    }

    /// Mean estimate toward `dst`; 0 with no entry. Feeds outgoing rewards.
    pub fn avg_value(&self, dst: &IpAddr) -> f64 {
        self.entries.get(dst).map(|e| e.avg_value()).unwrap_or(0.0)
    }

    /// Purge a dead neighbor from every entry. Entries left empty persist;
    /// they simply yield no action until a neighbor re-learns them.
    pub fn drop_neighbor(&mut self, mac: &Mac) {
        for entry in self.entries.values_mut() {
            entry.remove_action(mac);
        }
    }

    /// Softmax probability the policy currently assigns to `mac` for `dst`.
    pub fn policy_probability(&self, dst: &IpAddr, mac: &Mac) -> f64 {
        let Some(entry) = self.entries.get(dst) else {
            return 0.0;
        };
        let candidates: Vec<(Mac, f64)> = entry
            .actions
            .iter()
            .map(|(m, est)| (*m, est.value))
            .collect();
        self.selector.probability_of(&candidates, mac)
    }

    /// Deep-copied view for the IPC dump.
    pub fn snapshot(&self) -> Vec<(IpAddr, Vec<(Mac, f64, u32)>)> {
        let mut out: Vec<(IpAddr, Vec<(Mac, f64, u32)>)> = self
            .entries
            .iter()
            .map(|(ip, entry)| {
                let mut actions: Vec<(Mac, f64, u32)> = entry
                    .actions
                    .iter()
                    .map(|(mac, est)| (*mac, est.value, est.steps))
                    .collect();
                actions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                (*ip, actions)
            })
            .collect();
        out.sort_by_key(|(ip, _)| ip.to_string());
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
