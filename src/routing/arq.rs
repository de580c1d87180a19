// ADHOCD — ROUTING: ARQ
// Stop-and-wait reliability for RELIABLE_DATA frames. One record per unacked
// frame; a single periodic retransmitter scans the record set instead of a
// timer per message. Receive-side duplicate suppression is a bounded set of
// (sender, msg_id) pairs.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::engine::codec::Mac;
use crate::engine::runtime::SeenSet;

/// One in-flight reliable frame, keyed by its 32-bit message hash.
#[derive(Debug, Clone)]
pub struct ReliableSendRecord {
    /// Full frame body (header + payload), resent verbatim.
    pub frame: Vec<u8>,
    pub dst_mac: Mac,
    /// Destination the reward is attributed to on success/exhaustion.
    pub dst_ip: IpAddr,
    pub retries: u32,
    pub last_send: u64,
}

/// A frame due for retransmission this tick.
pub struct Retransmit {
    pub msg_hash: u32,
    pub frame: Vec<u8>,
    pub dst_mac: Mac,
}

/// A record that exhausted its retries; the caller applies the failure
/// reward and nothing else survives.
pub struct Exhausted {
    pub dst_ip: IpAddr,
    pub dst_mac: Mac,
}

pub struct ArqState {
    records: HashMap<u32, ReliableSendRecord>,
    seen_rx: SeenSet<(Mac, u32)>,
    retry_ns: u64,
    max_retries: u32,
}

impl ArqState {
    pub fn new(retry_ns: u64, max_retries: u32, seen_cap: usize) -> Self {
        ArqState {
            records: HashMap::new(),
            seen_rx: SeenSet::new(seen_cap),
            retry_ns,
            max_retries,
        }
    }

    /// Track a freshly sent frame. The first transmission already happened;
    /// the record exists so the sweeper can retry and eventually give up.
    pub fn register(&mut self, msg_hash: u32, record: ReliableSendRecord) {
        self.records.insert(msg_hash, record);
    }

    /// ACK reception. Returns the (dst_ip, mac) pair for the positive reward
    /// when the hash matched a live record; unknown hashes are ignored.
    pub fn process_ack(&mut self, msg_hash: u32) -> Option<(IpAddr, Mac)> {
        self.records.remove(&msg_hash).map(|r| (r.dst_ip, r.dst_mac))
    }

    /// Scan the record set: frames past the retry interval are handed back
    /// for resend; records past the retry budget are purged and reported.
    pub fn due(&mut self, now: u64) -> (Vec<Retransmit>, Vec<Exhausted>) {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        let retry_ns = self.retry_ns;
        let max_retries = self.max_retries;
        self.records.retain(|hash, rec| {
            if now.saturating_sub(rec.last_send) < retry_ns {
                return true;
            }
            if rec.retries >= max_retries {
                exhausted.push(Exhausted {
                    dst_ip: rec.dst_ip,
                    dst_mac: rec.dst_mac,
                });
                return false;
            }
            rec.retries += 1;
            rec.last_send = now;
            resend.push(Retransmit {
                msg_hash: *hash,
                frame: rec.frame.clone(),
                dst_mac: rec.dst_mac,
            });
            true
        });
        (resend, exhausted)
    }

    /// Receive-side dedup. True when this (sender, msg_id) is fresh and the
    /// payload should be delivered; false for a duplicate (still ACKed).
    pub fn note_received(&mut self, src_mac: Mac, msg_id: u32) -> bool {
        self.seen_rx.insert((src_mac, msg_id))
    }

    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    pub fn has_record(&self, msg_hash: u32) -> bool {
        self.records.contains_key(&msg_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M1: Mac = [0, 0, 0, 0, 0, 1];
    const SEC: u64 = 1_000_000_000;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn record(now: u64) -> ReliableSendRecord {
        ReliableSendRecord {
            frame: vec![9, 9, 9],
            dst_mac: M1,
            dst_ip: ip("10.0.0.2"),
            retries: 0,
            last_send: now,
        }
    }

    #[test]
    fn ack_clears_record_and_reports_target() {
        let mut arq = ArqState::new(SEC / 2, 5, 16);
        arq.register(42, record(0));
        assert_eq!(arq.in_flight(), 1);
        assert_eq!(arq.process_ack(42), Some((ip("10.0.0.2"), M1)));
        assert_eq!(arq.in_flight(), 0);
        assert_eq!(arq.process_ack(42), None);
    }

    #[test]
    fn due_respects_retry_interval() {
        let mut arq = ArqState::new(SEC / 2, 5, 16);
        arq.register(42, record(0));
        let (resend, exhausted) = arq.due(SEC / 4);
        assert!(resend.is_empty() && exhausted.is_empty());
        let (resend, exhausted) = arq.due(SEC / 2);
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].msg_hash, 42);
        assert!(exhausted.is_empty());
        // Just resent: not due again immediately.
        let (resend, _) = arq.due(SEC / 2 + 1);
        assert!(resend.is_empty());
    }

    #[test]
    fn bounded_retries_then_exhaustion() {
        let max = 3;
        let mut arq = ArqState::new(SEC / 2, max, 16);
        arq.register(42, record(0));
        let mut now = 0;
        let mut resends = 0;
        loop {
            now += SEC / 2;
            let (resend, exhausted) = arq.due(now);
            resends += resend.len();
            if !exhausted.is_empty() {
                assert_eq!(exhausted[0].dst_mac, M1);
                break;
            }
            assert!(now < 10 * SEC, "never exhausted");
        }
        assert_eq!(resends as u32, max);
        assert_eq!(arq.in_flight(), 0);
        // No record lives past max_retries × interval + one sweep.
    }

    #[test]
    fn rx_dedup_is_per_sender() {
        let mut arq = ArqState::new(SEC, 5, 16);
        const M2: Mac = [0, 0, 0, 0, 0, 2];
        assert!(arq.note_received(M1, 7));
        assert!(!arq.note_received(M1, 7));
        assert!(arq.note_received(M2, 7));
        assert!(arq.note_received(M1, 8));
    }
}
