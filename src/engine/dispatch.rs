// ADHOCD — ENGINE: DISPATCH MODULE
// The packet pipeline. Outbound: tunnel datagram → route (or start
// discovery) → encapsulate → transmit, opening the reward/ARQ bookkeeping on
// the way. Inbound: decode → dispatch by kind to the neighbor, discovery,
// ARQ and reward handlers, or deliver/forward data. The periodic *_tick
// methods are driven by the housekeeping worker and by tests with synthetic
// clocks. All state lives in the Core hub; this module only sequences it.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::engine::codec::{
    build_frame, mac_str, Ack, Broadcast, Hello, Mac, Message, Reward, Rrep, Rreq, Unicast,
    ReliableData, BROADCAST_MAC,
};
use crate::engine::runtime::{arq_hash, reliable_msg_id, reward_hash, Core, Counters};
use crate::network::datapath::TunSink;
use crate::network::ip::{is_flood_destination, parse_datagram, DatagramInfo};
use crate::network::transport::FrameTransport;
use crate::routing::arq::ReliableSendRecord;
use crate::routing::neighbors::HelloOutcome;
use crate::routing::path::EnqueueOutcome;

pub struct Dispatch {
    core: Arc<Core>,
    transport: Arc<dyn FrameTransport>,
    tun: Arc<dyn TunSink>,
}

impl Dispatch {
    pub fn new(core: Arc<Core>, transport: Arc<dyn FrameTransport>, tun: Arc<dyn TunSink>) -> Self {
        Dispatch {
            core,
            transport,
            tun,
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    // ====================================================================
    // OUTBOUND — a datagram appeared at our tunnel
    // ====================================================================

    pub fn handle_outbound(&self, datagram: &[u8], now: u64) {
        Counters::bump(&self.core.counters.tun_rx);
        let Some(info) = parse_datagram(datagram) else {
            Counters::bump(&self.core.counters.unsupported_l3);
            return;
        };

        if is_flood_destination(&info.dst) {
            self.flood(datagram, now);
            return;
        }

        if self.core.table.lock().is_local(&info.dst) {
            // Loopback: the destination is bound to this very node.
            self.tun.deliver(datagram);
            Counters::bump(&self.core.counters.tun_delivered);
            return;
        }

        self.forward_datagram(datagram, &info, 1, now);
    }

    /// Flood a multicast/broadcast datagram with a fresh broadcast id.
    fn flood(&self, datagram: &[u8], _now: u64) {
        let broadcast_id = self.core.next_seq();
        self.core.broadcast_seen.lock().insert(broadcast_id);
        let msg = Message::Broadcast(Broadcast {
            broadcast_id,
            ttl: 1,
            src_node_id: self.core.node_id,
        });
        self.send_message(&BROADCAST_MAC, &msg, datagram);
    }

    /// Route and transmit one datagram, entering path discovery on a miss.
    /// `hops` is the hop budget already consumed (1 for local originations).
    fn forward_datagram(&self, datagram: &[u8], info: &DatagramInfo, hops: u8, now: u64) {
        let cfg = &self.core.cfg;
        if hops > cfg.max_hops {
            Counters::bump(&self.core.counters.ttl_exceeded);
            return;
        }

        let alive = self.core.neighbors.lock().alive_set(now);
        let next_hop = self.core.table.lock().best_action(&info.dst, &alive);

        let Some(mac) = next_hop else {
            Counters::bump(&self.core.counters.no_route);
            self.start_discovery(info.dst, datagram.to_vec(), now);
            return;
        };

        let reliable = cfg.arq_protocols.contains(&info.proto);
        let msg = if reliable {
            let msg_id = reliable_msg_id(&info.src, &info.dst, self.core.next_seq());
            Message::ReliableData(ReliableData {
                msg_id,
                dst_mac: mac,
                src_mac: self.core.node_mac,
            })
        } else {
            Message::Unicast(Unicast {
                ttl: hops,
                dst_mac: mac,
                src_mac: self.core.node_mac,
            })
        };

        let Ok(body) = build_frame(&msg, datagram) else {
            Counters::bump(&self.core.counters.malformed);
            return;
        };

        if let Message::ReliableData(ref r) = msg {
            let hash = arq_hash(r.msg_id, &mac);
            self.core.arq.lock().register(
                hash,
                ReliableSendRecord {
                    frame: body.clone(),
                    dst_mac: mac,
                    dst_ip: info.dst,
                    retries: 0,
                    last_send: now,
                },
            );
        }

        if !self.send_body(&mac, &body) {
            // A failed transmit is a (cheap) negative observation about the
            // chosen neighbor.
            self.core
                .table
                .lock()
                .update(info.dst, mac, cfg.hop_reward_timeout);
        }
        self.core.reward_waits.lock().open(info.dst, mac, now);
        Counters::bump(&self.core.counters.forwarded);
        trace!(dst = %info.dst, via = %mac_str(&mac), reliable, "datagram forwarded");
    }

    /// No route: buffer the datagram and (for a fresh destination) flood an
    /// RREQ stamped with our own address as originator.
    fn start_discovery(&self, dst: IpAddr, datagram: Vec<u8>, now: u64) {
        let deadline = self.core.cfg.rreq_deadline_ns();
        let outcome = self.core.pending.lock().enqueue(dst, datagram, now, deadline, || {
            self.core.next_seq()
        });
        match outcome {
            EnqueueOutcome::SendRreq { rreq_id } => self.issue_rreq(dst, rreq_id),
            EnqueueOutcome::Buffered => {}
            EnqueueOutcome::QueueFull => {
                Counters::bump(&self.core.counters.pending_overflow);
            }
        }
    }

    fn issue_rreq(&self, dst: IpAddr, rreq_id: u32) {
        let src = self.core.table.lock().local_ip_for_family(&dst);
        let Some(src_ip) = src else {
            debug!(%dst, "no local address in destination family; discovery stalled");
            return;
        };
        // Record our own request so the flood echo is dropped on return.
        self.core.seen_rreq.lock().record(src_ip, rreq_id);
        let msg = Message::Rreq(Rreq {
            hop_count: 1,
            dst_ip: dst,
            src_ip,
            rreq_id,
            bcast_id: self.core.next_seq(),
        });
        self.send_message(&BROADCAST_MAC, &msg, &[]);
        info!(%dst, rreq_id, "route discovery started");
    }

    // ====================================================================
    // INBOUND — a frame arrived on the physical interface
    // ====================================================================

    pub fn handle_frame(&self, src_mac: Mac, body: &[u8], now: u64) {
        Counters::bump(&self.core.counters.rx_frames);
        let (msg, consumed) = match Message::decode(body) {
            Ok(ok) => ok,
            Err(crate::engine::codec::CodecError::MalformedHeader) => {
                Counters::bump(&self.core.counters.malformed);
                return;
            }
            Err(crate::engine::codec::CodecError::UnknownKind(tag)) => {
                Counters::bump(&self.core.counters.unknown_kind);
                trace!(tag, "unknown frame kind dropped");
                return;
            }
        };
        let payload = &body[consumed..];

        match msg {
            Message::Hello(h) => self.handle_hello(src_mac, &h, now),
            Message::Broadcast(b) => self.handle_broadcast(&b, payload, now),
            Message::Unicast(u) => self.handle_unicast(src_mac, &u, payload, now),
            Message::ReliableData(r) => self.handle_reliable(src_mac, &r, payload, now),
            Message::Rreq(q) => self.handle_rreq(src_mac, &q, now),
            Message::Rrep(p) => self.handle_rrep(src_mac, &p, now),
            Message::Ack(a) => self.handle_ack(&a),
            Message::Reward(r) => self.handle_reward(&r),
        }
    }

    fn handle_hello(&self, src_mac: Mac, hello: &Hello, now: u64) {
        if src_mac == self.core.node_mac {
            warn!(mac = %mac_str(&src_mac), "neighbor advertises our own MAC");
            return;
        }
        let outcome = self.core.neighbors.lock().process_hello(src_mac, hello, now);
        let addrs = match outcome {
            HelloOutcome::New(addrs) => {
                info!(mac = %mac_str(&src_mac), ?addrs, "new neighbor");
                addrs
            }
            HelloOutcome::Readdressed(addrs) => addrs,
            HelloOutcome::Refreshed => return,
        };
        // Direct neighbors are one-hop routes to their advertised addresses.
        let reward = self.core.cfg.neighbor_reward;
        let mut table = self.core.table.lock();
        for ip in addrs {
            table.update(ip, src_mac, reward);
        }
    }

    fn handle_broadcast(&self, b: &Broadcast, payload: &[u8], _now: u64) {
        if b.src_node_id == self.core.node_id {
            return;
        }
        if !self.core.broadcast_seen.lock().insert(b.broadcast_id) {
            Counters::bump(&self.core.counters.broadcast_dup);
            return;
        }
        if b.ttl > self.core.cfg.max_broadcast_ttl {
            return;
        }
        self.tun.deliver(payload);
        Counters::bump(&self.core.counters.tun_delivered);
        let msg = Message::Broadcast(Broadcast {
            broadcast_id: b.broadcast_id,
            ttl: b.ttl.saturating_add(1),
            src_node_id: b.src_node_id,
        });
        self.send_message(&BROADCAST_MAC, &msg, payload);
    }

    fn handle_unicast(&self, src_mac: Mac, u: &Unicast, payload: &[u8], now: u64) {
        if u.dst_mac != self.core.node_mac {
            return;
        }
        let Some(info) = parse_datagram(payload) else {
            Counters::bump(&self.core.counters.unsupported_l3);
            return;
        };
        self.maybe_send_reward(&info.dst, &src_mac, now);

        if self.core.table.lock().is_local(&info.dst) {
            self.tun.deliver(payload);
            Counters::bump(&self.core.counters.tun_delivered);
        } else {
            self.forward_datagram(payload, &info, u.ttl.saturating_add(1), now);
        }
    }

    fn handle_reliable(&self, src_mac: Mac, r: &ReliableData, payload: &[u8], now: u64) {
        if r.dst_mac != self.core.node_mac {
            return;
        }
        // ACK in all cases, duplicates included; the sender's record is
        // keyed by the hash over (msg_id, our MAC).
        let ack = Message::Ack(Ack {
            msg_id: arq_hash(r.msg_id, &self.core.node_mac),
            tx_mac: self.core.node_mac,
        });
        self.send_message(&src_mac, &ack, &[]);

        if !self.core.arq.lock().note_received(src_mac, r.msg_id) {
            Counters::bump(&self.core.counters.reliable_dup);
            return;
        }
        let Some(info) = parse_datagram(payload) else {
            Counters::bump(&self.core.counters.unsupported_l3);
            return;
        };
        self.maybe_send_reward(&info.dst, &src_mac, now);

        if self.core.table.lock().is_local(&info.dst) {
            self.tun.deliver(payload);
            Counters::bump(&self.core.counters.tun_delivered);
        } else {
            self.forward_datagram(payload, &info, 1, now);
        }
    }

    fn handle_rreq(&self, src_mac: Mac, q: &Rreq, now: u64) {
        if self.core.table.lock().is_local(&q.src_ip) {
            // Our own request echoed back through the flood.
            return;
        }
        if !self.core.seen_rreq.lock().record(q.src_ip, q.rreq_id) {
            Counters::bump(&self.core.counters.rreq_dup);
            return;
        }
        // Reverse route toward the requester, weighted down by distance.
        let reward = self.core.cfg.rreq_reward_base / f64::from(q.hop_count.max(1));
        self.core.table.lock().update(q.src_ip, src_mac, reward);

        if self.core.table.lock().is_local(&q.dst_ip) {
            let rrep = Message::Rrep(Rrep {
                hop_count: 1,
                dst_ip: q.src_ip,
                src_ip: q.dst_ip,
                tx_mac: self.core.node_mac,
            });
            // Reply straight back along the hop the request arrived from.
            debug!(requester = %q.src_ip, via = %mac_str(&src_mac), "answering RREQ");
            self.send_message(&src_mac, &rrep, &[]);
            return;
        }

        if q.hop_count >= self.core.cfg.max_hops {
            Counters::bump(&self.core.counters.ttl_exceeded);
            return;
        }
        let fwd = Message::Rreq(Rreq {
            hop_count: q.hop_count + 1,
            ..q.clone()
        });
        self.send_message(&BROADCAST_MAC, &fwd, &[]);
    }

    fn handle_rrep(&self, src_mac: Mac, p: &Rrep, now: u64) {
        // The RREP's originator is the discovered destination; the frame's
        // upstream is our next hop toward it.
        let reward = self.core.cfg.rreq_reward_base / f64::from(p.hop_count.max(1));
        self.core.table.lock().update(p.src_ip, src_mac, reward);

        if self.core.table.lock().is_local(&p.dst_ip) {
            let drained = self.core.pending.lock().resolve(&p.src_ip);
            if let Some(packets) = drained {
                info!(dst = %p.src_ip, n = packets.len(), "route resolved, draining buffer");
                for pkt in packets {
                    if let Some(info) = parse_datagram(&pkt) {
                        self.forward_datagram(&pkt, &info, 1, now);
                    }
                }
            }
            return;
        }

        if p.hop_count >= self.core.cfg.max_hops {
            Counters::bump(&self.core.counters.ttl_exceeded);
            return;
        }
        // Forward toward the requester along the reverse-path entry this
        // node installed when the RREQ passed through.
        let alive = self.core.neighbors.lock().alive_set(now);
        let next = self.core.table.lock().best_action(&p.dst_ip, &alive);
        let Some(next) = next else {
            Counters::bump(&self.core.counters.no_route);
            return;
        };
        let fwd = Message::Rrep(Rrep {
            hop_count: p.hop_count + 1,
            tx_mac: self.core.node_mac,
            ..p.clone()
        });
        self.send_message(&next, &fwd, &[]);
    }

    fn handle_ack(&self, a: &Ack) {
        if let Some((dst_ip, mac)) = self.core.arq.lock().process_ack(a.msg_id) {
            let reward = self.core.cfg.arq_ok_reward;
            self.core.table.lock().update(dst_ip, mac, reward);
            trace!(dst = %dst_ip, via = %mac_str(&mac), "reliable frame acked");
        }
    }

    fn handle_reward(&self, r: &Reward) {
        if let Some((dst_ip, mac)) = self
            .core
            .reward_waits
            .lock()
            .settle(r.msg_hash, r.neighbor_mac)
        {
            self.core
                .table
                .lock()
                .update(dst_ip, mac, f64::from(r.reward_value));
        }
    }

    /// Send-side reward: tell the upstream node how much progress this node
    /// believes it offers toward the destination.
    fn maybe_send_reward(&self, dst_ip: &IpAddr, upstream: &Mac, now: u64) {
        if !self
            .core
            .reward_sends
            .lock()
            .should_send(dst_ip, upstream, now)
        {
            return;
        }
        let value = self.core.table.lock().avg_value(dst_ip);
        let msg = Message::Reward(Reward {
            reward_value: value as f32,
            msg_hash: reward_hash(dst_ip, &self.core.node_mac),
            neighbor_mac: self.core.node_mac,
        });
        self.send_message(upstream, &msg, &[]);
    }

    // ====================================================================
    // PERIODIC TICKS (housekeeping worker / tests)
    // ====================================================================

    pub fn send_hello(&self, hello: Hello) {
        let msg = Message::Hello(hello);
        self.send_message(&BROADCAST_MAC, &msg, &[]);
    }

    pub fn neighbor_sweep(&self, now: u64) {
        let expired = self.core.neighbors.lock().sweep(now);
        if expired.is_empty() {
            return;
        }
        let mut table = self.core.table.lock();
        for mac in &expired {
            info!(mac = %mac_str(mac), "neighbor expired");
            table.drop_neighbor(mac);
        }
    }

    pub fn arq_tick(&self, now: u64) {
        let (resend, exhausted) = self.core.arq.lock().due(now);
        for r in resend {
            Counters::bump(&self.core.counters.arq_retx);
            self.send_body(&r.dst_mac, &r.frame);
        }
        if !exhausted.is_empty() {
            let reward = self.core.cfg.arq_fail_reward;
            let mut table = self.core.table.lock();
            for e in exhausted {
                Counters::bump(&self.core.counters.arq_exhausted);
                debug!(via = %mac_str(&e.dst_mac), "reliable send exhausted retries");
                table.update(e.dst_ip, e.dst_mac, reward);
            }
        }
    }

    pub fn reward_tick(&self, now: u64) {
        let timed_out = self.core.reward_waits.lock().sweep(now);
        if !timed_out.is_empty() {
            let reward = self.core.cfg.hop_reward_timeout;
            let mut table = self.core.table.lock();
            for (dst_ip, mac) in timed_out {
                table.update(dst_ip, mac, reward);
            }
        }
        self.core.reward_sends.lock().sweep(now);
    }

    pub fn pending_tick(&self, now: u64) {
        let dropped = self.core.pending.lock().sweep(now);
        for _ in 0..dropped {
            Counters::bump(&self.core.counters.pending_expired);
        }
    }

    // ====================================================================
    // TRANSMIT HELPERS
    // ====================================================================

    fn send_message(&self, dst_mac: &Mac, msg: &Message, payload: &[u8]) -> bool {
        match build_frame(msg, payload) {
            Ok(body) => self.send_body(dst_mac, &body),
            Err(e) => {
                warn!(error = %e, "frame build failed");
                false
            }
        }
    }

    fn send_body(&self, dst_mac: &Mac, body: &[u8]) -> bool {
        match self.transport.send_frame(dst_mac, body) {
            Ok(()) => {
                Counters::bump(&self.core.counters.tx_frames);
                true
            }
            Err(e) => {
                Counters::bump(&self.core.counters.send_errors);
                debug!(dst = %mac_str(dst_mac), error = %e, "frame send failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::network::datapath::ChannelSink;
    use crate::network::transport::VirtualSwitch;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const MAC_A: Mac = [0x02, 0, 0, 0, 0, 0x0A];
    const MAC_B: Mac = [0x02, 0, 0, 0, 0, 0x0B];
    const SEC: u64 = 1_000_000_000;

    fn v4(src: [u8; 4], dst: [u8; 4], proto: u8) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        pkt[9] = proto;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt
    }

    fn node(
        switch: &std::sync::Arc<VirtualSwitch>,
        mac: Mac,
        ip: &str,
    ) -> (Dispatch, crossbeam_channel::Receiver<Vec<u8>>) {
        let core = Arc::new(Core::new(Config::default(), mac));
        core.table
            .lock()
            .set_local_ips(mac, vec![ip.parse().unwrap()]);
        let port = switch.attach(mac, Duration::from_millis(2));
        let (sink, rx) = ChannelSink::new();
        (
            Dispatch::new(core, Arc::new(port), Arc::new(sink)),
            rx,
        )
    }

    /// Drain frames between two dispatchers until quiescent.
    fn pump(a: &Dispatch, b: &Dispatch, now: u64) {
        let mut buf = [0u8; 2048];
        loop {
            let mut moved = false;
            for d in [a, b] {
                while let Ok(Some((src, n))) = d.transport.recv_frame(&mut buf) {
                    d.handle_frame(src, &buf[..n], now);
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn hello_installs_neighbor_and_seed_routes() {
        let sw = VirtualSwitch::new();
        let (a, _arx) = node(&sw, MAC_A, "10.0.0.1");
        let (b, _brx) = node(&sw, MAC_B, "10.0.0.2");
        let hello = Hello {
            node_id: b.core.node_id,
            tx_count: 0,
            ipv4: Some("10.0.0.2".parse().unwrap()),
            ipv6: None,
        };
        b.send_hello(hello);
        pump(&a, &b, SEC);
        assert_eq!(a.core.neighbors.lock().len(), 1);
        assert!(a.core.table.lock().avg_value(&"10.0.0.2".parse().unwrap()) > 0.0);
    }

    #[test]
    fn unicast_delivers_to_local_tun_and_rewards_upstream() {
        let sw = VirtualSwitch::new();
        let (a, _arx) = node(&sw, MAC_A, "10.0.0.1");
        let (b, brx) = node(&sw, MAC_B, "10.0.0.2");
        // A learns B directly so the datagram routes without discovery.
        for (tx, rx_side) in [(&b, &a), (&a, &b)] {
            let hello = Hello {
                node_id: tx.core.node_id,
                tx_count: 0,
                ipv4: Some(if tx.core.node_mac == MAC_A {
                    "10.0.0.1".parse().unwrap()
                } else {
                    "10.0.0.2".parse().unwrap()
                }),
                ipv6: None,
            };
            tx.send_hello(hello);
            pump(tx, rx_side, SEC);
        }
        let datagram = v4([10, 0, 0, 1], [10, 0, 0, 2], 17);
        a.handle_outbound(&datagram, SEC);
        pump(&a, &b, SEC);
        assert_eq!(brx.try_recv().unwrap(), datagram);
        // B emitted a reward; A settled the matching wait.
        assert!(a.core.reward_waits.lock().is_empty());
    }

    #[test]
    fn malformed_and_unknown_frames_only_bump_counters() {
        let sw = VirtualSwitch::new();
        let (a, _arx) = node(&sw, MAC_A, "10.0.0.1");
        a.handle_frame(MAC_B, &[], SEC);
        a.handle_frame(MAC_B, &[0x0F, 1, 2, 3], SEC);
        assert_eq!(a.core.counters.malformed.load(Ordering::Relaxed), 1);
        assert_eq!(a.core.counters.unknown_kind.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn loopback_short_circuits_to_tun() {
        let sw = VirtualSwitch::new();
        let (a, arx) = node(&sw, MAC_A, "10.0.0.1");
        let datagram = v4([10, 0, 0, 9], [10, 0, 0, 1], 17);
        a.handle_outbound(&datagram, SEC);
        assert_eq!(arx.try_recv().unwrap(), datagram);
        assert_eq!(a.core.counters.tx_frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn missing_route_starts_single_discovery() {
        let sw = VirtualSwitch::new();
        let (a, _arx) = node(&sw, MAC_A, "10.0.0.1");
        let d1 = v4([10, 0, 0, 1], [10, 0, 0, 9], 17);
        let d2 = v4([10, 0, 0, 1], [10, 0, 0, 9], 17);
        a.handle_outbound(&d1, SEC);
        a.handle_outbound(&d2, SEC + 1);
        let pending = a.core.pending.lock();
        assert_eq!(pending.len(), 1);
        // Both datagrams buffered under the single discovery.
        assert!(pending.contains(&"10.0.0.9".parse().unwrap()));
    }
}
