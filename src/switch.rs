//! Per-switch MTP protocol logic: the VID propagation handshake, keep-alive
//! liveness, failure/recover flooding, and data-plane forwarding. All
//! handlers run on the single event-loop thread and emit frames through a
//! `FrameSink`, so the protocol is exercised in tests without raw sockets.

use std::io;

use fxhash::FxHashSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::netif;
use crate::tables::{
    push_unique, remove_vid, ComputePort, ControlPort, FailType, PortId, SwitchTables,
};
use crate::wire::{
    data_msg_hash_key, data_msg_vids, ipv4_hash_key, jenkins_one_at_a_time, Message,
    DATA_HDR_LEN, MAX_BUFFER_SIZE, MTP_TYPE_DATA_MSG, MTP_TYPE_KEEP_ALIVE,
    MTP_TYPE_START_HELLO, REACHABLE_OPTION, UNREACHABLE_OPTION,
};

pub const HELLO_TIMER_MS: i64 = 500;
pub const DEAD_TIMER_MS: i64 = 1500;

/// Consecutive on-time keep-alives required to bring a failed port back.
pub const RECOVER_COUNT: u8 = 3;

/// Egress abstraction over the raw send socket. The production sink stamps
/// the port's prebuilt Ethernet header in front of the payload and writes
/// the frame out; tests record the payloads instead.
pub trait FrameSink {
    fn send(&mut self, port: &ControlPort, payload: &[u8]) -> io::Result<()>;
    fn send_compute(&mut self, port: &ComputePort, payload: &[u8]) -> io::Result<()>;
}

pub struct Switch {
    pub node_name: String,
    pub cfg: Config,
    /// Root VID for leaves; empty on spines.
    pub my_vid: String,
    pub vid_octet: u8,
    pub tables: SwitchTables,
    pub compute: Option<ComputePort>,
}

impl Switch {
    pub fn new(
        node_name: String,
        cfg: Config,
        my_vid: String,
        vid_octet: u8,
        tables: SwitchTables,
        compute: Option<ComputePort>,
    ) -> Self {
        Switch { node_name, cfg, my_vid, vid_octet, tables, compute }
    }

    /// Leaf bootstrap: announce the root VID on every control port.
    pub fn start_hello_wave(&mut self, sink: &mut dyn FrameSink) {
        let hello = Message::HelloNr {
            tier: self.cfg.tier,
            vids: vec![self.my_vid.clone()],
        };
        for port in 0..self.tables.control.len() {
            info!("sending HelloNR on port {}", self.tables.control[port].name);
            self.send(port, &hello, sink);
        }
    }

    /// Dispatch one received MTP payload (the bytes after the Ethernet
    /// header) from control port `port`.
    pub fn handle_frame(&mut self, port: PortId, mtp: &[u8], now: i64, sink: &mut dyn FrameSink) {
        let Some(&msg_type) = mtp.first() else {
            return;
        };
        // data and keep-alive are the hot path; skip the full decode
        match msg_type {
            MTP_TYPE_DATA_MSG => return self.handle_data(port, mtp, now, sink),
            MTP_TYPE_KEEP_ALIVE => return self.handle_keep_alive(port, now, sink),
            MTP_TYPE_START_HELLO => return self.handle_start_hello(port),
            _ => {}
        }
        match Message::decode(mtp) {
            Some(Message::HelloNr { tier, vids }) => self.handle_hello_nr(port, tier, &vids, sink),
            Some(Message::JoinReq { vids }) => self.handle_join_req(port, &vids, sink),
            Some(Message::JoinRes { vids }) => self.handle_join_res(port, &vids, sink),
            Some(Message::JoinAck { vids }) => self.handle_join_ack(port, &vids, sink),
            Some(Message::FailureUpdate { option, vids }) => {
                self.handle_failure_update(port, option, &vids, sink)
            }
            Some(Message::RecoverUpdate { option, vids }) => {
                self.handle_recover_update(port, option, &vids, sink)
            }
            _ => debug!(
                "dropped undecodable MTP frame (type {}) on port {}",
                msg_type, self.tables.control[port].name
            ),
        }
    }

    fn handle_hello_nr(&mut self, port: PortId, tier: u8, vids: &[String], sink: &mut dyn FrameSink) {
        // adjacencies form bottom-up only
        if tier >= self.cfg.tier {
            debug!("ignoring HelloNR from tier {} (own tier {})", tier, self.cfg.tier);
            return;
        }
        info!("HelloNR received on port {}", self.tables.control[port].name);
        self.send(port, &Message::JoinReq { vids: vids.to_vec() }, sink);
    }

    fn handle_join_req(&mut self, port: PortId, vids: &[String], sink: &mut dyn FrameSink) {
        info!("JoinReq received on port {}", self.tables.control[port].name);
        // extend each VID with this port's interface number
        let suffix = netif::eth_suffix(&self.tables.control[port].name);
        let extended: Vec<String> = vids
            .iter()
            .map(|v| match suffix {
                Some(s) => format!("{v}.{s}"),
                None => v.clone(),
            })
            .collect();
        self.send(port, &Message::JoinRes { vids: extended }, sink);
    }

    fn handle_join_res(&mut self, port: PortId, vids: &[String], sink: &mut dyn FrameSink) {
        info!("JoinRes received on port {}", self.tables.control[port].name);
        for vid in vids {
            self.tables.learn_accepted(port, vid);
        }
        self.dump_accepted();

        // propagate the wave upward before acknowledging
        if !self.cfg.is_top_spine {
            let hello = Message::HelloNr { tier: self.cfg.tier, vids: vids.to_vec() };
            for p in 0..self.tables.control.len() {
                self.send(p, &hello, sink);
            }
        }
        self.send(port, &Message::JoinAck { vids: vids.to_vec() }, sink);
    }

    fn handle_join_ack(&mut self, port: PortId, vids: &[String], sink: &mut dyn FrameSink) {
        info!("JoinAck received on port {}", self.tables.control[port].name);
        let newly_offered = self.tables.offered_idx(port).is_none();
        for vid in vids {
            self.tables.learn_offered(port, vid);
        }
        self.dump_offered();

        if newly_offered {
            let p = &mut self.tables.control[port];
            p.is_up = true;
            p.start = true;
            info!("port {} up, session started toward upstream", p.name);
        }
        self.send(port, &Message::StartHello, sink);
    }

    fn handle_start_hello(&mut self, port: PortId) {
        let p = &mut self.tables.control[port];
        p.is_up = true;
        p.start = true;
        info!("port {} up, session started toward downstream", p.name);
    }

    fn handle_keep_alive(&mut self, port: PortId, now: i64, sink: &mut dyn FrameSink) {
        {
            let p = &mut self.tables.control[port];
            match p.fail_type {
                // physically-failed ports ignore keep-alives until the
                // interface is seen again
                FailType::Detect => return,
                FailType::Miss => p.fail_type = FailType::None,
                FailType::None => {}
            }
        }

        let counting = {
            let p = &self.tables.control[port];
            !p.is_up
                && now - p.last_received_ms < DEAD_TIMER_MS
                && p.continue_count < RECOVER_COUNT
        };
        if counting {
            let count = {
                let p = &mut self.tables.control[port];
                p.continue_count += 1;
                p.continue_count
            };
            info!(
                "on-time keep-alive {}/{} on down port {}",
                count, RECOVER_COUNT, self.tables.control[port].name
            );
            if count == RECOVER_COUNT {
                self.flood_recover(port, sink);
            }
        }

        self.tables.control[port].last_received_ms = now;
    }

    /// Periodic pass: immediate link detection, keep-alive miss detection,
    /// and keep-alive emission for every started port. `live` is a fresh
    /// snapshot of this node's present control interfaces.
    pub fn tick(&mut self, now: i64, live: &FxHashSet<String>, sink: &mut dyn FrameSink) {
        for port in 0..self.tables.control.len() {
            if !self.tables.control[port].start {
                continue;
            }

            // detectors only engage once the port has received something
            if self.tables.control[port].last_received_ms > 0 {
                let alive = live.contains(self.tables.control[port].name.as_str());
                if !alive && self.tables.control[port].is_up {
                    {
                        let p = &mut self.tables.control[port];
                        p.is_up = false;
                        p.fail_type = FailType::Detect;
                        p.continue_count = 0;
                        warn!("port {} vanished, shutting it down", p.name);
                    }
                    self.flood_failure(port, sink);
                } else if alive && self.tables.control[port].fail_type == FailType::Detect {
                    self.tables.control[port].fail_type = FailType::None;
                    info!("port {} is present again", self.tables.control[port].name);
                }

                let missed = {
                    let p = &self.tables.control[port];
                    p.fail_type == FailType::None
                        && p.is_up
                        && now - p.last_received_ms >= DEAD_TIMER_MS
                };
                if missed {
                    {
                        let p = &mut self.tables.control[port];
                        p.is_up = false;
                        p.fail_type = FailType::Miss;
                        p.continue_count = 0;
                        warn!(
                            "port {} disabled, no keep-alive since {}",
                            p.name, p.last_received_ms
                        );
                    }
                    self.flood_failure(port, sink);
                }
            }

            if now - self.tables.control[port].last_sent_ms >= HELLO_TIMER_MS {
                let sent = sink
                    .send(&self.tables.control[port], &[MTP_TYPE_KEEP_ALIVE])
                    .is_ok();
                if sent {
                    self.tables.control[port].last_sent_ms = now;
                }
            }
        }
    }

    /// Scoped unreachability flood after `failed` went down. The failed
    /// port is already marked down, so the send loops skip it.
    fn flood_failure(&self, failed: PortId, sink: &mut dyn FrameSink) {
        if !self.cfg.is_top_spine && self.tables.all_offered_down() {
            // isolated from the core: everything below is still reachable
            // through this subtree
            info!("all upstream ports down, advertising accepted VIDs as reachable downstream");
            let msg = Message::FailureUpdate {
                option: REACHABLE_OPTION,
                vids: self.tables.all_accepted_roots(),
            };
            for i in 0..self.tables.accepted.len() {
                let p = self.tables.accepted[i].port;
                if self.tables.control[p].is_up {
                    self.send(p, &msg, sink);
                }
            }
        } else if self.tables.accepted_idx(failed).is_some() {
            info!("failure on downstream port {}", self.tables.control[failed].name);
            let msg = Message::FailureUpdate {
                option: UNREACHABLE_OPTION,
                vids: self.tables.accepted_roots_on(failed),
            };
            for p in 0..self.tables.control.len() {
                if self.tables.control[p].is_up {
                    self.send(p, &msg, sink);
                }
            }
        } else {
            info!("failure on upstream port {}", self.tables.control[failed].name);
            if self.tables.any_offered_clean() {
                debug!("an upstream port is still clean, nothing to flood");
                return;
            }
            let vids = self.tables.offered_unreachable_roots();
            if vids.is_empty() {
                return;
            }
            let msg = Message::FailureUpdate { option: UNREACHABLE_OPTION, vids };
            for i in 0..self.tables.offered.len() {
                let p = self.tables.offered[i].port;
                if self.tables.control[p].is_up {
                    self.send(p, &msg, sink);
                }
            }
        }
    }

    /// Reachability flood after `port` saw three consecutive on-time
    /// keep-alives while down.
    fn flood_recover(&mut self, port: PortId, sink: &mut dyn FrameSink) {
        info!(
            "port {} back up after {} keep-alives",
            self.tables.control[port].name, RECOVER_COUNT
        );
        if self.tables.accepted_idx(port).is_some() {
            if self.tables.all_offered_down() && !self.cfg.is_top_spine {
                // downstream link restored while isolated from the core
                self.tables.control[port].is_up = true;
                let msg = Message::FailureUpdate {
                    option: REACHABLE_OPTION,
                    vids: self.tables.all_accepted_roots(),
                };
                for i in 0..self.tables.accepted.len() {
                    let p = self.tables.accepted[i].port;
                    if self.tables.control[p].is_up {
                        self.send(p, &msg, sink);
                    }
                }
            } else {
                let msg = Message::RecoverUpdate {
                    option: UNREACHABLE_OPTION,
                    vids: self.tables.accepted_roots_on(port),
                };
                // the recovered port is still marked down here and is
                // deliberately excluded from the flood
                for p in 0..self.tables.control.len() {
                    if self.tables.control[p].is_up {
                        self.send(p, &msg, sink);
                    }
                }
                self.tables.control[port].is_up = true;
            }
        } else {
            if self.tables.all_offered_down() && !self.cfg.is_leaf {
                self.tables.control[port].is_up = true;
                let msg = Message::RecoverUpdate { option: REACHABLE_OPTION, vids: Vec::new() };
                for i in 0..self.tables.accepted.len() {
                    let p = self.tables.accepted[i].port;
                    if self.tables.control[p].is_up {
                        self.send(p, &msg, sink);
                    }
                }
            }
            self.tables.control[port].is_up = true;
        }
    }

    fn handle_failure_update(
        &mut self,
        port: PortId,
        option: u8,
        vids: &[String],
        sink: &mut dyn FrameSink,
    ) {
        info!(
            "failure update (option {}) received on port {}",
            option, self.tables.control[port].name
        );
        if let Some(ai) = self.tables.accepted_idx(port) {
            for vid in vids {
                push_unique(&mut self.tables.accepted[ai].unreachable, vid);
            }
            self.dump_accepted();
            let msg = Message::FailureUpdate {
                option: UNREACHABLE_OPTION,
                vids: vids.to_vec(),
            };
            for p in 0..self.tables.control.len() {
                if p != port && self.tables.control[p].is_up {
                    self.send(p, &msg, sink);
                }
            }
        } else if let Some(oi) = self.tables.offered_idx(port) {
            {
                let e = &mut self.tables.offered[oi];
                e.reachable.clear();
                if option == UNREACHABLE_OPTION {
                    for vid in vids {
                        push_unique(&mut e.unreachable, vid);
                    }
                } else {
                    for vid in vids {
                        remove_vid(&mut e.unreachable, vid);
                        push_unique(&mut e.reachable, vid);
                    }
                }
            }
            self.dump_offered();

            if self.cfg.is_leaf {
                return;
            }
            if self.tables.any_offered_clean() {
                debug!("an upstream port is still clean, done");
                return;
            }
            let blocked = self.tables.offered_unreachable_roots();
            if blocked.is_empty() {
                return;
            }
            let msg = Message::FailureUpdate { option: UNREACHABLE_OPTION, vids: blocked };
            for i in 0..self.tables.accepted.len() {
                let p = self.tables.accepted[i].port;
                if self.tables.control[p].is_up {
                    self.send(p, &msg, sink);
                }
            }
        } else {
            debug!(
                "failure update on unclassified port {}, dropped",
                self.tables.control[port].name
            );
        }
    }

    fn handle_recover_update(
        &mut self,
        port: PortId,
        option: u8,
        vids: &[String],
        sink: &mut dyn FrameSink,
    ) {
        info!(
            "recover update (option {}) received on port {}",
            option, self.tables.control[port].name
        );
        if let Some(ai) = self.tables.accepted_idx(port) {
            for vid in vids {
                remove_vid(&mut self.tables.accepted[ai].unreachable, vid);
            }
            self.dump_accepted();
            let msg = Message::RecoverUpdate {
                option: UNREACHABLE_OPTION,
                vids: vids.to_vec(),
            };
            for p in 0..self.tables.control.len() {
                if p != port && self.tables.control[p].is_up {
                    self.send(p, &msg, sink);
                }
            }
        } else if let Some(oi) = self.tables.offered_idx(port) {
            if option == UNREACHABLE_OPTION {
                let clean_before = self.tables.any_offered_clean();
                for vid in vids {
                    remove_vid(&mut self.tables.offered[oi].unreachable, vid);
                }
                let clean_after = self.tables.any_offered_clean();
                if self.cfg.is_leaf {
                    return;
                }
                if !clean_before && !clean_after {
                    // still dirty: pass the delta along
                    let msg = Message::RecoverUpdate {
                        option: UNREACHABLE_OPTION,
                        vids: vids.to_vec(),
                    };
                    self.send_to_up_accepted(&msg, sink);
                } else if !clean_before && clean_after {
                    // dirty -> clean: include whatever is still blocked
                    let mut all = vids.to_vec();
                    all.extend(self.tables.offered_unreachable_roots());
                    let msg = Message::RecoverUpdate { option: UNREACHABLE_OPTION, vids: all };
                    self.send_to_up_accepted(&msg, sink);
                }
            } else {
                let clean_before = self.tables.any_offered_clean();
                self.tables.offered[oi].reachable.clear();
                if self.cfg.is_leaf {
                    return;
                }
                let clean_after = self.tables.any_offered_clean();
                if !clean_before && clean_after {
                    let blocked = self.tables.offered_unreachable_roots();
                    if !blocked.is_empty() {
                        let msg = Message::RecoverUpdate {
                            option: UNREACHABLE_OPTION,
                            vids: blocked,
                        };
                        self.send_to_up_accepted(&msg, sink);
                    }
                }
            }
        }
    }

    /// DATA_MSG handling: leaves decapsulate toward the compute subnet,
    /// spines forward down a matching accepted port or push up across the
    /// available offered ports.
    fn handle_data(&mut self, port: PortId, mtp: &[u8], now: i64, sink: &mut dyn FrameSink) {
        self.tables.control[port].last_received_ms = now;

        if self.cfg.is_leaf {
            let Some(compute) = &self.compute else {
                return;
            };
            if mtp.len() <= DATA_HDR_LEN {
                return;
            }
            debug!(
                "delivering {} bytes to compute port {}",
                mtp.len() - DATA_HDR_LEN,
                compute.name
            );
            let _ = sink.send_compute(compute, &mtp[DATA_HDR_LEN..]);
            return;
        }

        let Some((src_vid, dest_vid)) = data_msg_vids(mtp) else {
            return;
        };
        let dest = dest_vid.to_string();
        debug!("data message src_vid={} dest_vid={}", src_vid, dest_vid);

        if let Some(ai) = self.tables.accepted_idx_for_vid(&dest) {
            let down_port = self.tables.accepted[ai].port;
            let usable = self.tables.control[down_port].is_up
                && !self.tables.accepted[ai].unreachable.iter().any(|v| v == &dest);
            if usable {
                debug!("VID {} found in accepted table, forwarding down", dest);
                self.tables.control[down_port].last_sent_ms = now;
                let _ = sink.send(&self.tables.control[down_port], mtp);
                return;
            }
            debug!("accepted path for VID {} down or blocked, pushing up", dest);
        }
        self.multipath_forward(&dest, data_msg_hash_key(mtp), mtp, now, sink);
    }

    /// Leaf ingress: encapsulate one IPv4 packet (`ip` starts at the IPv4
    /// header) and push it up a hash-selected offered port.
    pub fn handle_compute_frame(&mut self, ip: &[u8], now: i64, sink: &mut dyn FrameSink) {
        if ip.len() < 20 {
            debug!("runt IPv4 packet from compute, dropped");
            return;
        }
        if DATA_HDR_LEN + ip.len() > MAX_BUFFER_SIZE {
            debug!("oversized IPv4 packet from compute, dropped");
            return;
        }
        let octet = self.vid_octet as usize - 1;
        let src_vid = ip[12 + octet] as u16;
        let dest_vid = ip[16 + octet] as u16;
        debug!("compute packet src_vid={} dest_vid={}", src_vid, dest_vid);

        let mut buf = [0u8; MAX_BUFFER_SIZE];
        buf[0] = MTP_TYPE_DATA_MSG;
        buf[1..3].copy_from_slice(&src_vid.to_le_bytes());
        buf[3..5].copy_from_slice(&dest_vid.to_le_bytes());
        buf[DATA_HDR_LEN..DATA_HDR_LEN + ip.len()].copy_from_slice(ip);

        let dest = dest_vid.to_string();
        self.multipath_forward(
            &dest,
            ipv4_hash_key(ip),
            &buf[..DATA_HDR_LEN + ip.len()],
            now,
            sink,
        );
    }

    fn multipath_forward(
        &mut self,
        dest: &str,
        key: Option<[u8; 4]>,
        payload: &[u8],
        now: i64,
        sink: &mut dyn FrameSink,
    ) {
        let available = self.tables.available_offered(dest);
        if available.is_empty() {
            debug!("no available offered port for VID {}, packet dropped", dest);
            return;
        }
        let Some(key) = key else {
            return;
        };
        let hash = jenkins_one_at_a_time(&key);
        let pick = available[hash as usize % available.len()];
        debug!(
            "hash {} over {} available ports picked {}",
            hash,
            available.len(),
            self.tables.control[pick].name
        );
        self.tables.control[pick].last_sent_ms = now;
        let _ = sink.send(&self.tables.control[pick], payload);
    }

    fn send(&self, port: PortId, msg: &Message, sink: &mut dyn FrameSink) {
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let n = msg.encode_into(&mut buf);
        let _ = sink.send(&self.tables.control[port], &buf[..n]);
    }

    fn send_to_up_accepted(&self, msg: &Message, sink: &mut dyn FrameSink) {
        for i in 0..self.tables.accepted.len() {
            let p = self.tables.accepted[i].port;
            if self.tables.control[p].is_up {
                self.send(p, msg, sink);
            }
        }
    }

    fn dump_accepted(&self) {
        for e in &self.tables.accepted {
            debug!(
                "accepted via {}: vids={:?} unreachable={:?}",
                self.tables.control[e.port].name, e.vids, e.unreachable
            );
        }
    }

    fn dump_offered(&self) {
        for e in &self.tables.offered {
            debug!(
                "offered via {}: vids={:?} reachable={:?} unreachable={:?}",
                self.tables.control[e.port].name, e.vids, e.reachable, e.unreachable
            );
        }
    }
}
