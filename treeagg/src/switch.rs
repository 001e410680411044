use std::any::Any;
use std::net::Ipv4Addr;

use fnv::FnvBuildHasher;
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use simnet::{Ctx, Datagram, Duration, Endpoint, TimerId, Token};

use crate::config::{SwitchConfig, EMITTER_PORT_BASE, SERVICE_PORT};
use crate::header::{
    AggHeader, DataType, ReduceOp, DATA_PAYLOAD_LEN, FLAG_ACK, FLAG_NACK, HEADER_LEN,
};

type HashMap<K, V> = IndexMap<K, V, FnvBuildHasher>;

/// Inbound-direction flow key: the record-carried source address, the local
/// interface it targets, and the targeted QP. Emission paths invert it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub dst_qp: u16,
}

impl FlowKey {
    fn of(header: &AggHeader) -> Self {
        FlowKey {
            src_addr: header.src_addr,
            dst_addr: header.dst_addr,
            dst_qp: header.dst_qp,
        }
    }

    /// The key of the flow coming back the other way on the same link.
    fn reversed(header: &AggHeader) -> Self {
        FlowKey {
            src_addr: header.dst_addr,
            dst_addr: header.src_addr,
            dst_qp: header.src_qp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ClassKey {
    flow: FlowKey,
    is_ack: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowClass {
    UpstreamData,
    DownstreamData,
    UpstreamAck,
    DownstreamAck,
}

/// One forwarding target, in emission direction.
#[derive(Debug, Clone, Copy)]
struct NextHop {
    src_addr: Ipv4Addr,
    src_qp: u16,
    dst_addr: Ipv4Addr,
    dst_qp: u16,
}

/// Slot arrays shared by every flow of a communication group. Slots are
/// indexed by psn mod array_size and reused cyclically; agg_psn[i] is the
/// sequence the slot currently expects and advances by exactly array_size
/// when the slot clears.
struct GroupState {
    fan_in: u16,
    array_size: u16,
    op: ReduceOp,
    data_type: DataType,
    packet_len: usize,
    agg_buffer: Vec<i32>,
    degree: Vec<u16>,
    bcast_buffer: Vec<i32>,
    bcast_arrived: Vec<bool>,
    r_degree: Vec<u16>,
    agg_psn: Vec<u32>,
}

impl GroupState {
    fn new(fan_in: u16, array_size: u16) -> Self {
        let m = array_size as usize;
        GroupState {
            fan_in,
            array_size,
            op: ReduceOp::Sum,
            data_type: DataType::Int32,
            packet_len: DATA_PAYLOAD_LEN,
            agg_buffer: vec![0; m],
            degree: vec![0; m],
            bcast_buffer: vec![0; m],
            bcast_arrived: vec![false; m],
            r_degree: vec![0; m],
            agg_psn: (0..array_size as u32).collect(),
        }
    }

    #[inline]
    fn slot(&self, psn: u32) -> usize {
        (psn % self.array_size as u32) as usize
    }
}

/// Per-inbound-flow state: which slots this peer has fed in the current
/// epoch and which broadcast slots it has acknowledged.
struct InboundFlow {
    group_id: u16,
    arrival: Vec<bool>,
    r_arrival: Vec<bool>,
}

struct RetransmitEntry {
    timer: TimerId,
    token: u64,
    header: AggHeader,
    value: i32,
}

#[derive(Default)]
struct OutboundFlow {
    retransmits: HashMap<u32, RetransmitEntry>,
}

/// Per-interior-node aggregation engine.
///
/// Classifies inbound records by the record-carried flow tuple, reduces
/// upstream contributions under the group's fan-in, forwards the committed
/// result toward the root (or multicasts it downward when this node is the
/// root), caches the downstream aggregate for replay, and recovers from
/// loss with NAKs plus timed retransmission of every emitted record.
pub struct SwitchEngine {
    switch_id: String,
    retransmit_interval: Duration,
    local_addrs: Vec<Ipv4Addr>,

    class_table: HashMap<ClassKey, FlowClass>,
    inbound: HashMap<FlowKey, InboundFlow>,
    outbound: HashMap<FlowKey, OutboundFlow>,
    forwarding: HashMap<FlowKey, Vec<NextHop>>,
    groups: HashMap<u16, GroupState>,

    // timer token -> the outbound entry it re-arms
    timer_targets: HashMap<u64, (FlowKey, u32)>,
    next_token: u64,
}

impl SwitchEngine {
    pub fn new(cfg: SwitchConfig) -> Self {
        let mut engine = SwitchEngine {
            switch_id: cfg.switch_id.clone(),
            retransmit_interval: cfg.retransmit_interval,
            local_addrs: Vec::new(),
            class_table: Default::default(),
            inbound: Default::default(),
            outbound: Default::default(),
            forwarding: Default::default(),
            groups: Default::default(),
            timer_targets: Default::default(),
            next_token: 0,
        };
        engine.initialize(&cfg);
        engine
    }

    /// Populate the flow class, context, forwarding, and group tables from
    /// the link descriptors. Keys are always the inbound direction.
    fn initialize(&mut self, cfg: &SwitchConfig) {
        info!(
            "{}: initializing engine group={} fan_in={} array_size={}",
            cfg.switch_id, cfg.group_id, cfg.fan_in, cfg.array_size
        );
        self.groups
            .insert(cfg.group_id, GroupState::new(cfg.fan_in, cfg.array_size));

        let parent = cfg.links.iter().find(|l| !l.to_child).copied();
        let children: Vec<_> = cfg.links.iter().filter(|l| l.to_child).copied().collect();

        for link in &cfg.links {
            let key = FlowKey {
                src_addr: link.peer_addr,
                dst_addr: link.local_addr,
                dst_qp: link.local_qp,
            };
            let (data_class, ack_class) = if link.to_child {
                (FlowClass::UpstreamData, FlowClass::UpstreamAck)
            } else {
                (FlowClass::DownstreamData, FlowClass::DownstreamAck)
            };
            self.class_table
                .insert(ClassKey { flow: key, is_ack: false }, data_class);
            self.class_table
                .insert(ClassKey { flow: key, is_ack: true }, ack_class);

            let m = cfg.array_size as usize;
            self.inbound.insert(
                key,
                InboundFlow {
                    group_id: cfg.group_id,
                    arrival: vec![false; m],
                    r_arrival: vec![false; m],
                },
            );
            self.outbound.insert(key, Default::default());

            let hops: Vec<NextHop> = if link.to_child {
                match parent {
                    // interior node: a child's data flow forwards upward
                    Some(p) => vec![NextHop {
                        src_addr: p.local_addr,
                        src_qp: p.local_qp,
                        dst_addr: p.peer_addr,
                        dst_qp: p.peer_qp,
                    }],
                    // root: multicast back to every child, the sender included
                    None => children
                        .iter()
                        .map(|c| NextHop {
                            src_addr: c.local_addr,
                            src_qp: c.local_qp,
                            dst_addr: c.peer_addr,
                            dst_qp: c.peer_qp,
                        })
                        .collect(),
                }
            } else {
                // the parent's broadcast flow multicasts to every child
                children
                    .iter()
                    .map(|c| NextHop {
                        src_addr: c.local_addr,
                        src_qp: c.local_qp,
                        dst_addr: c.peer_addr,
                        dst_qp: c.peer_qp,
                    })
                    .collect()
            };
            self.forwarding.insert(key, hops);

            if !self.local_addrs.contains(&link.local_addr) {
                self.local_addrs.push(link.local_addr);
            }
        }
    }

    pub fn switch_id(&self) -> &str {
        &self.switch_id
    }

    pub fn local_addrs(&self) -> &[Ipv4Addr] {
        &self.local_addrs
    }

    /// Largest (degree, rDegree) currently held by any slot of the group.
    pub fn max_degrees(&self, group_id: u16) -> Option<(u16, u16)> {
        let g = self.groups.get(&group_id)?;
        Some((
            g.degree.iter().copied().max().unwrap_or(0),
            g.r_degree.iter().copied().max().unwrap_or(0),
        ))
    }

    pub fn agg_psns(&self, group_id: u16) -> Option<&[u32]> {
        self.groups.get(&group_id).map(|g| g.agg_psn.as_slice())
    }

    fn classify(&self, header: &AggHeader) -> Option<FlowClass> {
        let key = ClassKey {
            flow: FlowKey::of(header),
            is_ack: header.has_flag(FLAG_ACK) || header.has_flag(FLAG_NACK),
        };
        self.class_table.get(&key).copied()
    }

    fn process_upstream_data(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let key = FlowKey::of(header);
        let psn = header.psn;
        let value = header.agg_data;

        let gid = match self.inbound.get(&key) {
            Some(flow) => flow.group_id,
            None => {
                error!("{}: no inbound context, dropping upstream data", self.switch_id);
                return;
            }
        };
        let (idx, expected, bcast_arrived) = match self.groups.get(&gid) {
            Some(g) => {
                let idx = g.slot(psn);
                (idx, g.agg_psn[idx], g.bcast_arrived[idx])
            }
            None => {
                error!("{}: group {} missing, dropping upstream data", self.switch_id, gid);
                return;
            }
        };

        if psn < expected {
            debug!(
                "{}: late upstream data psn={} expected={}",
                self.switch_id, psn, expected
            );
            self.send_ack(ctx, header, value);
            return;
        }
        if psn > expected {
            debug!(
                "{}: early upstream data psn={} expected={}",
                self.switch_id, psn, expected
            );
            self.process_retransmission(ctx, header);
            return;
        }

        let arrived = self.inbound[&key].arrival[idx];
        if arrived || bcast_arrived {
            debug!(
                "{}: redundant upstream data psn={} arrived={} bcast={}",
                self.switch_id, psn, arrived, bcast_arrived
            );
            self.send_ack(ctx, header, value);
            self.process_retransmission(ctx, header);
            return;
        }

        self.send_ack(ctx, header, value);
        {
            let flow = self.inbound.get_mut(&key).unwrap();
            flow.arrival[idx] = true;
            flow.r_arrival[idx] = false;
        }
        self.aggregate(ctx, header);
    }

    /// Fold one contribution into the slot; on reaching fan-in, commit and
    /// forward the result (upward, or downward everywhere when root).
    fn aggregate(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let key = FlowKey::of(header);
        let psn = header.psn;
        let value = header.agg_data;
        let gid = self.inbound[&key].group_id;

        let committed = {
            let g = self.groups.get_mut(&gid).unwrap();
            let idx = g.slot(psn);
            match g.op {
                ReduceOp::Min => {
                    if g.degree[idx] == 0 || value < g.agg_buffer[idx] {
                        g.agg_buffer[idx] = value;
                    }
                }
                ReduceOp::Max => {
                    if g.degree[idx] == 0 || value > g.agg_buffer[idx] {
                        g.agg_buffer[idx] = value;
                    }
                }
                ReduceOp::Product => {
                    if g.degree[idx] == 0 {
                        g.agg_buffer[idx] = value;
                    } else {
                        g.agg_buffer[idx] *= value;
                    }
                }
                // Sum and Average accumulate; Custom has no semantics of its
                // own and falls through to Sum
                ReduceOp::Sum | ReduceOp::Average | ReduceOp::Custom => {
                    g.agg_buffer[idx] += value;
                }
            }
            g.degree[idx] += 1;
            debug_assert!(g.degree[idx] <= g.fan_in);
            debug!(
                "{}: aggregate psn={} value={} result={} degree={}/{}",
                self.switch_id, psn, value, g.agg_buffer[idx], g.degree[idx], g.fan_in
            );
            if g.degree[idx] == g.fan_in {
                if let ReduceOp::Average = g.op {
                    g.agg_buffer[idx] /= g.fan_in as i32;
                }
                Some(g.agg_buffer[idx])
            } else {
                None
            }
        };

        let result = match committed {
            Some(r) => r,
            None => return,
        };

        let hops = match self.forwarding.get(&key) {
            Some(hops) => hops.clone(),
            None => {
                error!("{}: no forwarding rule, result stranded", self.switch_id);
                return;
            }
        };

        let (op, data_type, packet_len) = {
            let g = self.groups.get_mut(&gid).unwrap();
            let idx = g.slot(psn);
            // a multi-hop rule marks the root, which counts its own
            // broadcast as already delivered to itself
            if hops.len() > 1 {
                g.bcast_arrived[idx] = true;
                g.bcast_buffer[idx] = result;
            }
            (g.op, g.data_type, g.packet_len)
        };

        info!(
            "{}: committed psn={} result={} hops={}",
            self.switch_id, psn, result, hops.len()
        );
        for hop in hops {
            let mut fwd = AggHeader {
                src_addr: hop.src_addr,
                src_qp: hop.src_qp,
                dst_addr: hop.dst_addr,
                dst_qp: hop.dst_qp,
                psn,
                operation: op,
                group_id: header.group_id,
                length: (HEADER_LEN + packet_len) as u16,
                agg_data: result,
                ..Default::default()
            };
            fwd.set_data_type(data_type);
            self.emit_data(ctx, &fwd, packet_len);
            self.schedule_retransmission(ctx, fwd, result);
        }
    }

    fn process_downstream_data(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let key = FlowKey::of(header);
        let psn = header.psn;
        let value = header.agg_data;

        let gid = match self.inbound.get(&key) {
            Some(flow) => flow.group_id,
            None => {
                error!("{}: no inbound context, dropping downstream data", self.switch_id);
                return;
            }
        };

        let (fresh, packet_len) = {
            let g = match self.groups.get_mut(&gid) {
                Some(g) => g,
                None => return,
            };
            let idx = g.slot(psn);
            if psn < g.agg_psn[idx] {
                debug!(
                    "{}: late downstream data psn={} expected={}",
                    self.switch_id, psn, g.agg_psn[idx]
                );
                (false, g.packet_len)
            } else if g.bcast_arrived[idx] {
                debug!("{}: duplicate downstream data psn={}", self.switch_id, psn);
                (false, g.packet_len)
            } else {
                g.bcast_arrived[idx] = true;
                g.bcast_buffer[idx] = value;
                (true, g.packet_len)
            }
        };

        self.send_ack(ctx, header, value);
        if !fresh {
            return;
        }

        debug!(
            "{}: caching and broadcasting downstream psn={} value={}",
            self.switch_id, psn, value
        );
        let hops = match self.forwarding.get(&key) {
            Some(hops) => hops.clone(),
            None => {
                error!("{}: no forwarding rule, broadcast stranded", self.switch_id);
                return;
            }
        };
        for hop in hops {
            let mut fwd = AggHeader {
                src_addr: hop.src_addr,
                src_qp: hop.src_qp,
                dst_addr: hop.dst_addr,
                dst_qp: hop.dst_qp,
                psn,
                operation: header.operation,
                group_id: header.group_id,
                length: (HEADER_LEN + packet_len) as u16,
                agg_data: value,
                ..Default::default()
            };
            if let Ok(dt) = header.data_type() {
                fwd.set_data_type(dt);
            }
            self.emit_data(ctx, &fwd, packet_len);
            self.schedule_retransmission(ctx, fwd, value);
        }
    }

    fn process_upstream_ack(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let key = FlowKey::of(header);
        let psn = header.psn;
        let is_nak = header.has_flag(FLAG_NACK);

        let gid = match self.inbound.get(&key) {
            Some(flow) => flow.group_id,
            None => {
                error!(
                    "{}: no inbound context, dropping upstream {}",
                    self.switch_id,
                    if is_nak { "NAK" } else { "ACK" }
                );
                return;
            }
        };
        let (idx, expected) = {
            let g = &self.groups[&gid];
            let idx = g.slot(psn);
            (idx, g.agg_psn[idx])
        };

        if is_nak {
            if psn == expected {
                info!("{}: upstream NAK psn={}, retransmitting", self.switch_id, psn);
                self.process_retransmission(ctx, header);
            } else {
                debug!(
                    "{}: dropping upstream NAK psn={} expected={}",
                    self.switch_id, psn, expected
                );
            }
            return;
        }

        self.cancel_retransmit(ctx, key, psn);

        let r_arrived = self.inbound[&key].r_arrival[idx];
        if psn != expected || r_arrived {
            debug!(
                "{}: dropping upstream ACK psn={} expected={} r_arrival={}",
                self.switch_id, psn, expected, r_arrived
            );
            return;
        }

        {
            let flow = self.inbound.get_mut(&key).unwrap();
            flow.r_arrival[idx] = true;
            flow.arrival[idx] = false;
        }
        let complete = {
            let g = self.groups.get_mut(&gid).unwrap();
            g.r_degree[idx] += 1;
            debug_assert!(g.r_degree[idx] <= g.fan_in);
            debug!(
                "{}: upstream ACK psn={} r_degree={}/{}",
                self.switch_id, psn, g.r_degree[idx], g.fan_in
            );
            g.r_degree[idx] == g.fan_in
        };

        if complete {
            info!(
                "{}: every child acknowledged psn={}, recycling slot {}",
                self.switch_id, psn, idx
            );
            self.clear_slot(gid, idx);
            self.advance_agg_psn(gid, idx);
        }
    }

    fn process_downstream_ack(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let key = FlowKey::of(header);
        let psn = header.psn;
        let is_nak = header.has_flag(FLAG_NACK);

        let gid = match self.inbound.get(&key) {
            Some(flow) => flow.group_id,
            None => {
                error!(
                    "{}: no inbound context, dropping downstream {}",
                    self.switch_id,
                    if is_nak { "NAK" } else { "ACK" }
                );
                return;
            }
        };
        let (expected, bcast_arrived) = {
            let g = &self.groups[&gid];
            let idx = g.slot(psn);
            (g.agg_psn[idx], g.bcast_arrived[idx])
        };

        if is_nak {
            if psn == expected && !bcast_arrived {
                info!("{}: downstream NAK psn={}, retransmitting", self.switch_id, psn);
                self.process_retransmission(ctx, header);
            } else {
                debug!("{}: dropping downstream NAK psn={}", self.switch_id, psn);
            }
            return;
        }

        self.cancel_retransmit(ctx, key, psn);
        if psn != expected {
            debug!(
                "{}: dropping downstream ACK psn={} expected={}",
                self.switch_id, psn, expected
            );
        }
        // no slot progression is driven from the parent's ACK
    }

    /// Zero the slot and forget every per-flow mark for it.
    fn clear_slot(&mut self, gid: u16, idx: usize) {
        if let Some(g) = self.groups.get_mut(&gid) {
            g.agg_buffer[idx] = 0;
            g.degree[idx] = 0;
            g.bcast_arrived[idx] = false;
            g.r_degree[idx] = 0;
            g.bcast_buffer[idx] = 0;
        }
        for (_, flow) in self.inbound.iter_mut() {
            if flow.group_id == gid {
                flow.arrival[idx] = false;
                flow.r_arrival[idx] = false;
            }
        }
    }

    /// The only place agg_psn moves: one full array size forward. The
    /// arrival marks were already dropped per-ACK, but the sweep keeps the
    /// slot consistent under reordered duplicates.
    fn advance_agg_psn(&mut self, gid: u16, idx: usize) {
        let new_psn = match self.groups.get_mut(&gid) {
            Some(g) => {
                g.agg_psn[idx] += g.array_size as u32;
                g.agg_psn[idx]
            }
            None => return,
        };
        for (_, flow) in self.inbound.iter_mut() {
            if flow.group_id == gid {
                flow.arrival[idx] = false;
            }
        }
        debug!(
            "{}: slot {} now expects psn={}",
            self.switch_id, idx, new_psn
        );
    }

    /// Answer a NAK or an early record. The reply always carries the slot's
    /// current agg_psn as its sequence.
    fn process_retransmission(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let key = FlowKey::of(header);
        let psn = header.psn;

        let gid = match self.inbound.get(&key) {
            Some(flow) => flow.group_id,
            None => {
                error!("{}: no inbound context, cannot serve retransmit", self.switch_id);
                return;
            }
        };
        let (idx, expected, bcast_arrived, full, value, op, data_type, packet_len) = {
            let g = &self.groups[&gid];
            let idx = g.slot(psn);
            (
                idx,
                g.agg_psn[idx],
                g.bcast_arrived[idx],
                g.degree[idx] == g.fan_in,
                if g.bcast_arrived[idx] {
                    g.bcast_buffer[idx]
                } else {
                    g.agg_buffer[idx]
                },
                g.op,
                g.data_type,
                g.packet_len,
            )
        };

        if bcast_arrived {
            // the result is established here: replay it straight back
            info!(
                "{}: replaying cached result psn={} value={}",
                self.switch_id, expected, value
            );
            let mut replay = AggHeader {
                src_addr: header.dst_addr,
                src_qp: header.dst_qp,
                dst_addr: header.src_addr,
                dst_qp: header.src_qp,
                psn: expected,
                operation: header.operation,
                group_id: header.group_id,
                length: (HEADER_LEN + packet_len) as u16,
                agg_data: value,
                ..Default::default()
            };
            if let Ok(dt) = header.data_type() {
                replay.set_data_type(dt);
            }
            self.emit_data(ctx, &replay, packet_len);
            self.schedule_retransmission(ctx, replay, value);
        } else if full {
            // aggregated but not yet broadcast: resend along the forwarding rule
            info!(
                "{}: resending committed aggregate psn={} value={}",
                self.switch_id, expected, value
            );
            let hops = match self.forwarding.get(&key) {
                Some(hops) => hops.clone(),
                None => return,
            };
            for hop in hops {
                let mut fwd = AggHeader {
                    src_addr: hop.src_addr,
                    src_qp: hop.src_qp,
                    dst_addr: hop.dst_addr,
                    dst_qp: hop.dst_qp,
                    psn: expected,
                    operation: op,
                    group_id: header.group_id,
                    length: (HEADER_LEN + packet_len) as u16,
                    agg_data: value,
                    ..Default::default()
                };
                fwd.set_data_type(data_type);
                self.emit_data(ctx, &fwd, packet_len);
                self.schedule_retransmission(ctx, fwd, value);
            }
        } else if !self.inbound[&key].arrival[idx] {
            // this peer's record is the missing one: ask for it
            info!(
                "{}: missing contribution, NAK psn={} back to {}",
                self.switch_id, expected, header.src_addr
            );
            self.send_nak(ctx, header, expected);
        } else {
            debug!(
                "{}: nothing to retransmit for psn={} expected={}",
                self.switch_id, psn, expected
            );
        }
    }

    /// Track an emitted data record so it re-emits until acknowledged. The
    /// table is keyed by the reverse (inbound) direction, where the ACK will
    /// arrive.
    fn schedule_retransmission(&mut self, ctx: &mut Ctx, header: AggHeader, value: i32) {
        let key = FlowKey::reversed(&header);
        let psn = header.psn;
        if !self.outbound.contains_key(&key) {
            error!(
                "{}: no outbound context for {} -> {}, retransmit not armed",
                self.switch_id, header.src_addr, header.dst_addr
            );
            return;
        }

        let token = self.next_token;
        self.next_token += 1;
        let timer = ctx.set_timer(self.retransmit_interval, Token(token));

        let out = self.outbound.get_mut(&key).unwrap();
        if let Some(prev) = out.retransmits.insert(
            psn,
            RetransmitEntry {
                timer,
                token,
                header,
                value,
            },
        ) {
            ctx.cancel_timer(prev.timer);
            self.timer_targets.remove(&prev.token);
        }
        self.timer_targets.insert(token, (key, psn));
    }

    fn cancel_retransmit(&mut self, ctx: &mut Ctx, key: FlowKey, psn: u32) {
        if let Some(out) = self.outbound.get_mut(&key) {
            if let Some(entry) = out.retransmits.remove(&psn) {
                ctx.cancel_timer(entry.timer);
                self.timer_targets.remove(&entry.token);
                debug!("{}: retransmit cancelled psn={}", self.switch_id, psn);
            }
        }
    }

    /// Timer fired for a still-unacknowledged emission: re-emit the same
    /// record and arm the next round.
    fn retransmit_fired(&mut self, ctx: &mut Ctx, token: Token) {
        let (key, psn) = match self.timer_targets.remove(&token.0) {
            Some(target) => target,
            None => return,
        };
        let entry = match self
            .outbound
            .get_mut(&key)
            .and_then(|out| out.retransmits.remove(&psn))
        {
            Some(entry) => entry,
            None => return,
        };

        let packet_len = self
            .inbound
            .get(&key)
            .and_then(|flow| self.groups.get(&flow.group_id))
            .map(|g| g.packet_len)
            .unwrap_or(DATA_PAYLOAD_LEN);

        debug!(
            "{}: retransmitting psn={} value={} to {}",
            self.switch_id, psn, entry.value, entry.header.dst_addr
        );
        self.emit_data(ctx, &entry.header, packet_len);
        self.schedule_retransmission(ctx, entry.header, entry.value);
    }

    fn emit_data(&self, ctx: &mut Ctx, header: &AggHeader, payload_len: usize) {
        let mut payload = header.to_bytes();
        payload.resize(HEADER_LEN + payload_len, 0);
        ctx.send_datagram(Datagram {
            src: (header.src_addr, EMITTER_PORT_BASE + header.src_qp),
            dst: (header.dst_addr, SERVICE_PORT),
            payload,
        });
    }

    fn send_ack(&self, ctx: &mut Ctx, header: &AggHeader, value: i32) {
        let ack = header.ack_reply(value);
        ctx.send_datagram(Datagram {
            src: (ack.src_addr, EMITTER_PORT_BASE + ack.src_qp),
            dst: (ack.dst_addr, SERVICE_PORT),
            payload: ack.to_bytes(),
        });
    }

    fn send_nak(&self, ctx: &mut Ctx, header: &AggHeader, expected: u32) {
        let nak = header.nak_reply(expected);
        ctx.send_datagram(Datagram {
            src: (nak.src_addr, EMITTER_PORT_BASE + nak.src_qp),
            dst: (nak.dst_addr, SERVICE_PORT),
            payload: nak.to_bytes(),
        });
    }
}

impl Endpoint for SwitchEngine {
    fn on_start(&mut self, ctx: &mut Ctx) {
        for addr in self.local_addrs.clone() {
            ctx.listen(addr, SERVICE_PORT);
        }
        info!("{}: listening on port {}", self.switch_id, SERVICE_PORT);
    }

    fn on_datagram(&mut self, ctx: &mut Ctx, dgram: Datagram) {
        let header = match AggHeader::decode(&dgram.payload) {
            Ok(h) => h,
            Err(e) => {
                warn!("{}: undecodable record: {}", self.switch_id, e);
                return;
            }
        };
        match self.classify(&header) {
            Some(FlowClass::UpstreamData) => self.process_upstream_data(ctx, &header),
            Some(FlowClass::DownstreamData) => self.process_downstream_data(ctx, &header),
            Some(FlowClass::UpstreamAck) => self.process_upstream_ack(ctx, &header),
            Some(FlowClass::DownstreamAck) => self.process_downstream_ack(ctx, &header),
            None => {
                debug!(
                    "{}: unmatched flow {} -> {}:{} ack={}, dropped",
                    self.switch_id,
                    header.src_addr,
                    header.dst_addr,
                    header.dst_qp,
                    header.has_flag(FLAG_ACK) || header.has_flag(FLAG_NACK)
                );
            }
        }
    }

    fn on_timer(&mut self, ctx: &mut Ctx, token: Token) {
        self.retransmit_fired(ctx, token);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
