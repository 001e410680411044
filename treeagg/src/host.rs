use std::any::Any;

use fnv::FnvBuildHasher;
use indexmap::IndexMap;
use log::{debug, info, warn};
use simnet::{Ctx, Datagram, Endpoint, TimerId, Token};

use crate::config::{HostConfig, EMITTER_PORT_BASE, SERVICE_PORT};
use crate::header::{AggHeader, DATA_PAYLOAD_LEN, FLAG_ACK, FLAG_NACK, HEADER_LEN};

type HashMap<K, V> = IndexMap<K, V, FnvBuildHasher>;

// psns occupy the low 32 bits of the token space
const CIRCLE_TOKEN: Token = Token(u64::MAX);

pub type CompleteCallback = Box<dyn FnMut(&str)>;

/// Per-host endpoint of the tree aggregation protocol.
///
/// Drives one AllReduce at a time: emits `total_packets` data records under
/// a sliding window with per-psn retransmit timers, consumes ACKs to advance
/// the window, receives the aggregated result flowing back down the tree,
/// and completes once the final record's ACK has arrived.
pub struct HostStack {
    cfg: HostConfig,
    total_packets: u32,

    send_buffer: Vec<i32>,
    recv_buffer: Vec<i32>,
    ack_received: Vec<bool>,
    data_received: Vec<bool>,
    in_flight: Vec<bool>,

    window_base: u32,
    window_end: u32,
    next_psn: u32,

    retransmit_timers: HashMap<u32, TimerId>,
    circle_running: bool,

    running: bool,
    started: bool,
    completed: bool,
    last_data_received: bool,

    on_complete: Option<CompleteCallback>,
}

impl HostStack {
    pub fn new(cfg: HostConfig) -> Self {
        HostStack {
            cfg,
            total_packets: 0,
            send_buffer: Vec::new(),
            recv_buffer: Vec::new(),
            ack_received: Vec::new(),
            data_received: Vec::new(),
            in_flight: Vec::new(),
            window_base: 0,
            window_end: 0,
            next_psn: 0,
            retransmit_timers: Default::default(),
            circle_running: false,
            running: false,
            started: false,
            completed: false,
            last_data_received: false,
            on_complete: None,
        }
    }

    pub fn set_complete_callback(&mut self, cb: CompleteCallback) {
        self.on_complete = Some(cb);
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// The per-psn aggregated scalars received back from the tree.
    pub fn result_buffer(&self) -> &[i32] {
        &self.recv_buffer
    }

    pub fn window_base(&self) -> u32 {
        self.window_base
    }

    pub fn window_end(&self) -> u32 {
        self.window_end
    }

    pub fn next_psn(&self) -> u32 {
        self.next_psn
    }

    pub fn server_id(&self) -> &str {
        &self.cfg.server_id
    }

    /// Begin an AllReduce session. Refused while the stack is stopped or a
    /// session is already in progress.
    pub fn all_reduce(&mut self, ctx: &mut Ctx) {
        if !self.running || self.started {
            warn!(
                "{}: cannot start AllReduce, stack not running or already started",
                self.cfg.server_id
            );
            return;
        }
        info!("{}: starting AllReduce", self.cfg.server_id);
        self.started = true;
        self.completed = false;
        self.last_data_received = false;

        self.total_packets = if self.cfg.total_packets != 0 {
            self.cfg.total_packets
        } else {
            (self.cfg.data_size + DATA_PAYLOAD_LEN as u32 - 1) / DATA_PAYLOAD_LEN as u32
        };
        if self.total_packets == 0 {
            warn!("{}: nothing to send, AllReduce refused", self.cfg.server_id);
            self.started = false;
            return;
        }
        let n = self.total_packets as usize;

        self.send_buffer = vec![self.cfg.fill_value; n];
        self.recv_buffer = vec![0; n];
        self.ack_received = vec![false; n];
        self.data_received = vec![false; n];
        self.in_flight = vec![false; n];

        for (_, timer) in self.retransmit_timers.drain(..) {
            ctx.cancel_timer(timer);
        }

        self.next_psn = 0;
        self.window_base = 0;
        self.window_end = u32::min(self.cfg.window_size - 1, self.total_packets - 1);

        info!(
            "{}: sending data, total_packets={}",
            self.cfg.server_id, self.total_packets
        );
        if !self.circle_running {
            self.circle_running = true;
            ctx.set_timer(0, CIRCLE_TOKEN);
        }
    }

    /// One step of the cooperative send loop: emit the next in-window psn
    /// that is neither acknowledged nor in flight, then reschedule itself
    /// after one processing delay. Stops once every psn has been emitted.
    fn circle_send(&mut self, ctx: &mut Ctx) {
        if !self.running {
            self.circle_running = false;
            return;
        }

        if self.next_psn >= self.window_base
            && self.next_psn <= self.window_end
            && self.next_psn < self.total_packets
        {
            let psn = self.next_psn;
            if !self.ack_received[psn as usize] && !self.in_flight[psn as usize] {
                self.in_flight[psn as usize] = true;
                self.send_data(ctx, psn);
                self.arm_retransmit(ctx, psn);
            }
            self.next_psn += 1;
            ctx.set_timer(self.cfg.processing_delay, CIRCLE_TOKEN);
        } else if self.next_psn < self.total_packets {
            // beyond the window edge, wait for the window to move
            ctx.set_timer(self.cfg.processing_delay, CIRCLE_TOKEN);
        } else {
            self.circle_running = false;
        }
    }

    fn arm_retransmit(&mut self, ctx: &mut Ctx, psn: u32) {
        let timer = ctx.set_timer(self.cfg.retransmit_interval, Token(psn as u64));
        if let Some(prev) = self.retransmit_timers.insert(psn, timer) {
            ctx.cancel_timer(prev);
        }
    }

    fn send_data(&mut self, ctx: &mut Ctx, psn: u32) {
        if psn >= self.total_packets || !self.running {
            warn!("{}: refusing to send out-of-range psn {}", self.cfg.server_id, psn);
            return;
        }
        let mut header = AggHeader {
            src_addr: self.cfg.local_addr,
            dst_addr: self.cfg.remote_addr,
            src_qp: self.cfg.local_qp,
            dst_qp: self.cfg.remote_qp,
            psn,
            operation: self.cfg.operation,
            group_id: self.cfg.group_id,
            length: (HEADER_LEN + DATA_PAYLOAD_LEN) as u16,
            agg_data: self.send_buffer[psn as usize],
            ..Default::default()
        };
        header.set_data_type(self.cfg.data_type);

        let mut payload = header.to_bytes();
        payload.resize(HEADER_LEN + DATA_PAYLOAD_LEN, 0);
        debug!(
            "{}: sending data psn={} agg_data={} to {}",
            self.cfg.server_id, psn, self.send_buffer[psn as usize], self.cfg.remote_addr
        );
        ctx.send_datagram(Datagram {
            src: (self.cfg.local_addr, EMITTER_PORT_BASE + self.cfg.local_qp),
            dst: (self.cfg.remote_addr, SERVICE_PORT),
            payload,
        });
    }

    fn retransmit(&mut self, ctx: &mut Ctx, psn: u32) {
        if psn >= self.total_packets || !self.running || self.ack_received[psn as usize] {
            return;
        }
        debug!("{}: retransmitting psn={}", self.cfg.server_id, psn);
        self.in_flight[psn as usize] = true;
        self.send_data(ctx, psn);
        self.arm_retransmit(ctx, psn);
    }

    fn process_ack(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let psn = header.psn;
        if psn >= self.total_packets {
            warn!("{}: ACK with out-of-range psn {}", self.cfg.server_id, psn);
            return;
        }
        self.ack_received[psn as usize] = true;
        self.in_flight[psn as usize] = false;
        if let Some(timer) = self.retransmit_timers.remove(&psn) {
            ctx.cancel_timer(timer);
        }

        while self.window_base < self.total_packets && self.ack_received[self.window_base as usize]
        {
            self.window_base += 1;
            if self.window_end < self.total_packets - 1 {
                self.window_end += 1;
            }
        }
        debug!(
            "{}: ACK psn={} window=[{}, {}]",
            self.cfg.server_id, psn, self.window_base, self.window_end
        );
    }

    fn process_nak(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let psn = header.psn;
        if psn >= self.total_packets {
            warn!("{}: NAK with out-of-range psn {}", self.cfg.server_id, psn);
            return;
        }
        info!("{}: NAK received, resending psn={}", self.cfg.server_id, psn);
        if !self.running || self.ack_received[psn as usize] {
            return;
        }
        self.in_flight[psn as usize] = true;
        self.send_data(ctx, psn);
        self.arm_retransmit(ctx, psn);
    }

    fn process_data(&mut self, ctx: &mut Ctx, header: &AggHeader) {
        let psn = header.psn;
        if psn >= self.total_packets {
            warn!("{}: data with out-of-range psn {}", self.cfg.server_id, psn);
            return;
        }
        if self.data_received[psn as usize] {
            debug!("{}: duplicate data psn={}", self.cfg.server_id, psn);
            self.send_ack(ctx, header, header.agg_data);
            return;
        }
        self.recv_buffer[psn as usize] = header.agg_data;
        self.data_received[psn as usize] = true;
        if psn == self.total_packets - 1 {
            self.last_data_received = true;
        }
        debug!(
            "{}: received data psn={} agg_data={}",
            self.cfg.server_id, psn, header.agg_data
        );
        self.send_ack(ctx, header, header.agg_data);
    }

    /// The ACK echoes the data record's own aggDataTest so duplicates stay
    /// idempotent end to end.
    fn send_ack(&mut self, ctx: &mut Ctx, header: &AggHeader, value: i32) {
        let ack = header.ack_reply(value);
        ctx.send_datagram(Datagram {
            src: (self.cfg.local_addr, EMITTER_PORT_BASE + self.cfg.local_qp),
            dst: (ack.dst_addr, SERVICE_PORT),
            payload: ack.to_bytes(),
        });
    }

    fn check_complete(&mut self, ctx: &mut Ctx) {
        if !self.started || self.completed || !self.last_data_received {
            return;
        }
        if !self.ack_received[self.total_packets as usize - 1] {
            return;
        }
        for (_, timer) in self.retransmit_timers.drain(..) {
            ctx.cancel_timer(timer);
        }
        self.completed = true;
        info!("{}: AllReduce completed", self.cfg.server_id);
        if let Some(cb) = self.on_complete.as_mut() {
            cb(&self.cfg.server_id);
        }
    }
}

impl Endpoint for HostStack {
    fn on_start(&mut self, ctx: &mut Ctx) {
        ctx.listen(self.cfg.local_addr, SERVICE_PORT);
        self.running = true;
        self.all_reduce(ctx);
    }

    fn on_datagram(&mut self, ctx: &mut Ctx, dgram: Datagram) {
        let header = match AggHeader::decode(&dgram.payload) {
            Ok(h) => h,
            Err(e) => {
                warn!("{}: undecodable record: {}", self.cfg.server_id, e);
                return;
            }
        };

        if header.has_flag(FLAG_ACK) {
            self.process_ack(ctx, &header);
        } else if header.has_flag(FLAG_NACK) {
            self.process_nak(ctx, &header);
        } else {
            self.process_data(ctx, &header);
        }

        self.check_complete(ctx);
    }

    fn on_timer(&mut self, ctx: &mut Ctx, token: Token) {
        if token == CIRCLE_TOKEN {
            self.circle_send(ctx);
        } else {
            self.retransmit(ctx, token.0 as u32);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
