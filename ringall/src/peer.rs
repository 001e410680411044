use std::any::Any;

use fnv::FnvBuildHasher;
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use simnet::{ConnId, Ctx, Endpoint, TimerId, ToStdDuration, Token};

use crate::config::RingConfig;
use crate::framing::FrameReader;
use crate::header::{RingHeader, RingMessage, HEADER_LEN};

type HashMap<K, V> = IndexMap<K, V, FnvBuildHasher>;

const TOKEN_CONNECT: Token = Token(1);
const TOKEN_TRANSFER: Token = Token(2);
const TOKEN_SEND: Token = Token(3);
const TOKEN_NOTIFY: Token = Token(4);

pub type CompleteCallback = Box<dyn FnMut(u32)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPhase {
    Idle = 0,
    Connecting = 1,
    ScatterReduce = 2,
    AllGather = 3,
    Done = 4,
}

impl RingPhase {
    fn as_u32(self) -> u32 {
        self as u32
    }

    /// 0 for Scatter-Reduce, 1 for All-Gather; used to bucket per-phase
    /// round counters.
    fn bucket(phase: u32) -> Option<usize> {
        match phase {
            2 => Some(0),
            3 => Some(1),
            _ => None,
        }
    }
}

/// What this peer knows about its successor, learned exclusively from
/// backward ROUND_COMPLETE notifications.
#[derive(Debug, Default)]
struct NextNodeState {
    node_id: u32,
    current_pass: u32,
    current_phase: u32,
    ready_for_next_pass: bool,
}

/// One node of the TCP Ring-AllReduce.
///
/// Keeps one outgoing stream to the successor `(i+1) mod N` and accepts one
/// from the predecessor. Runs Scatter-Reduce for N-1 rounds, then
/// All-Gather for N-1 rounds, one logical chunk per round, gated by
/// backward ROUND_COMPLETE notifications as explicit flow control.
pub struct RingPeer {
    cfg: RingConfig,
    packets_per_chunk: u32,
    record_len: usize,

    phase: RingPhase,
    current_pass: u32,
    scatter_reduce_buffer: Vec<i32>,
    all_gather_buffer: Vec<i32>,
    packets_sent_in_chunk: u32,
    packets_received_per_chunk: Vec<u32>,

    next_node_state: NextNodeState,
    can_send: bool,
    waiting_for_next_node: bool,
    has_notified_previous_node: bool,
    is_initial_round: bool,

    send_conn: Option<ConnId>,
    accepted_conns: Vec<ConnId>,
    readers: HashMap<ConnId, FrameReader>,
    send_timer: Option<TimerId>,
    pending_notify: Option<(u32, u32)>,

    start_time: simnet::Timestamp,

    // per-phase totals, observable for verification: [Scatter-Reduce, All-Gather]
    notifies_sent: [u32; 2],
    notifies_received: [u32; 2],

    on_complete: Option<CompleteCallback>,
}

impl RingPeer {
    pub fn new(cfg: RingConfig) -> Self {
        assert!(cfg.num_nodes > 0, "ring needs at least one node");
        assert!(
            cfg.total_packets % cfg.num_nodes == 0,
            "total_packets must divide evenly into num_nodes chunks"
        );
        let packets_per_chunk = cfg.total_packets / cfg.num_nodes;
        let record_len = HEADER_LEN + cfg.packet_payload_size;
        let t = cfg.total_packets as usize;
        let n = cfg.num_nodes as usize;
        RingPeer {
            packets_per_chunk,
            record_len,
            phase: RingPhase::Idle,
            current_pass: 0,
            // every node contributes one unit per array entry
            scatter_reduce_buffer: vec![1; t],
            all_gather_buffer: vec![0; t],
            packets_sent_in_chunk: 0,
            packets_received_per_chunk: vec![0; n],
            next_node_state: Default::default(),
            can_send: false,
            waiting_for_next_node: false,
            has_notified_previous_node: false,
            is_initial_round: true,
            send_conn: None,
            accepted_conns: Vec::new(),
            readers: Default::default(),
            send_timer: None,
            pending_notify: None,
            start_time: 0,
            notifies_sent: [0; 2],
            notifies_received: [0; 2],
            on_complete: None,
            cfg,
        }
    }

    pub fn set_complete_callback(&mut self, cb: CompleteCallback) {
        self.on_complete = Some(cb);
    }

    pub fn phase(&self) -> RingPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == RingPhase::Done
    }

    pub fn node_id(&self) -> u32 {
        self.cfg.node_id
    }

    pub fn all_gather_buffer(&self) -> &[i32] {
        &self.all_gather_buffer
    }

    /// ROUND_COMPLETE emissions per phase: [Scatter-Reduce, All-Gather].
    pub fn notifies_sent(&self) -> [u32; 2] {
        self.notifies_sent
    }

    pub fn notifies_received(&self) -> [u32; 2] {
        self.notifies_received
    }

    /// True iff every entry of the all-gather buffer holds the full
    /// reduction, i.e. the node count.
    pub fn verify_results(&self) -> bool {
        self.all_gather_buffer
            .iter()
            .all(|&v| v == self.cfg.num_nodes as i32)
    }

    fn start_connection_setup(&mut self, ctx: &mut Ctx) {
        info!(
            "node {}: connecting to successor at {}:{} (rcwnd {})",
            self.cfg.node_id, self.cfg.peer_addr, self.cfg.peer_port, self.cfg.rcwnd_size
        );
        ctx.listen(self.cfg.listen_addr, self.cfg.listen_port);
        ctx.connect((self.cfg.peer_addr, self.cfg.peer_port));
        self.phase = RingPhase::Connecting;
    }

    fn start_data_transfer(&mut self, ctx: &mut Ctx) {
        self.start_time = ctx.now();
        info!(
            "node {}: starting data transfer at {:?}",
            self.cfg.node_id,
            self.start_time.to_dura()
        );
        self.phase = RingPhase::ScatterReduce;
        self.current_pass = 0;
        self.is_initial_round = true;
        self.can_send = true;
        self.packets_sent_in_chunk = 0;
        for c in self.packets_received_per_chunk.iter_mut() {
            *c = 0;
        }
        self.send_loop(ctx);
    }

    fn chunk_to_send(&self) -> u32 {
        let n = self.cfg.num_nodes;
        match self.phase {
            RingPhase::AllGather => (self.cfg.node_id + n - self.current_pass + 1) % n,
            _ => (self.cfg.node_id + n - self.current_pass) % n,
        }
    }

    fn chunk_to_receive(&self) -> u32 {
        (self.chunk_to_send() + self.cfg.num_nodes - 1) % self.cfg.num_nodes
    }

    /// Emit the next record of the current chunk, pacing by packet_interval
    /// and retrying when the transport refuses the bytes. Sending a round is
    /// allowed only while the grant (`can_send`) is held.
    fn send_loop(&mut self, ctx: &mut Ctx) {
        if let Some(timer) = self.send_timer.take() {
            ctx.cancel_timer(timer);
        }
        if self.phase != RingPhase::ScatterReduce && self.phase != RingPhase::AllGather {
            return;
        }
        if self.packets_sent_in_chunk >= self.packets_per_chunk {
            self.can_send = false;
            self.check_advance(ctx);
            return;
        }
        if !self.can_send {
            debug!(
                "node {}: waiting for successor before sending round {} (initial={})",
                self.cfg.node_id, self.current_pass, self.is_initial_round
            );
            self.waiting_for_next_node = true;
            return;
        }

        let conn = match self.send_conn {
            Some(conn) => conn,
            None => {
                warn!("node {}: no connection to successor yet", self.cfg.node_id);
                return;
            }
        };

        let chunk = self.chunk_to_send();
        let opi = chunk * self.packets_per_chunk + self.packets_sent_in_chunk;
        let message_type = if self.phase == RingPhase::ScatterReduce {
            RingMessage::ScatterReduceData
        } else {
            RingMessage::AllGatherData
        };
        let header = RingHeader {
            message_type,
            original_packet_index: opi,
            agg_data: self.scatter_reduce_buffer[opi as usize],
            pass_number: self.current_pass,
            logical_chunk: chunk,
            sender_node_id: self.cfg.node_id,
            current_phase: self.phase.as_u32(),
        };
        debug!(
            "node {}: sending {:?} opi={} agg={} pass={} chunk={}",
            self.cfg.node_id,
            message_type,
            opi,
            header.agg_data,
            self.current_pass,
            chunk
        );

        let mut record = header.to_bytes();
        record.resize(self.record_len, 0);
        if ctx.stream_send(conn, &record) {
            self.packets_sent_in_chunk += 1;
            if self.packets_sent_in_chunk < self.packets_per_chunk {
                self.send_timer = Some(ctx.set_timer(self.cfg.packet_interval, TOKEN_SEND));
            } else {
                info!(
                    "node {}: finished sending chunk {} in round {}",
                    self.cfg.node_id, chunk, self.current_pass
                );
                self.can_send = false;
                self.check_advance(ctx);
            }
        } else {
            warn!("node {}: send refused, retrying", self.cfg.node_id);
            self.send_timer = Some(ctx.set_timer(self.cfg.retry_interval, TOKEN_SEND));
        }
    }

    fn handle_record(&mut self, ctx: &mut Ctx, header: RingHeader) {
        match header.message_type {
            RingMessage::RoundComplete => self.handle_round_complete(ctx, &header),
            RingMessage::ScatterReduceData if self.phase == RingPhase::ScatterReduce => {
                let expected = header.pass_number as i32 + 1;
                if header.agg_data != expected {
                    warn!(
                        "node {}: scatter-reduce payload {} but expected {}",
                        self.cfg.node_id, header.agg_data, expected
                    );
                }
                let opi = header.original_packet_index as usize;
                if opi >= self.scatter_reduce_buffer.len()
                    || header.logical_chunk >= self.cfg.num_nodes
                {
                    warn!("node {}: record indexes out of range, dropped", self.cfg.node_id);
                    return;
                }
                self.scatter_reduce_buffer[opi] += header.agg_data;
                self.record_receipt(ctx, header.logical_chunk);
            }
            RingMessage::AllGatherData if self.phase == RingPhase::AllGather => {
                if header.agg_data != self.cfg.num_nodes as i32 {
                    warn!(
                        "node {}: all-gather payload {} but expected {}",
                        self.cfg.node_id, header.agg_data, self.cfg.num_nodes
                    );
                }
                let opi = header.original_packet_index as usize;
                if opi >= self.scatter_reduce_buffer.len()
                    || header.logical_chunk >= self.cfg.num_nodes
                {
                    warn!("node {}: record indexes out of range, dropped", self.cfg.node_id);
                    return;
                }
                self.scatter_reduce_buffer[opi] = header.agg_data;
                self.all_gather_buffer[opi] = header.agg_data;
                self.record_receipt(ctx, header.logical_chunk);
            }
            other => {
                warn!(
                    "node {}: unexpected {:?} in phase {:?}, dropped",
                    self.cfg.node_id, other, self.phase
                );
            }
        }
    }

    fn record_receipt(&mut self, ctx: &mut Ctx, chunk: u32) {
        let counter = &mut self.packets_received_per_chunk[chunk as usize];
        *counter += 1;
        if *counter >= self.packets_per_chunk {
            info!(
                "node {}: finished receiving chunk {} in round {}",
                self.cfg.node_id, chunk, self.current_pass
            );
            if chunk == self.chunk_to_receive() {
                self.check_advance(ctx);
            }
        }
    }

    fn handle_round_complete(&mut self, ctx: &mut Ctx, header: &RingHeader) {
        let sender = header.sender_node_id;
        info!(
            "node {}: ROUND_COMPLETE from node {} pass={} phase={}",
            self.cfg.node_id, sender, header.pass_number, header.current_phase
        );
        if sender != (self.cfg.node_id + 1) % self.cfg.num_nodes {
            return;
        }
        if let Some(bucket) = RingPhase::bucket(header.current_phase) {
            self.notifies_received[bucket] += 1;
        }

        self.next_node_state.node_id = sender;
        self.next_node_state.current_pass = header.pass_number;
        self.next_node_state.current_phase = header.current_phase;
        self.next_node_state.ready_for_next_pass = true;

        if self.waiting_for_next_node {
            self.waiting_for_next_node = false;
            self.can_send = true;
            self.next_node_state.ready_for_next_pass = false;
            if self.packets_sent_in_chunk == 0 {
                self.send_loop(ctx);
            }
        }
    }

    /// Tell the predecessor this round is finished, on the stream it opened
    /// toward us. A refused send retries on the retry timer.
    fn send_round_complete(&mut self, ctx: &mut Ctx, pass: u32, phase: u32) {
        let header = RingHeader {
            message_type: RingMessage::RoundComplete,
            pass_number: pass,
            current_phase: phase,
            sender_node_id: self.cfg.node_id,
            ..Default::default()
        };
        let mut record = header.to_bytes();
        record.resize(self.record_len, 0);

        let mut sent = false;
        for conn in self.accepted_conns.clone() {
            if ctx.stream_send(conn, &record) {
                sent = true;
                break;
            }
        }
        if sent {
            info!(
                "node {}: sent ROUND_COMPLETE pass={} phase={}",
                self.cfg.node_id, pass, phase
            );
            if let Some(bucket) = RingPhase::bucket(phase) {
                self.notifies_sent[bucket] += 1;
            }
        } else {
            warn!(
                "node {}: could not send ROUND_COMPLETE, will retry",
                self.cfg.node_id
            );
            self.pending_notify = Some((pass, phase));
            ctx.set_timer(self.cfg.retry_interval, TOKEN_NOTIFY);
        }
    }

    /// Round transition: once sending and receiving are both finished the
    /// peer notifies its predecessor exactly once and moves its receive side
    /// forward; the send side additionally waits for the successor's grant.
    fn check_advance(&mut self, ctx: &mut Ctx) {
        let sending_done = self.packets_sent_in_chunk >= self.packets_per_chunk;
        let receiving_done = self.packets_received_per_chunk[self.chunk_to_receive() as usize]
            >= self.packets_per_chunk;
        debug!(
            "node {}: round {} sending_done={} receiving_done={}",
            self.cfg.node_id, self.current_pass, sending_done, receiving_done
        );

        if sending_done && receiving_done && !self.has_notified_previous_node {
            self.send_round_complete(ctx, self.current_pass, self.phase.as_u32());
            self.has_notified_previous_node = true;
            self.waiting_for_next_node = true;
            self.advance_receiving(ctx);
        }

        if sending_done && receiving_done && self.next_node_state.ready_for_next_pass {
            self.can_send = true;
            self.waiting_for_next_node = false;
            self.advance_sending(ctx);
        }
    }

    fn advance_receiving(&mut self, ctx: &mut Ctx) {
        match self.phase {
            RingPhase::ScatterReduce => {
                if self.current_pass < self.cfg.num_nodes - 2 {
                    self.advance_pass();
                } else {
                    self.advance_phase();
                }
            }
            RingPhase::AllGather => {
                if self.current_pass < self.cfg.num_nodes - 2 {
                    self.advance_pass();
                } else {
                    self.finish(ctx);
                }
            }
            _ => {}
        }
    }

    fn advance_pass(&mut self) {
        self.current_pass += 1;
        self.is_initial_round = false;
        self.packets_sent_in_chunk = 0;
        for c in self.packets_received_per_chunk.iter_mut() {
            *c = 0;
        }
        self.has_notified_previous_node = false;
        self.can_send = self.next_node_state.ready_for_next_pass;
        info!(
            "node {}: entering round {} of phase {:?}",
            self.cfg.node_id, self.current_pass, self.phase
        );
    }

    fn advance_phase(&mut self) {
        self.phase = RingPhase::AllGather;
        self.current_pass = 0;
        self.is_initial_round = true;
        self.packets_sent_in_chunk = 0;
        for c in self.packets_received_per_chunk.iter_mut() {
            *c = 0;
        }
        self.has_notified_previous_node = false;
        self.can_send = self.next_node_state.ready_for_next_pass;

        // the chunk this node finished reducing carries the full sum now
        let my_chunk = (self.cfg.node_id + 1) % self.cfg.num_nodes;
        for i in 0..self.packets_per_chunk {
            let opi = (my_chunk * self.packets_per_chunk + i) as usize;
            if self.scatter_reduce_buffer[opi] == self.cfg.num_nodes as i32 {
                self.all_gather_buffer[opi] = self.scatter_reduce_buffer[opi];
            }
        }
        info!("node {}: entering ALL_GATHER", self.cfg.node_id);
    }

    fn advance_sending(&mut self, ctx: &mut Ctx) {
        self.next_node_state.ready_for_next_pass = false;
        self.can_send = true;
        self.send_loop(ctx);
    }

    fn finish(&mut self, ctx: &mut Ctx) {
        self.phase = RingPhase::Done;
        if let Some(timer) = self.send_timer.take() {
            ctx.cancel_timer(timer);
        }
        self.pending_notify = None;

        for i in 0..self.cfg.total_packets as usize {
            if self.scatter_reduce_buffer[i] == self.cfg.num_nodes as i32 {
                self.all_gather_buffer[i] = self.scatter_reduce_buffer[i];
            }
        }

        let elapsed = ctx.now().saturating_sub(self.start_time);
        info!(
            "node {}: Ring AllReduce complete in {:?}, verification {}",
            self.cfg.node_id,
            elapsed.to_dura(),
            if self.verify_results() { "ok" } else { "FAILED" }
        );
        if let Some(cb) = self.on_complete.as_mut() {
            cb(self.cfg.node_id);
        }
    }

    /// Called at simulation teardown; reports a ring that never finished.
    pub fn report_if_incomplete(&self) {
        if self.phase != RingPhase::Done {
            error!(
                "node {}: Ring AllReduce apparently incomplete in phase {:?}, verification {}",
                self.cfg.node_id,
                self.phase,
                if self.verify_results() { "ok" } else { "failed" }
            );
        }
    }
}

impl Endpoint for RingPeer {
    fn on_start(&mut self, ctx: &mut Ctx) {
        if self.cfg.connection_start > 0 {
            info!(
                "node {}: will connect after {:?}",
                self.cfg.node_id,
                self.cfg.connection_start.to_dura()
            );
            ctx.set_timer(self.cfg.connection_start, TOKEN_CONNECT);
        } else {
            self.start_connection_setup(ctx);
        }
    }

    fn on_stream_connected(&mut self, ctx: &mut Ctx, conn: ConnId) {
        info!("node {}: connected to successor", self.cfg.node_id);
        self.send_conn = Some(conn);
        self.readers.insert(conn, FrameReader::new(self.record_len));
        if self.phase == RingPhase::Connecting {
            let now = ctx.now();
            if self.cfg.transfer_start > now {
                ctx.set_timer(self.cfg.transfer_start - now, TOKEN_TRANSFER);
            } else {
                self.start_data_transfer(ctx);
            }
        }
    }

    fn on_stream_accepted(&mut self, _ctx: &mut Ctx, conn: ConnId) {
        info!("node {}: accepted predecessor connection", self.cfg.node_id);
        self.accepted_conns.push(conn);
        self.readers.insert(conn, FrameReader::new(self.record_len));
    }

    fn on_stream_data(&mut self, ctx: &mut Ctx, conn: ConnId, bytes: &[u8]) {
        let record_len = self.record_len;
        let reader = self
            .readers
            .entry(conn)
            .or_insert_with(|| FrameReader::new(record_len));
        reader.push(bytes);

        loop {
            let record = match self.readers.get_mut(&conn).and_then(|r| r.next_record()) {
                Some(rec) => rec,
                None => break,
            };
            match RingHeader::decode(&record[..HEADER_LEN]) {
                Ok(header) => self.handle_record(ctx, header),
                Err(e) => warn!("node {}: undecodable record: {}", self.cfg.node_id, e),
            }
        }
    }

    fn on_connect_failed(&mut self, _ctx: &mut Ctx) {
        error!("node {}: failed to connect to successor", self.cfg.node_id);
    }

    fn on_timer(&mut self, ctx: &mut Ctx, token: Token) {
        match token {
            TOKEN_CONNECT => self.start_connection_setup(ctx),
            TOKEN_TRANSFER => self.start_data_transfer(ctx),
            TOKEN_SEND => {
                self.send_timer = None;
                self.send_loop(ctx);
            }
            TOKEN_NOTIFY => {
                if let Some((pass, phase)) = self.pending_notify.take() {
                    self.send_round_complete(ctx, pass, phase);
                }
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(node_id: u32) -> RingPeer {
        RingPeer::new(RingConfig {
            node_id,
            num_nodes: 4,
            total_packets: 16,
            listen_addr: Ipv4Addr::new(10, 0, 0, node_id as u8 + 1),
            listen_port: 5000,
            peer_addr: Ipv4Addr::new(10, 0, 0, (node_id as u8 + 1) % 4 + 1),
            peer_port: 5000,
            ..Default::default()
        })
    }

    #[test]
    fn scatter_reduce_chunk_schedule() {
        let mut p = peer(2);
        p.phase = RingPhase::ScatterReduce;
        // node i sends chunk (i - k) mod N and receives the one before it
        p.current_pass = 0;
        assert_eq!(p.chunk_to_send(), 2);
        assert_eq!(p.chunk_to_receive(), 1);
        p.current_pass = 1;
        assert_eq!(p.chunk_to_send(), 1);
        assert_eq!(p.chunk_to_receive(), 0);
        p.current_pass = 2;
        assert_eq!(p.chunk_to_send(), 0);
        assert_eq!(p.chunk_to_receive(), 3);
    }

    #[test]
    fn all_gather_chunk_schedule() {
        let mut p = peer(0);
        p.phase = RingPhase::AllGather;
        p.current_pass = 0;
        assert_eq!(p.chunk_to_send(), 1);
        assert_eq!(p.chunk_to_receive(), 0);
        p.current_pass = 2;
        assert_eq!(p.chunk_to_send(), 3);
        assert_eq!(p.chunk_to_receive(), 2);
    }

    #[test]
    fn buffers_initialized_per_protocol() {
        let p = peer(0);
        assert!(p.scatter_reduce_buffer.iter().all(|&v| v == 1));
        assert!(p.all_gather_buffer.iter().all(|&v| v == 0));
        assert_eq!(p.packets_per_chunk, 4);
        assert!(!p.verify_results());
    }

    #[test]
    #[should_panic(expected = "divide evenly")]
    fn rejects_indivisible_total() {
        RingPeer::new(RingConfig {
            num_nodes: 4,
            total_packets: 10,
            ..Default::default()
        });
    }
}
