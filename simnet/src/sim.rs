use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::Ipv4Addr;

use fnv::FnvBuildHasher;
use indexmap::{IndexMap, IndexSet};
use log::{trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::endpoint::{Ctx, Datagram, Endpoint};
use crate::{millis, Duration, Timestamp, Token};

type HashMap<K, V> = IndexMap<K, V, FnvBuildHasher>;
type HashSet<K> = IndexSet<K, FnvBuildHasher>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId(pub usize);

/// Handle to a registered timer. Cancellation is honored up to the moment
/// the timer fires; cancelling a fired or foreign handle is a no-op.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DatagramConfig {
    /// one-way delivery delay
    pub delay: Duration,
    /// extra uniform delay in [0, jitter]; large values reorder datagrams
    pub jitter: Duration,
    pub loss_rate: f64,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        DatagramConfig {
            delay: millis(1),
            jitter: 0,
            loss_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    pub delay: Duration,
    /// extra uniform delay in [0, jitter]; deliveries never reorder
    pub jitter: Duration,
    /// largest contiguous chunk handed to the receiver in one event
    pub mss: usize,
    /// per-direction in-flight byte capacity
    pub send_buf: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            delay: millis(1),
            jitter: 0,
            mss: 1460,
            send_buf: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    pub seed: u64,
    pub datagram: DatagramConfig,
    pub stream: StreamConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            seed: 0,
            datagram: Default::default(),
            stream: Default::default(),
        }
    }
}

enum EventKind {
    Start(EndpointId),
    Timer {
        ep: EndpointId,
        timer: TimerId,
        token: Token,
    },
    Datagram {
        ep: EndpointId,
        dgram: Datagram,
    },
    ConnectAttempt {
        ep: EndpointId,
        remote: (Ipv4Addr, u16),
    },
    Connected {
        ep: EndpointId,
        conn: ConnId,
    },
    Accepted {
        ep: EndpointId,
        conn: ConnId,
    },
    ConnectFailed {
        ep: EndpointId,
    },
    Segment {
        ep: EndpointId,
        conn: ConnId,
        dir: usize,
        bytes: Vec<u8>,
    },
}

struct EventEntry {
    ts: Timestamp,
    seq: u64,
    kind: EventKind,
}

impl PartialEq for EventEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.seq == other.seq
    }
}

impl Eq for EventEntry {}

impl PartialOrd for EventEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ts, self.seq).cmp(&(other.ts, other.seq))
    }
}

struct ConnDir {
    dst_ep: EndpointId,
    in_flight: usize,
    last_deliver: Timestamp,
}

/// A full-duplex reliable byte pipe. Direction 0 runs initiator -> acceptor.
struct StreamConn {
    dirs: [ConnDir; 2],
}

pub(crate) struct Core {
    pub(crate) now: Timestamp,
    config: NetConfig,
    rng: StdRng,
    heap: BinaryHeap<Reverse<EventEntry>>,
    next_seq: u64,
    next_timer: u64,
    next_conn: u64,
    cancelled: HashSet<u64>,
    addr_map: HashMap<Ipv4Addr, EndpointId>,
    listeners: HashMap<(Ipv4Addr, u16), EndpointId>,
    conns: HashMap<ConnId, StreamConn>,
}

impl Core {
    fn push(&mut self, ts: Timestamp, kind: EventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(EventEntry { ts, seq, kind }));
    }

    fn jittered(&mut self, delay: Duration, jitter: Duration) -> Duration {
        if jitter == 0 {
            delay
        } else {
            delay + self.rng.gen_range(0..=jitter)
        }
    }

    pub(crate) fn set_timer(&mut self, ep: EndpointId, delay: Duration, token: Token) -> TimerId {
        let timer = TimerId(self.next_timer);
        self.next_timer += 1;
        let ts = self.now + delay;
        self.push(ts, EventKind::Timer { ep, timer, token });
        timer
    }

    pub(crate) fn cancel_timer(&mut self, id: TimerId) {
        self.cancelled.insert(id.0);
    }

    pub(crate) fn send_datagram(&mut self, dgram: Datagram) {
        let dst_ep = match self.addr_map.get(&dgram.dst.0) {
            Some(ep) => *ep,
            None => {
                warn!("no endpoint at {}, datagram dropped", dgram.dst.0);
                return;
            }
        };
        let loss = self.config.datagram.loss_rate;
        if loss > 0.0 && self.rng.gen_bool(loss) {
            trace!(
                "datagram {} -> {} lost on the wire",
                dgram.src.0,
                dgram.dst.0
            );
            return;
        }
        let DatagramConfig { delay, jitter, .. } = self.config.datagram;
        let delay = self.jittered(delay, jitter);
        let ts = self.now + delay;
        self.push(ts, EventKind::Datagram { ep: dst_ep, dgram });
    }

    pub(crate) fn listen(&mut self, ep: EndpointId, addr: Ipv4Addr, port: u16) {
        // rebinding the same endpoint is idempotent
        if let Some(prev) = self.listeners.insert((addr, port), ep) {
            if prev != ep {
                warn!("listener at {}:{} replaced", addr, port);
            }
        }
    }

    pub(crate) fn connect(&mut self, ep: EndpointId, remote: (Ipv4Addr, u16)) {
        let delay = self.config.stream.delay;
        let ts = self.now + delay;
        self.push(ts, EventKind::ConnectAttempt { ep, remote });
    }

    pub(crate) fn stream_send(&mut self, ep: EndpointId, conn: ConnId, bytes: &[u8]) -> bool {
        let StreamConfig {
            delay,
            jitter,
            mss,
            send_buf,
        } = self.config.stream;

        let dir = {
            let c = match self.conns.get(&conn) {
                Some(c) => c,
                None => {
                    warn!("stream_send on unknown conn {:?}", conn);
                    return false;
                }
            };
            // the sender emits on the direction whose destination is the peer
            if c.dirs[0].dst_ep != ep {
                0
            } else {
                1
            }
        };

        {
            let d = &self.conns[&conn].dirs[dir];
            if d.in_flight + bytes.len() > send_buf {
                return false;
            }
        }

        let mut offset = 0;
        while offset < bytes.len() {
            let end = usize::min(offset + mss, bytes.len());
            let chunk = bytes[offset..end].to_vec();
            let delay = self.jittered(delay, jitter);
            let c = self.conns.get_mut(&conn).unwrap();
            let d = &mut c.dirs[dir];
            d.in_flight += chunk.len();
            let ts = Timestamp::max(self.now + delay, d.last_deliver);
            d.last_deliver = ts;
            let dst = d.dst_ep;
            self.push(
                ts,
                EventKind::Segment {
                    ep: dst,
                    conn,
                    dir,
                    bytes: chunk,
                },
            );
            offset = end;
        }
        true
    }
}

/// The event-loop driver. Owns the endpoints and the network core; runs all
/// handlers serially in timestamp order.
pub struct Simulator {
    core: Core,
    endpoints: Vec<Option<Box<dyn Endpoint>>>,
}

impl Simulator {
    pub fn new(config: NetConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Simulator {
            core: Core {
                now: 0,
                config,
                rng,
                heap: BinaryHeap::new(),
                next_seq: 0,
                next_timer: 0,
                next_conn: 0,
                cancelled: Default::default(),
                addr_map: Default::default(),
                listeners: Default::default(),
                conns: Default::default(),
            },
            endpoints: Vec::new(),
        }
    }

    /// Register an endpoint owning the given interface addresses. Its
    /// `on_start` runs at `start`.
    pub fn add_endpoint(
        &mut self,
        endpoint: Box<dyn Endpoint>,
        addrs: Vec<Ipv4Addr>,
        start: Timestamp,
    ) -> EndpointId {
        let id = EndpointId(self.endpoints.len());
        for addr in addrs {
            if self.core.addr_map.insert(addr, id).is_some() {
                panic!("address {} assigned twice", addr);
            }
        }
        self.endpoints.push(Some(endpoint));
        self.core.push(start, EventKind::Start(id));
        id
    }

    #[inline]
    pub fn now(&self) -> Timestamp {
        self.core.now
    }

    pub fn endpoint(&self, id: EndpointId) -> &dyn Endpoint {
        self.endpoints[id.0].as_deref().expect("endpoint busy")
    }

    /// Run every event with a timestamp not beyond `deadline`.
    pub fn run_until(&mut self, deadline: Timestamp) {
        while let Some(Reverse(head)) = self.core.heap.peek() {
            if head.ts > deadline {
                break;
            }
            let Reverse(entry) = self.core.heap.pop().unwrap();
            debug_assert!(entry.ts >= self.core.now);
            self.core.now = entry.ts;
            self.dispatch(entry.kind);
        }
        if self.core.now < deadline {
            self.core.now = deadline;
        }
    }

    fn dispatch(&mut self, kind: EventKind) {
        match kind {
            EventKind::Start(ep) => {
                self.with_endpoint(ep, |e, ctx| e.on_start(ctx));
            }
            EventKind::Timer { ep, timer, token } => {
                if self.core.cancelled.remove(&timer.0) {
                    return;
                }
                self.with_endpoint(ep, |e, ctx| e.on_timer(ctx, token));
            }
            EventKind::Datagram { ep, dgram } => {
                self.with_endpoint(ep, |e, ctx| e.on_datagram(ctx, dgram));
            }
            EventKind::ConnectAttempt { ep, remote } => {
                match self.core.listeners.get(&remote).copied() {
                    Some(listener) => {
                        let conn = ConnId(self.core.next_conn);
                        self.core.next_conn += 1;
                        let now = self.core.now;
                        self.core.conns.insert(
                            conn,
                            StreamConn {
                                dirs: [
                                    ConnDir {
                                        dst_ep: listener,
                                        in_flight: 0,
                                        last_deliver: now,
                                    },
                                    ConnDir {
                                        dst_ep: ep,
                                        in_flight: 0,
                                        last_deliver: now,
                                    },
                                ],
                            },
                        );
                        self.core.push(now, EventKind::Accepted { ep: listener, conn });
                        self.core.push(now, EventKind::Connected { ep, conn });
                    }
                    None => {
                        warn!("connect to {}:{} refused, nobody listening", remote.0, remote.1);
                        let now = self.core.now;
                        self.core.push(now, EventKind::ConnectFailed { ep });
                    }
                }
            }
            EventKind::Connected { ep, conn } => {
                self.with_endpoint(ep, |e, ctx| e.on_stream_connected(ctx, conn));
            }
            EventKind::Accepted { ep, conn } => {
                self.with_endpoint(ep, |e, ctx| e.on_stream_accepted(ctx, conn));
            }
            EventKind::ConnectFailed { ep } => {
                self.with_endpoint(ep, |e, ctx| e.on_connect_failed(ctx));
            }
            EventKind::Segment {
                ep,
                conn,
                dir,
                bytes,
            } => {
                if let Some(c) = self.core.conns.get_mut(&conn) {
                    c.dirs[dir].in_flight -= bytes.len();
                }
                self.with_endpoint(ep, |e, ctx| e.on_stream_data(ctx, conn, &bytes));
            }
        }
    }

    fn with_endpoint<F>(&mut self, ep: EndpointId, f: F)
    where
        F: FnOnce(&mut dyn Endpoint, &mut Ctx),
    {
        let mut endpoint = self.endpoints[ep.0].take().expect("reentrant dispatch");
        {
            let mut ctx = Ctx {
                core: &mut self.core,
                ep,
            };
            f(endpoint.as_mut(), &mut ctx);
        }
        self.endpoints[ep.0] = Some(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        got: Vec<u8>,
    }

    impl Endpoint for Echo {
        fn on_start(&mut self, ctx: &mut Ctx) {
            ctx.set_timer(millis(5), Token(7));
        }
        fn on_timer(&mut self, _ctx: &mut Ctx, token: Token) {
            self.got.push(token.0 as u8);
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn timer_fires_once() {
        let mut sim = Simulator::new(Default::default());
        let id = sim.add_endpoint(
            Box::new(Echo { got: vec![] }),
            vec![Ipv4Addr::new(10, 0, 0, 1)],
            0,
        );
        sim.run_until(millis(100));
        let echo = sim.endpoint(id).as_any().downcast_ref::<Echo>().unwrap();
        assert_eq!(echo.got, vec![7]);
    }

    struct Cancels;

    impl Endpoint for Cancels {
        fn on_start(&mut self, ctx: &mut Ctx) {
            let id = ctx.set_timer(millis(5), Token(1));
            ctx.cancel_timer(id);
        }
        fn on_timer(&mut self, _ctx: &mut Ctx, _token: Token) {
            panic!("cancelled timer fired");
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut sim = Simulator::new(Default::default());
        sim.add_endpoint(Box::new(Cancels), vec![Ipv4Addr::new(10, 0, 0, 2)], 0);
        sim.run_until(millis(100));
    }
}
