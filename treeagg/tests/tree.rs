use std::any::Any;

use simnet::{millis, secs, Ctx, Datagram, DatagramConfig, Endpoint, NetConfig, Simulator};
use treeagg::header::{AggHeader, FLAG_ACK, FLAG_NACK};
use treeagg::host::HostStack;
use treeagg::switch::SwitchEngine;
use treeagg::topology::{balanced_binary_tree, instantiate, TreeParams, TreeSim};
use treeagg::{HostConfig, EMITTER_PORT_BASE, SERVICE_PORT};

fn net_config(loss: f64, jitter: u64, seed: u64) -> NetConfig {
    NetConfig {
        seed,
        datagram: DatagramConfig {
            loss_rate: loss,
            jitter,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Run until every host's completion hook fired or the time limit passes.
fn run_to_completion(tree: &mut TreeSim, num_hosts: usize, limit_secs: u64) {
    let deadline = secs(limit_secs);
    while tree.sim.now() < deadline && tree.completions.borrow().len() < num_hosts {
        let next = tree.sim.now() + secs(1);
        tree.sim.run_until(next.min(deadline));
    }
}

fn host<'s>(tree: &'s TreeSim, i: usize) -> &'s HostStack {
    tree.sim
        .endpoint(tree.host_eps[i])
        .as_any()
        .downcast_ref::<HostStack>()
        .unwrap()
}

fn switch<'s>(tree: &'s TreeSim, i: usize) -> &'s SwitchEngine {
    tree.sim
        .endpoint(tree.switch_eps[i])
        .as_any()
        .downcast_ref::<SwitchEngine>()
        .unwrap()
}

#[test]
fn two_hosts_one_switch() {
    simnet::logging::init_log();

    let params = TreeParams {
        num_hosts: 2,
        total_packets: 3,
        array_size: 8,
        ..Default::default()
    };
    let layout = balanced_binary_tree(&params);
    assert_eq!(layout.switches.len(), 1);

    let mut tree = instantiate(&layout, net_config(0.0, 0, 0));
    run_to_completion(&mut tree, 2, 60);

    let completions = tree.completions.borrow().clone();
    assert_eq!(completions.len(), 2, "every hook fires exactly once");
    let mut ids = completions.clone();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 2, "no host completed twice");

    for i in 0..2 {
        let h = host(&tree, i);
        assert!(h.is_completed());
        assert_eq!(h.result_buffer(), &[2, 2, 2]);
    }

    // the three used slots advanced by exactly the array size, the rest did not
    let psns = switch(&tree, 0).agg_psns(params.group_id).unwrap();
    for (i, &psn) in psns.iter().enumerate() {
        if i < 3 {
            assert_eq!(psn, i as u32 + 8);
        } else {
            assert_eq!(psn, i as u32);
        }
    }
    let (deg, rdeg) = switch(&tree, 0).max_degrees(params.group_id).unwrap();
    assert_eq!((deg, rdeg), (0, 0), "all slots recycled");
}

#[test]
fn four_hosts_balanced_tree() {
    simnet::logging::init_log();

    let params = TreeParams {
        num_hosts: 4,
        total_packets: 2048,
        array_size: 2048,
        ..Default::default()
    };
    let layout = balanced_binary_tree(&params);
    assert_eq!(layout.switches.len(), 3);

    let mut tree = instantiate(&layout, net_config(0.0, 0, 1));
    run_to_completion(&mut tree, 4, 120);

    assert_eq!(tree.completions.borrow().len(), 4);
    for i in 0..4 {
        let h = host(&tree, i);
        assert!(h.is_completed());
        assert_eq!(h.result_buffer().len(), 2048);
        assert!(h.result_buffer().iter().all(|&v| v == 4));
    }
}

#[test]
fn thirty_two_hosts_with_loss() {
    simnet::logging::init_log();

    let params = TreeParams {
        num_hosts: 32,
        total_packets: 2048,
        array_size: 2048,
        ..Default::default()
    };
    let layout = balanced_binary_tree(&params);
    assert_eq!(layout.switches.len(), 31);

    // 1% loss plus enough jitter to reorder datagrams
    let mut tree = instantiate(&layout, net_config(0.01, millis(2), 7));
    run_to_completion(&mut tree, 32, 600);

    assert_eq!(
        tree.completions.borrow().len(),
        32,
        "every host eventually completes under loss"
    );
    for i in 0..32 {
        let h = host(&tree, i);
        assert!(h.result_buffer().iter().all(|&v| v == 32));
    }
    for s in 0..31 {
        let (deg, rdeg) = switch(&tree, s).max_degrees(params.group_id).unwrap();
        assert!(deg <= 2, "degree within fan-in");
        assert!(rdeg <= 2, "rDegree within fan-in");
    }
}

#[test]
fn slots_are_reused_cyclically() {
    simnet::logging::init_log();

    // a window wider than the slot array forces early records through the
    // NAK/replay machinery while slots recycle
    let params = TreeParams {
        num_hosts: 2,
        total_packets: 32,
        array_size: 4,
        window_size: 8,
        ..Default::default()
    };
    let layout = balanced_binary_tree(&params);
    let mut tree = instantiate(&layout, net_config(0.0, 0, 9));
    run_to_completion(&mut tree, 2, 300);

    assert_eq!(tree.completions.borrow().len(), 2);
    for i in 0..2 {
        assert_eq!(host(&tree, i).result_buffer(), &[2; 32][..]);
    }
    // every slot served 32/4 epochs, each advancing it by the array size
    let psns = switch(&tree, 0).agg_psns(params.group_id).unwrap();
    for (i, &psn) in psns.iter().enumerate() {
        assert_eq!(psn, i as u32 + 32);
    }
}

#[test]
fn single_packet_boundary() {
    simnet::logging::init_log();

    let params = TreeParams {
        num_hosts: 2,
        total_packets: 1,
        array_size: 8,
        window_size: 4,
        ..Default::default()
    };
    let layout = balanced_binary_tree(&params);
    let mut tree = instantiate(&layout, net_config(0.0, 0, 0));
    run_to_completion(&mut tree, 2, 60);

    for i in 0..2 {
        let h = host(&tree, i);
        assert!(h.is_completed());
        assert_eq!(h.result_buffer(), &[2]);
        assert_eq!(h.window_end(), 0);
        assert_eq!(h.next_psn(), 1);
    }
}

#[test]
fn window_invariants_hold_throughout() {
    simnet::logging::init_log();

    let params = TreeParams {
        num_hosts: 2,
        total_packets: 64,
        window_size: 4,
        array_size: 64,
        ..Default::default()
    };
    let layout = balanced_binary_tree(&params);
    let n = params.total_packets;
    let w = params.window_size;

    let mut tree = instantiate(&layout, net_config(0.0, 0, 3));
    let deadline = secs(120);
    while tree.sim.now() < deadline && tree.completions.borrow().len() < 2 {
        let next = tree.sim.now() + millis(5);
        tree.sim.run_until(next);
        for i in 0..2 {
            let h = host(&tree, i);
            let base = h.window_base();
            let end = h.window_end();
            let next_psn = h.next_psn();
            assert!(base <= next_psn, "base {} > next {}", base, next_psn);
            assert!(next_psn <= end + 1, "next {} > end {} + 1", next_psn, end);
            assert!(end < n, "end {} outside [0, {})", end, n);
            if base <= end {
                assert!(end - base + 1 <= w, "window wider than {}", w);
            } else {
                assert!(h.is_completed() || base == end + 1);
            }
        }
    }
    assert_eq!(tree.completions.borrow().len(), 2);
}

/// A peer standing in for the aggregation tree: ACKs every upstream record
/// twice and answers it with the same downstream result record twice, so the
/// host sees duplicate ACKs and duplicate data.
struct DuplicatingPeer {
    addr: std::net::Ipv4Addr,
    qp: u16,
    result: i32,
}

impl Endpoint for DuplicatingPeer {
    fn on_start(&mut self, ctx: &mut Ctx) {
        ctx.listen(self.addr, SERVICE_PORT);
    }

    fn on_datagram(&mut self, ctx: &mut Ctx, dgram: Datagram) {
        let header = AggHeader::decode(&dgram.payload).unwrap();
        if header.has_flag(FLAG_ACK) || header.has_flag(FLAG_NACK) {
            return;
        }
        let ack = header.ack_reply(header.agg_data);
        for _ in 0..2 {
            ctx.send_datagram(Datagram {
                src: (self.addr, EMITTER_PORT_BASE + self.qp),
                dst: (ack.dst_addr, SERVICE_PORT),
                payload: ack.to_bytes(),
            });
        }
        let mut result = header.ack_reply(self.result);
        result.unset_flag(FLAG_ACK);
        for _ in 0..2 {
            ctx.send_datagram(Datagram {
                src: (self.addr, EMITTER_PORT_BASE + self.qp),
                dst: (result.dst_addr, SERVICE_PORT),
                payload: result.to_bytes(),
            });
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn duplicates_are_idempotent() {
    simnet::logging::init_log();

    let host_addr = std::net::Ipv4Addr::new(10, 9, 0, 1);
    let peer_addr = std::net::Ipv4Addr::new(10, 9, 0, 2);

    let mut sim = Simulator::new(net_config(0.0, 0, 0));
    let peer = DuplicatingPeer {
        addr: peer_addr,
        qp: 9,
        result: 42,
    };
    sim.add_endpoint(Box::new(peer), vec![peer_addr], 0);

    let cfg = HostConfig {
        server_id: "host_dup".into(),
        total_packets: 8,
        window_size: 4,
        local_addr: host_addr,
        local_qp: 1,
        remote_addr: peer_addr,
        remote_qp: 9,
        ..Default::default()
    };
    let mut stack = HostStack::new(cfg);
    let fired = std::rc::Rc::new(std::cell::RefCell::new(0u32));
    let counter = std::rc::Rc::clone(&fired);
    stack.set_complete_callback(Box::new(move |_| *counter.borrow_mut() += 1));
    let ep = sim.add_endpoint(Box::new(stack), vec![host_addr], millis(1));

    sim.run_until(secs(30));

    let h = sim.endpoint(ep).as_any().downcast_ref::<HostStack>().unwrap();
    assert!(h.is_completed());
    assert_eq!(*fired.borrow(), 1, "completion hook fired exactly once");
    assert!(h.result_buffer().iter().all(|&v| v == 42));
}
