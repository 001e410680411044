use std::cell::RefCell;
use std::rc::Rc;

use ringall::peer::{RingPeer, RingPhase};
use ringall::ring_layout;
use simnet::{millis, secs, EndpointId, NetConfig, Simulator, StreamConfig};

struct Ring {
    sim: Simulator,
    eps: Vec<EndpointId>,
    completions: Rc<RefCell<Vec<u32>>>,
}

fn build_ring(num_nodes: u32, total_packets: u32, stream: StreamConfig, seed: u64) -> Ring {
    let net = NetConfig {
        seed,
        stream,
        ..Default::default()
    };
    let mut sim = Simulator::new(net);
    let completions: Rc<RefCell<Vec<u32>>> = Default::default();

    let eps = ring_layout(num_nodes, total_packets, 1024, secs(5))
        .into_iter()
        .map(|cfg| {
            let addr = cfg.listen_addr;
            let mut node = RingPeer::new(cfg);
            let log = Rc::clone(&completions);
            node.set_complete_callback(Box::new(move |id| log.borrow_mut().push(id)));
            sim.add_endpoint(Box::new(node), vec![addr], 0)
        })
        .collect();

    Ring {
        sim,
        eps,
        completions,
    }
}

fn run_to_completion(ring: &mut Ring, num_nodes: usize, limit_secs: u64) {
    let deadline = secs(limit_secs);
    while ring.sim.now() < deadline && ring.completions.borrow().len() < num_nodes {
        let next = ring.sim.now() + secs(1);
        ring.sim.run_until(next.min(deadline));
    }
}

fn node<'s>(ring: &'s Ring, i: usize) -> &'s RingPeer {
    ring.sim
        .endpoint(ring.eps[i])
        .as_any()
        .downcast_ref::<RingPeer>()
        .unwrap()
}

#[test]
fn four_peers_no_loss() {
    simnet::logging::init_log();

    let mut ring = build_ring(4, 16, Default::default(), 0);
    run_to_completion(&mut ring, 4, 120);

    assert_eq!(ring.completions.borrow().len(), 4);
    for i in 0..4 {
        let n = node(&ring, i);
        assert_eq!(n.phase(), RingPhase::Done);
        assert!(n.verify_results());
        assert_eq!(n.all_gather_buffer(), &[4; 16][..]);
    }
}

#[test]
fn four_peers_jittery_constrained_stream() {
    simnet::logging::init_log();

    // model a lossy link's recovery: delivery jitter, small segments, and a
    // send buffer barely above two records so refused sends get retried
    let stream = StreamConfig {
        jitter: millis(2),
        mss: 512,
        send_buf: 2200,
        ..Default::default()
    };
    let mut ring = build_ring(4, 16, stream, 11);
    run_to_completion(&mut ring, 4, 300);

    assert_eq!(ring.completions.borrow().len(), 4);
    for i in 0..4 {
        let n = node(&ring, i);
        assert!(n.verify_results(), "node {} result mismatch", i);
        // one backward notification per round, N-1 rounds per phase
        assert_eq!(n.notifies_sent(), [3, 3], "node {} sent counts", i);
        assert_eq!(n.notifies_received(), [3, 3], "node {} received counts", i);
    }
}

#[test]
fn two_peers_minimal_ring() {
    simnet::logging::init_log();

    let mut ring = build_ring(2, 8, Default::default(), 2);
    run_to_completion(&mut ring, 2, 120);

    assert_eq!(ring.completions.borrow().len(), 2);
    for i in 0..2 {
        let n = node(&ring, i);
        assert!(n.verify_results());
        assert_eq!(n.all_gather_buffer(), &[2; 8][..]);
        // a single round per phase
        assert_eq!(n.notifies_sent(), [1, 1]);
    }
}

#[test]
fn completion_hooks_fire_once_each() {
    simnet::logging::init_log();

    let mut ring = build_ring(4, 16, Default::default(), 5);
    run_to_completion(&mut ring, 4, 120);

    let mut ids = ring.completions.borrow().clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}
