use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Result};
use log::info;
use structopt::StructOpt;

use ringall::peer::RingPeer;
use ringall::ring_layout;
use simnet::{secs, NetConfig, Simulator, StreamConfig};

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "ringall", about = "Ring AllReduce over framed TCP streams")]
struct Opt {
    /// Number of peers on the ring.
    #[structopt(short = "w", long = "num_nodes", default_value = "4")]
    num_nodes: u32,

    /// Global array size; must be divisible by num_nodes.
    #[structopt(short = "n", long = "total_packets", default_value = "16")]
    total_packets: u32,

    /// Payload bytes behind every record header.
    #[structopt(long = "payload_size", default_value = "1024")]
    payload_size: usize,

    /// Extra uniform stream delay in nanoseconds, to model a lossy link's
    /// recovery jitter.
    #[structopt(long = "jitter", default_value = "0")]
    jitter: u64,

    /// RNG seed.
    #[structopt(long = "seed", default_value = "0")]
    seed: u64,

    /// Simulated seconds to run before giving up.
    #[structopt(long = "time_limit", default_value = "600")]
    time_limit: u64,
}

fn main() -> Result<()> {
    simnet::logging::init_log();

    let opt = Opt::from_args();
    info!("Opts: {:#?}", opt);

    let net = NetConfig {
        seed: opt.seed,
        stream: StreamConfig {
            jitter: opt.jitter,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut sim = Simulator::new(net);
    let completions: Rc<RefCell<Vec<u32>>> = Default::default();

    let eps: Vec<_> = ring_layout(opt.num_nodes, opt.total_packets, opt.payload_size, secs(5))
        .into_iter()
        .map(|cfg| {
            let addr = cfg.listen_addr;
            let mut node = RingPeer::new(cfg);
            let log = Rc::clone(&completions);
            node.set_complete_callback(Box::new(move |id| log.borrow_mut().push(id)));
            sim.add_endpoint(Box::new(node), vec![addr], 0)
        })
        .collect();

    sim.run_until(secs(opt.time_limit));

    let mut ok = true;
    for ep in &eps {
        let node = sim.endpoint(*ep).as_any().downcast_ref::<RingPeer>().unwrap();
        node.report_if_incomplete();
        if !node.is_done() || !node.verify_results() {
            ok = false;
        }
    }
    info!(
        "{}/{} nodes completed and verified",
        completions.borrow().len(),
        opt.num_nodes
    );
    if !ok {
        bail!("ring allreduce did not verify on every node");
    }
    Ok(())
}
