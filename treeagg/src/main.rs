use anyhow::{bail, Result};
use log::info;
use structopt::StructOpt;

use simnet::{secs, DatagramConfig, NetConfig};
use treeagg::host::HostStack;
use treeagg::topology::{balanced_binary_tree, instantiate, TreeParams};

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "treeagg", about = "Tree AllReduce over in-network aggregation")]
struct Opt {
    /// Number of hosts, a power of two.
    #[structopt(short = "w", long = "num_hosts", default_value = "4")]
    num_hosts: usize,

    /// Records per host per AllReduce.
    #[structopt(short = "n", long = "total_packets", default_value = "2048")]
    total_packets: u32,

    /// Sliding window size.
    #[structopt(long = "window", default_value = "16")]
    window_size: u32,

    /// Slot-array size of every switch.
    #[structopt(long = "array_size", default_value = "2048")]
    array_size: u16,

    /// Initial value every host contributes per record.
    #[structopt(long = "fill", default_value = "1")]
    fill_value: i32,

    /// Per-link datagram loss rate.
    #[structopt(short = "l", long = "loss", default_value = "0.0")]
    loss: f64,

    /// RNG seed for loss and jitter.
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

    let params = TreeParams {
        num_hosts: opt.num_hosts,
        total_packets: opt.total_packets,
        window_size: opt.window_size,
        array_size: opt.array_size,
        fill_value: opt.fill_value,
        ..Default::default()
    };
    let layout = balanced_binary_tree(&params);
    info!(
        "tree built: {} hosts, {} switches",
        layout.hosts.len(),
        layout.switches.len()
    );

    let net = NetConfig {
        seed: opt.seed,
        datagram: DatagramConfig {
            loss_rate: opt.loss,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut tree = instantiate(&layout, net);
    tree.sim.run_until(secs(opt.time_limit));

    let completed = tree.completions.borrow().len();
    info!(
        "{}/{} hosts completed by t={:?}",
        completed,
        opt.num_hosts,
        simnet::ToStdDuration::to_dura(tree.sim.now())
    );
    if completed != opt.num_hosts {
        bail!("{} hosts never completed", opt.num_hosts - completed);
    }

    let expected = opt.fill_value * opt.num_hosts as i32;
    for ep in &tree.host_eps {
        let host = tree
            .sim
            .endpoint(*ep)
            .as_any()
            .downcast_ref::<HostStack>()
            .unwrap();
        if host.result_buffer().iter().any(|&v| v != expected) {
            bail!("{}: result buffer mismatch, expected {}", host.server_id(), expected);
        }
    }
    info!("every host holds {} in all {} slots", expected, opt.total_packets);
    Ok(())
}
