//! Driver-side wiring: builds the mirrored link descriptors of a balanced
//! binary aggregation tree and instantiates it on a simulated network.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use simnet::{millis, secs, EndpointId, NetConfig, Simulator};

use crate::config::{HostConfig, LinkSpec, SwitchConfig};
use crate::header::ReduceOp;
use crate::host::HostStack;
use crate::switch::SwitchEngine;

#[derive(Debug, Clone)]
pub struct TreeParams {
    /// number of hosts; must be a power of two
    pub num_hosts: usize,
    pub group_id: u16,
    pub array_size: u16,
    pub total_packets: u32,
    pub window_size: u32,
    pub fill_value: i32,
    pub operation: ReduceOp,
}

impl Default for TreeParams {
    fn default() -> Self {
        TreeParams {
            num_hosts: 2,
            group_id: 100,
            array_size: 2048,
            total_packets: 3,
            window_size: 16,
            fill_value: 1,
            operation: ReduceOp::Sum,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreeLayout {
    pub hosts: Vec<HostConfig>,
    pub switches: Vec<SwitchConfig>,
}

enum Slot {
    Host(usize),
    Switch(usize),
}

/// Each physical link gets its own /24; the child side takes .1 and the
/// parent side .2, the way the original point-to-point segments assign
/// addresses.
fn link_subnet(counter: &mut u32) -> (Ipv4Addr, Ipv4Addr) {
    let n = *counter;
    *counter += 1;
    let child = Ipv4Addr::new(10, (n >> 8) as u8, (n & 0xff) as u8, 1);
    let parent = Ipv4Addr::new(10, (n >> 8) as u8, (n & 0xff) as u8, 2);
    (child, parent)
}

/// Build a balanced binary tree: hosts at the leaves, one switch above each
/// pair, fan-in 2 at every interior node, the top switch as root.
pub fn balanced_binary_tree(params: &TreeParams) -> TreeLayout {
    assert!(
        params.num_hosts >= 2 && params.num_hosts.is_power_of_two(),
        "balanced tree needs a power-of-two host count"
    );

    let mut hosts: Vec<HostConfig> = (0..params.num_hosts)
        .map(|i| HostConfig {
            server_id: format!("host_{}", i),
            group_id: params.group_id,
            operation: params.operation,
            fill_value: params.fill_value,
            window_size: params.window_size,
            total_packets: params.total_packets,
            ..Default::default()
        })
        .collect();
    let mut switches: Vec<SwitchConfig> = Vec::new();

    let mut subnet = 1u32;
    let mut switch_qp: Vec<u16> = Vec::new();
    let mut host_qp_next: u16 = 1;

    let mut layer: Vec<Slot> = (0..params.num_hosts).map(Slot::Host).collect();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks(2) {
            let sw = switches.len();
            switches.push(SwitchConfig {
                switch_id: format!("switch_{}", sw),
                group_id: params.group_id,
                fan_in: 2,
                array_size: params.array_size,
                ..Default::default()
            });
            switch_qp.push(1);

            for child in pair {
                let (child_addr, parent_addr) = link_subnet(&mut subnet);
                let parent_qp = switch_qp[sw];
                switch_qp[sw] += 1;

                let child_side_qp = match child {
                    Slot::Host(h) => {
                        let qp = host_qp_next;
                        host_qp_next += 1;
                        let host = &mut hosts[*h];
                        host.local_addr = child_addr;
                        host.local_qp = qp;
                        host.remote_addr = parent_addr;
                        host.remote_qp = parent_qp;
                        qp
                    }
                    Slot::Switch(c) => {
                        let qp = switch_qp[*c];
                        switch_qp[*c] += 1;
                        switches[*c].links.push(LinkSpec {
                            local_addr: child_addr,
                            local_qp: qp,
                            peer_addr: parent_addr,
                            peer_qp: parent_qp,
                            to_child: false,
                        });
                        qp
                    }
                };
                switches[sw].links.push(LinkSpec {
                    local_addr: parent_addr,
                    local_qp: parent_qp,
                    peer_addr: child_addr,
                    peer_qp: child_side_qp,
                    to_child: true,
                });
            }
            next.push(Slot::Switch(sw));
        }
        layer = next;
    }

    TreeLayout { hosts, switches }
}

pub struct TreeSim {
    pub sim: Simulator,
    pub host_eps: Vec<EndpointId>,
    pub switch_eps: Vec<EndpointId>,
    /// server ids in completion order, appended by each host's hook
    pub completions: Rc<RefCell<Vec<String>>>,
}

/// Put the layout on a simulated network. Switches come up first; every
/// host starts its AllReduce at the one-second mark.
pub fn instantiate(layout: &TreeLayout, net: NetConfig) -> TreeSim {
    let mut sim = Simulator::new(net);
    let completions: Rc<RefCell<Vec<String>>> = Default::default();

    let switch_eps: Vec<EndpointId> = layout
        .switches
        .iter()
        .map(|cfg| {
            let engine = SwitchEngine::new(cfg.clone());
            let addrs = engine.local_addrs().to_vec();
            sim.add_endpoint(Box::new(engine), addrs, millis(500))
        })
        .collect();

    let host_eps: Vec<EndpointId> = layout
        .hosts
        .iter()
        .map(|cfg| {
            let mut stack = HostStack::new(cfg.clone());
            let log = Rc::clone(&completions);
            stack.set_complete_callback(Box::new(move |id| {
                log.borrow_mut().push(id.to_owned());
            }));
            let addr = cfg.local_addr;
            sim.add_endpoint(Box::new(stack), vec![addr], secs(1))
        })
        .collect();

    TreeSim {
        sim,
        host_eps,
        switch_eps,
        completions,
    }
}
