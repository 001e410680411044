use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use simnet::{micros, millis, secs, Duration, Timestamp};

/// Startup-time configuration of one ring peer, injected by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    pub node_id: u32,
    pub num_nodes: u32,
    /// global array size; must divide evenly into num_nodes chunks
    pub total_packets: u32,
    /// fixed payload behind every 25-byte header on the stream
    pub packet_payload_size: usize,
    /// advisory receive/send buffer sizing for the stream transport
    pub rcwnd_size: u32,
    pub check_interval: Duration,
    pub retry_interval: Duration,
    /// delay after startup before connecting to the successor
    pub connection_start: Duration,
    /// absolute time at which data transfer begins
    pub transfer_start: Timestamp,
    /// pacing between consecutive record emissions
    pub packet_interval: Duration,
    pub listen_addr: Ipv4Addr,
    pub listen_port: u16,
    pub peer_addr: Ipv4Addr,
    pub peer_port: u16,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            node_id: 0,
            num_nodes: 0,
            total_packets: 0,
            packet_payload_size: 1024,
            rcwnd_size: 32 * 1024,
            check_interval: millis(10),
            retry_interval: millis(1),
            connection_start: 0,
            transfer_start: secs(5),
            packet_interval: micros(10),
            listen_addr: Ipv4Addr::UNSPECIFIED,
            listen_port: 0,
            peer_addr: Ipv4Addr::UNSPECIFIED,
            peer_port: 0,
        }
    }
}

/// The listening port every ring peer uses in driver-built rings.
pub const RING_PORT: u16 = 7000;

/// One config per node of an N-node ring on 10.0.1.0/24; node i listens at
/// 10.0.1.(i+1) and dials its successor (i+1) mod N.
pub fn ring_layout(
    num_nodes: u32,
    total_packets: u32,
    packet_payload_size: usize,
    transfer_start: Timestamp,
) -> Vec<RingConfig> {
    let addr = |i: u32| Ipv4Addr::new(10, 0, 1, (i + 1) as u8);
    (0..num_nodes)
        .map(|i| RingConfig {
            node_id: i,
            num_nodes,
            total_packets,
            packet_payload_size,
            transfer_start,
            listen_addr: addr(i),
            listen_port: RING_PORT,
            peer_addr: addr((i + 1) % num_nodes),
            peer_port: RING_PORT,
            ..Default::default()
        })
        .collect()
}
