use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use simnet::{micros, millis, Duration};

use crate::header::{DataType, ReduceOp};

/// Datagram service port every stack and engine listens on.
pub const SERVICE_PORT: u16 = 9;

/// Emitter sockets bind to `EMITTER_PORT_BASE + localQP` on the local
/// interface.
pub const EMITTER_PORT_BASE: u16 = 1024;

/// Startup-time configuration of one host protocol stack, injected once by
/// the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub server_id: String,
    pub group_id: u16,
    pub operation: ReduceOp,
    pub data_type: DataType,
    pub fill_value: i32,
    pub window_size: u32,
    /// Number of records per AllReduce; 0 means "derive from `data_size`".
    pub total_packets: u32,
    /// Total data size in bytes, split into 1024-byte records when
    /// `total_packets` is left at 0.
    pub data_size: u32,
    pub local_addr: Ipv4Addr,
    pub local_qp: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_qp: u16,
    pub retransmit_interval: Duration,
    pub processing_delay: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            server_id: String::new(),
            group_id: 1,
            operation: ReduceOp::Sum,
            data_type: DataType::Int32,
            fill_value: 1,
            window_size: 16,
            total_packets: 3,
            data_size: 1024,
            local_addr: Ipv4Addr::UNSPECIFIED,
            local_qp: 1,
            remote_addr: Ipv4Addr::UNSPECIFIED,
            remote_qp: 1,
            retransmit_interval: millis(20),
            processing_delay: micros(10),
        }
    }
}

/// One attached link of a switch engine, in the *outbound* direction: the
/// engine emits from `(local_addr, local_qp)` toward `(peer_addr, peer_qp)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkSpec {
    pub local_addr: Ipv4Addr,
    pub local_qp: u16,
    pub peer_addr: Ipv4Addr,
    pub peer_qp: u16,
    /// true for a link toward a child, false for the (single) parent link
    pub to_child: bool,
}

/// Startup-time configuration of one switch aggregation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub switch_id: String,
    pub group_id: u16,
    pub fan_in: u16,
    /// Slot-array size M; slots are reused cyclically by psn mod M.
    pub array_size: u16,
    pub links: Vec<LinkSpec>,
    pub retransmit_interval: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        SwitchConfig {
            switch_id: String::new(),
            group_id: 1,
            fan_in: 2,
            array_size: 2048,
            links: Vec::new(),
            retransmit_interval: millis(10),
        }
    }
}
