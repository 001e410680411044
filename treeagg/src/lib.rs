pub mod config;
pub mod header;
pub mod host;
pub mod switch;
pub mod topology;

pub use config::{HostConfig, LinkSpec, SwitchConfig, EMITTER_PORT_BASE, SERVICE_PORT};
pub use header::{AggHeader, CodecError, DataType, ReduceOp, HEADER_LEN};
pub use host::HostStack;
pub use switch::SwitchEngine;
