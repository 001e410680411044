pub mod config;
pub mod framing;
pub mod header;
pub mod peer;

pub use config::{ring_layout, RingConfig};
pub use framing::FrameReader;
pub use header::{CodecError, RingHeader, RingMessage, HEADER_LEN};
pub use peer::{RingPeer, RingPhase};
