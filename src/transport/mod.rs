pub mod memory;
pub mod traits;
pub mod udp;

pub use memory::{MemoryTransport, SentDatagram};
pub use traits::{Transport, TransportEvent};
pub use udp::UdpTransport;
