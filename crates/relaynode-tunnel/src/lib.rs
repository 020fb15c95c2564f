// relaynode-tunnel: Session registry and packet forwarder (the data plane)
// Owns every client channel handle and every upstream game-server socket.

pub mod channel;
pub mod counters;
pub mod error;
pub mod registry;
pub mod upstream;

pub use channel::{ClientChannel, Outbound};
pub use error::TunnelError;
pub use registry::{ConnectionSummary, SessionMetrics, SessionRegistry};
