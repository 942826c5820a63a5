// Networking layer
// Frame codec, socket abstraction, the per-connection state machine, and
// the TCP accept loop.

pub mod framing;
pub mod listener;
pub mod peer;
pub mod socket;

pub use listener::TcpServer;
pub use peer::{ConnState, PeerConn};
pub use socket::{Socket, TokioSocket};
