//! taut -- reliable, connection-oriented, ordered byte-stream transport
//! layered directly on UDP.
//!
//! A simplified-TCP engine: three-way handshake, sliding-window delivery
//! with cumulative acknowledgements and bounded retransmission, graceful
//! teardown, and a fault-injecting channel shim for exercising loss,
//! duplication, corruption and reordering under a seeded RNG.

pub mod channel;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod receiver;
pub mod sender;
mod seq;

// Re-export key public types at crate root.
pub use channel::{ChannelStats, FaultyChannel};
pub use config::Config;
pub use connection::{Connection, Role, State};
pub use endpoint::Endpoint;
pub use error::{Result, TautError};
pub use frame::{Frame, FrameFlags, HEADER_LEN, MTU, PAYLOAD_MAX};
pub use receiver::RecvWindow;
pub use sender::SendWindow;
