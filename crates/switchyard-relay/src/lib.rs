//! Signaling relay core: the wire codec, the per-connection state machine,
//! and the process-wide connection registry.
//!
//! The library knows nothing about HTTP routing or authentication; it is
//! handed an account id and an upgraded transport and relays opaque SDP/ICE
//! documents between attached peers.

pub mod conn;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use conn::RelayConn;
pub use registry::ConnectionRegistry;
