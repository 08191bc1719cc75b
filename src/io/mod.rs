// Socket-level transports.
// Numan Thabit 2025

pub mod udp;

pub use udp::{UdpError, UdpTransport};
