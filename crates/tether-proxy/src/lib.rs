//! tether-proxy: HTTP forward proxy over a pluggable dialer.
//!
//! The engine speaks plain HTTP/1.1 proxying and CONNECT tunneling on a
//! local port; every outbound connection goes through a [`Dialer`], so the
//! same server works over direct TCP or a tunneled transport.

pub mod dial;
pub mod error;
pub mod server;

// Re-export commonly used items at crate root.
pub use dial::{BoxedStream, DialStream, Dialer, TcpDialer};
pub use error::{ProxyError, ProxyResult};
pub use server::ProxyServer;
