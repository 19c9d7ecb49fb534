//! tether-core: Transport layer for the tether relay.
//!
//! Provides the authenticated SSH session, the remote listener accept loop,
//! and the duplex relay that ties a tunneled stream to a local TCP service.

pub mod config;
pub mod error;
pub mod relay;
pub mod reverse;
pub mod session;

// Re-export commonly used items at crate root.
pub use config::{Config, HostKeyPolicy, HostPort};
pub use error::{TunnelError, TunnelResult};
pub use relay::relay;
pub use reverse::{IncomingConnection, RemoteListener};
pub use session::{Credentials, TunnelSession, TunnelStream};
