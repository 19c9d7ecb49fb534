use std::net::SocketAddr;

use thiserror::Error;

/// Errors that bring the proxy endpoint down.
///
/// Failures scoped to one proxied request (an unreachable target, a broken
/// client) are answered with an HTTP error or logged, never surfaced here.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("cannot bind proxy listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy listener died: {0}")]
    Accept(#[source] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
