//! Reverse tunnel accept loop.
//!
//! The remote side holds the actual listening socket; connections it accepts
//! arrive here as streams over the transport session. Each one is paired
//! with a freshly dialed local connection and relayed until either side
//! closes. The loop itself never blocks on a relay.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{TunnelError, TunnelResult};
use crate::relay::relay;

/// One connection accepted by the remote listener.
#[derive(Debug)]
pub struct IncomingConnection<S> {
    /// The remote-origin stream.
    pub stream: S,
    /// Originator address as reported by the remote peer.
    pub peer_addr: String,
    /// Originator port as reported by the remote peer.
    pub peer_port: u32,
}

/// Handle to a listener bound on the remote side.
///
/// Owned by the accept loop once the session hands it out; it yields
/// remote-origin connections until the session backing it goes away.
#[derive(Debug)]
pub struct RemoteListener<S> {
    pub(crate) incoming: mpsc::UnboundedReceiver<IncomingConnection<S>>,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl<S> RemoteListener<S> {
    /// The address the remote side was asked to bind, with the port the
    /// server actually assigned.
    pub fn bound_addr(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    /// Waits for the next remote-origin connection. Returns `None` once the
    /// session backing this listener is gone.
    pub async fn accept(&mut self) -> Option<IncomingConnection<S>> {
        self.incoming.recv().await
    }
}

/// Accepts remote-origin connections forever, spawning one relay task per
/// connection toward `local_addr`.
///
/// Per-connection failures (local destination unreachable, copy errors) are
/// logged and absorbed; they never stop the loop or affect other relays.
/// Returns an error only when the listener itself dies, which callers treat
/// as fatal to the process.
pub async fn run<S>(mut listener: RemoteListener<S>, local_addr: String) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let Some(conn) = listener.accept().await else {
            return Err(TunnelError::ListenerClosed);
        };
        debug!(
            peer = %conn.peer_addr,
            peer_port = conn.peer_port,
            "accepted connection from remote listener"
        );
        let local_addr = local_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(conn.stream, &local_addr).await {
                warn!(addr = %local_addr, error = %e, "relay ended with error");
            }
        });
    }
}

/// Dials the local destination and relays until either side closes. A dial
/// failure drops the remote stream, closing the remote end of the pair.
async fn serve_connection<S>(remote: S, local_addr: &str) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = match TcpStream::connect(local_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                addr = %local_addr,
                error = %e,
                "cannot reach local destination, dropping remote connection"
            );
            return Ok(());
        }
    };
    relay(remote, local).await
}
