//! Duplex relay between two established byte streams.
//!
//! Used for every connection accepted by the remote listener: one side is
//! the remote-origin stream carried over the transport session, the other a
//! freshly dialed local connection. The relay is content-agnostic and keeps
//! no state beyond the copy buffers.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Copies bytes in both directions until one direction reaches end-of-stream
/// or fails, then closes both ends.
///
/// The first direction to finish decides the relay's fate: the opposing copy
/// is cancelled and both write halves are shut down before this returns, so
/// neither peer is left with a half-open socket. A zero-byte connection
/// (immediate close) and a simultaneous close from both ends both complete
/// cleanly. Peer-reset style errors are reported as a normal close.
pub async fn relay<R, L>(remote: R, local: L) -> io::Result<()>
where
    R: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
    let (mut local_rd, mut local_wr) = tokio::io::split(local);

    let finished = {
        let inbound = tokio::io::copy(&mut remote_rd, &mut local_wr);
        let outbound = tokio::io::copy(&mut local_rd, &mut remote_wr);
        tokio::pin!(inbound, outbound);
        tokio::select! {
            res = &mut inbound => res.map(|bytes| ("inbound", bytes)),
            res = &mut outbound => res.map(|bytes| ("outbound", bytes)),
        }
    };

    // The losing copy was dropped with the select block, releasing its
    // borrow of the write halves. Close both so each peer observes EOF.
    let _ = local_wr.shutdown().await;
    let _ = remote_wr.shutdown().await;

    match finished {
        Ok((direction, bytes)) => {
            trace!(direction, bytes, "relay finished");
            Ok(())
        }
        Err(e) if is_disconnect(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Errors that mean a peer went away mid-copy, not that the relay failed.
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}
