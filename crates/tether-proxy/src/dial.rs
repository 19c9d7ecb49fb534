use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A byte stream the proxy can carry traffic over.
pub trait DialStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DialStream for T {}

pub type BoxedStream = Box<dyn DialStream>;

/// Opens outbound connections on behalf of the proxy.
///
/// This is the only seam between the HTTP engine and the transport: every
/// proxied request, CONNECT or plain, turns into exactly one `dial`. A
/// failed dial is scoped to that request.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Plain TCP dialer, useful when the proxy runs without a tunnel behind it.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}
