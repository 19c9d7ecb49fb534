//! HTTP/1.1 forward proxy engine.
//!
//! Plain requests arrive in absolute-form and are replayed origin-form
//! against a connection obtained from the [`Dialer`]; CONNECT requests are
//! answered with `200` and spliced onto the dialed stream after the
//! protocol upgrade.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::dial::Dialer;
use crate::error::{ProxyError, ProxyResult};

/// Forward proxy endpoint. One listener, one task per client connection.
pub struct ProxyServer<D> {
    dialer: Arc<D>,
}

impl<D: Dialer> ProxyServer<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer: Arc::new(dialer),
        }
    }

    /// Binds `addr` and serves proxy clients until the listener dies.
    pub async fn serve(&self, addr: SocketAddr) -> ProxyResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        info!(addr = %addr, "http proxy listening");
        self.serve_listener(listener).await
    }

    /// Serves an already bound listener. A failed accept takes the whole
    /// endpoint down; per-request failures are answered over HTTP.
    pub async fn serve_listener(&self, listener: TcpListener) -> ProxyResult<()> {
        loop {
            let (stream, peer) = listener.accept().await.map_err(ProxyError::Accept)?;
            debug!(peer = %peer, "proxy client connected");
            let dialer = Arc::clone(&self.dialer);
            tokio::spawn(async move {
                let service = service_fn(move |req| handle_request(Arc::clone(&dialer), req));
                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!(peer = %peer, error = %e, "proxy connection ended");
                }
            });
        }
    }
}

async fn handle_request<D: Dialer>(
    dialer: Arc<D>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.method() == Method::CONNECT {
        connect_tunnel(dialer, req).await
    } else {
        forward_request(dialer, req).await
    }
}

/// CONNECT: dial the target first so a refused connection still gets an
/// HTTP answer, then hand the upgraded client socket to the tunnel.
async fn connect_tunnel<D: Dialer>(
    dialer: Arc<D>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some((host, port)) = authority_of(req.uri()) else {
        warn!(uri = %req.uri(), "CONNECT without a usable authority");
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "CONNECT target must be host:port",
        ));
    };

    let target = match dialer.dial(&host, port).await {
        Ok(target) => target,
        Err(e) => {
            warn!(host = %host, port, error = %e, "dial failed for CONNECT");
            return Ok(status_response(StatusCode::BAD_GATEWAY, "dial failed"));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = tunnel(upgraded, target).await {
                    debug!(host = %host, port, error = %e, "tunnel ended with error");
                }
            }
            Err(e) => warn!(host = %host, port, error = %e, "CONNECT upgrade failed"),
        }
    });

    Ok(Response::new(empty()))
}

/// Plain request: replay it origin-form over a dialed connection and stream
/// the origin's response back.
async fn forward_request<D: Dialer>(
    dialer: Arc<D>,
    mut req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some((host, port)) = target_of(&req) else {
        warn!(uri = %req.uri(), "request without a resolvable target");
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "proxy requests need an absolute URI or a Host header",
        ));
    };
    debug!(method = %req.method(), host = %host, port, "forwarding request");

    let stream = match dialer.dial(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host = %host, port, error = %e, "dial failed");
            return Ok(status_response(StatusCode::BAD_GATEWAY, "dial failed"));
        }
    };

    rewrite_to_origin_form(&mut req);

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection ended");
        }
    });

    let resp = sender.send_request(req).await?;
    Ok(resp.map(|b| b.boxed()))
}

/// Splices the upgraded client socket and the dialed target together,
/// closing both ends as soon as either direction finishes.
async fn tunnel<T>(upgraded: Upgraded, target: T) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(TokioIo::new(upgraded));
    let (mut target_rd, mut target_wr) = tokio::io::split(target);
    let finished = {
        let upstream = tokio::io::copy(&mut client_rd, &mut target_wr);
        let downstream = tokio::io::copy(&mut target_rd, &mut client_wr);
        tokio::pin!(upstream, downstream);
        tokio::select! {
            res = &mut upstream => res,
            res = &mut downstream => res,
        }
    };
    let _ = target_wr.shutdown().await;
    let _ = client_wr.shutdown().await;
    finished.map(|_| ())
}

fn authority_of(uri: &Uri) -> Option<(String, u16)> {
    let authority = uri.authority()?;
    Some((
        strip_brackets(authority.host()),
        authority.port_u16().unwrap_or(443),
    ))
}

/// Target host and port of a plain proxy request: the absolute URI when the
/// client sent one, the Host header otherwise.
fn target_of<B>(req: &Request<B>) -> Option<(String, u16)> {
    let uri = if req.uri().host().is_some() {
        req.uri().clone()
    } else {
        let host = req.headers().get(hyper::header::HOST)?.to_str().ok()?;
        format!("http://{host}").parse::<Uri>().ok()?
    };
    Some((strip_brackets(uri.host()?), uri.port_u16().unwrap_or(80)))
}

/// IPv6 literals appear bracketed in URIs but resolvers want them bare.
fn strip_brackets(host: &str) -> String {
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

fn rewrite_to_origin_form<B>(req: &mut Request<B>) {
    let origin_form = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"));
    *req.uri_mut() = origin_form;
    // Hop-by-hop headers stop at the proxy.
    for name in ["proxy-connection", "proxy-authenticate", "proxy-authorization"] {
        req.headers_mut().remove(name);
    }
}

fn status_response(
    status: StatusCode,
    message: &'static str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(message));
    *resp.status_mut() = status;
    resp
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
