//! SSH transport session.
//!
//! A single authenticated connection carries every tunneled stream: the
//! proxy's outbound dials are multiplexed channels, and connections
//! accepted by the remote listener arrive as forwarded channels routed to
//! the [`RemoteListener`] intake.

use std::path::Path;
use std::sync::Arc;

use russh::client::{self, AuthResult};
use russh::keys::{self, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelStream, Disconnect};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, HostKeyPolicy};
use crate::error::{TunnelError, TunnelResult};
use crate::reverse::{IncomingConnection, RemoteListener};

/// A logical byte stream multiplexed over the session.
pub type TunnelStream = ChannelStream<client::Msg>;

/// Authentication material, loaded eagerly at startup so a broken key file
/// fails the process before any network I/O.
pub struct Credentials {
    password: Option<String>,
    key: Option<Arc<PrivateKey>>,
}

impl Credentials {
    /// Loads the configured methods. An empty password counts as absent;
    /// a configured key file that cannot be read or parsed is an error even
    /// when a password is present.
    pub fn load(password: Option<String>, key_path: Option<&Path>) -> TunnelResult<Self> {
        let password = password.filter(|p| !p.is_empty());
        let key = match key_path {
            Some(path) => {
                let key = keys::load_secret_key(path, None).map_err(|source| TunnelError::Key {
                    path: path.to_path_buf(),
                    source,
                })?;
                Some(Arc::new(key))
            }
            None => None,
        };
        if password.is_none() && key.is_none() {
            return Err(TunnelError::NoCredentials);
        }
        Ok(Self { password, key })
    }
}

/// Client-side connection handler: host key policy plus the intake for
/// connections accepted by the remote listener.
struct SessionHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    incoming: mpsc::UnboundedSender<IncomingConnection<TunnelStream>>,
}

impl client::Handler for SessionHandler {
    type Error = TunnelError;

    async fn check_server_key(&mut self, server_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::AcceptAll => Ok(true),
            HostKeyPolicy::Fingerprint(expected) => {
                let actual = server_key.fingerprint(HashAlg::Sha256).to_string();
                let matches = actual == *expected
                    || actual.strip_prefix("SHA256:") == Some(expected.as_str());
                if !matches {
                    warn!(
                        host = %self.host,
                        fingerprint = %actual,
                        "host key does not match the pinned fingerprint"
                    );
                }
                Ok(matches)
            }
            HostKeyPolicy::KnownHosts => {
                match keys::check_known_hosts(&self.host, self.port, server_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(host = %self.host, "host key not found in known_hosts");
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(host = %self.host, error = %e, "known_hosts verification failed");
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            bind = %connected_address,
            bind_port = connected_port,
            peer = %originator_address,
            peer_port = originator_port,
            "forwarded connection from remote listener"
        );
        let conn = IncomingConnection {
            stream: channel.into_stream(),
            peer_addr: originator_address.to_string(),
            peer_port: originator_port,
        };
        // A gone receiver means the accept loop stopped; dropping the
        // stream closes the forwarded channel.
        let _ = self.incoming.send(conn);
        Ok(())
    }
}

/// The single authenticated transport connection for the process lifetime.
///
/// `dial` may be shared freely across tasks; the remote listener can be
/// taken exactly once. There is no reconnect: when the session dies, every
/// derived stream dies with it.
pub struct TunnelSession {
    handle: client::Handle<SessionHandler>,
    incoming: Option<mpsc::UnboundedReceiver<IncomingConnection<TunnelStream>>>,
}

impl TunnelSession {
    /// Connects to `config.host:config.port` and authenticates, trying the
    /// password first and the key second. Fails without retry.
    pub async fn establish(config: &Config, credentials: Credentials) -> TunnelResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = SessionHandler {
            host: config.host.clone(),
            port: config.port,
            policy: config.host_key.clone(),
            incoming: tx,
        };

        let ssh_config = Arc::new(client::Config::default());
        let mut handle = client::connect(ssh_config, (config.host.as_str(), config.port), handler)
            .await
            .map_err(|source| TunnelError::Connect {
                addr: addr.clone(),
                source: Box::new(source),
            })?;

        let mut authenticated = false;
        if let Some(password) = &credentials.password {
            match handle
                .authenticate_password(&config.username, password)
                .await?
            {
                AuthResult::Success => authenticated = true,
                AuthResult::Failure { .. } => {
                    debug!(user = %config.username, "password authentication rejected");
                }
            }
        }
        if !authenticated {
            if let Some(key) = &credentials.key {
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                let key = PrivateKeyWithHashAlg::new(Arc::clone(key), hash);
                match handle.authenticate_publickey(&config.username, key).await? {
                    AuthResult::Success => authenticated = true,
                    AuthResult::Failure { .. } => {
                        debug!(user = %config.username, "key authentication rejected");
                    }
                }
            }
        }
        if !authenticated {
            return Err(TunnelError::AuthRejected {
                user: config.username.clone(),
            });
        }

        info!(addr = %addr, user = %config.username, "transport session established");
        Ok(Self {
            handle,
            incoming: Some(rx),
        })
    }

    /// Opens a new logical stream to `host:port` as seen from the remote
    /// side. Safe to call concurrently from any task; every call is an
    /// independent stream.
    pub async fn dial(&self, host: &str, port: u16) -> TunnelResult<TunnelStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "0.0.0.0", 0)
            .await?;
        Ok(channel.into_stream())
    }

    /// Asks the remote peer to bind `host:port` and returns the listener
    /// whose accepted connections arrive over this session. A session
    /// carries at most one remote listener; a second request is refused
    /// locally.
    pub async fn listen_remote(
        &mut self,
        host: &str,
        port: u16,
    ) -> TunnelResult<RemoteListener<TunnelStream>> {
        let incoming = self.incoming.take().ok_or(TunnelError::ListenerActive)?;
        let bound = match self.handle.tcpip_forward(host, u32::from(port)).await {
            Ok(bound) => bound,
            Err(source) => {
                self.incoming = Some(incoming);
                return Err(TunnelError::ListenRefused {
                    addr: host.to_string(),
                    port,
                    source,
                });
            }
        };
        let bound = u16::try_from(bound).unwrap_or(port);
        info!(addr = %host, port = bound, "remote listener registered");
        Ok(RemoteListener {
            incoming,
            host: host.to_string(),
            port: bound,
        })
    }

    /// Disconnects the session, invalidating every stream derived from it.
    pub async fn close(&self) -> TunnelResult<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "shutting down", "en")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostPort;
    use crate::reverse;
    use rand::rngs::OsRng;
    use russh::server::{self, Auth, Msg as ServerMsg, Server as _};
    use ssh_key::{Algorithm, LineEnding};
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(5);

    struct TestHandler {
        user: String,
        handles: mpsc::UnboundedSender<server::Handle>,
    }

    impl server::Handler for TestHandler {
        type Error = russh::Error;

        async fn auth_publickey(
            &mut self,
            user: &str,
            _key: &PublicKey,
        ) -> Result<Auth, Self::Error> {
            if user == self.user {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::UnsupportedMethod)
            }
        }

        async fn auth_succeeded(
            &mut self,
            session: &mut server::Session,
        ) -> Result<(), Self::Error> {
            let _ = self.handles.send(session.handle());
            Ok(())
        }

        async fn channel_open_direct_tcpip(
            &mut self,
            channel: Channel<ServerMsg>,
            _host_to_connect: &str,
            _port_to_connect: u32,
            _originator_address: &str,
            _originator_port: u32,
            _session: &mut server::Session,
        ) -> Result<bool, Self::Error> {
            tokio::spawn(echo_channel(channel));
            Ok(true)
        }

        async fn tcpip_forward(
            &mut self,
            _address: &str,
            port: &mut u32,
            _session: &mut server::Session,
        ) -> Result<bool, Self::Error> {
            if *port == 0 {
                *port = 2222;
            }
            Ok(true)
        }
    }

    async fn echo_channel(channel: Channel<ServerMsg>) {
        let mut stream = channel.into_stream();
        let mut buf = vec![0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    #[derive(Clone)]
    struct TestServer {
        user: String,
        handles: mpsc::UnboundedSender<server::Handle>,
    }

    impl server::Server for TestServer {
        type Handler = TestHandler;

        fn new_client(&mut self, _peer: Option<SocketAddr>) -> TestHandler {
            TestHandler {
                user: self.user.clone(),
                handles: self.handles.clone(),
            }
        }
    }

    struct Loopback {
        addr: SocketAddr,
        host_key: PrivateKey,
        handles: mpsc::UnboundedReceiver<server::Handle>,
    }

    /// Starts an SSH server on a loopback port that accepts any public key
    /// for `user`, echoes direct-tcpip channels, and grants forward
    /// requests.
    async fn spawn_server(user: &str) -> Loopback {
        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let config = Arc::new(server::Config {
            keys: vec![host_key.clone()],
            auth_rejection_time: Duration::from_millis(50),
            ..Default::default()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let mut srv = TestServer {
            user: user.to_string(),
            handles: tx,
        };
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = srv.run_on_socket(config, &socket).await;
        });
        Loopback {
            addr,
            host_key,
            handles: rx,
        }
    }

    fn client_config(addr: SocketAddr, password: Option<&str>, key_path: Option<&Path>) -> Config {
        Config {
            username: "tester".into(),
            host: addr.ip().to_string(),
            port: addr.port(),
            proxy_addr: "127.0.0.1:8888".parse().unwrap(),
            local_addr: "127.0.0.1:18083".parse::<HostPort>().unwrap(),
            remote_addr: "0.0.0.0:18083".parse::<HostPort>().unwrap(),
            password: password.map(str::to_string),
            key_path: key_path.map(Path::to_path_buf),
            host_key: HostKeyPolicy::AcceptAll,
        }
    }

    fn write_client_key(dir: &tempfile::TempDir) -> PathBuf {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        path
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut rd, mut wr) = sock.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    #[test]
    fn credentials_require_at_least_one_method() {
        assert!(matches!(
            Credentials::load(None, None),
            Err(TunnelError::NoCredentials)
        ));
        // An empty password does not count as a configured method.
        assert!(matches!(
            Credentials::load(Some(String::new()), None),
            Err(TunnelError::NoCredentials)
        ));
    }

    #[test]
    fn unusable_key_file_fails_eagerly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_key");
        std::fs::write(&path, "certainly not a private key").unwrap();
        // Fatal even though a password is also configured.
        let err = Credentials::load(Some("secret".into()), Some(&path)).unwrap_err();
        assert!(matches!(err, TunnelError::Key { .. }));

        let missing = dir.path().join("nonexistent");
        let err = Credentials::load(None, Some(&missing)).unwrap_err();
        assert!(matches!(err, TunnelError::Key { .. }));
    }

    #[tokio::test]
    async fn establishes_with_key_credentials() {
        let server = spawn_server("tester").await;
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_client_key(&dir);
        let config = client_config(server.addr, None, Some(&key_path));
        let credentials = Credentials::load(None, Some(&key_path)).unwrap();

        let session = timeout(TICK, TunnelSession::establish(&config, credentials))
            .await
            .unwrap()
            .unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn password_rejection_falls_back_to_key() {
        let server = spawn_server("tester").await;
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_client_key(&dir);
        let config = client_config(server.addr, Some("not the password"), Some(&key_path));
        let credentials =
            Credentials::load(Some("not the password".into()), Some(&key_path)).unwrap();

        // The server refuses all passwords but accepts the key, so the
        // ordered fallback must succeed.
        let session = timeout(TICK, TunnelSession::establish(&config, credentials))
            .await
            .unwrap()
            .unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_credentials_fail_establishment() {
        let server = spawn_server("tester").await;
        let config = client_config(server.addr, Some("wrong"), None);
        let credentials = Credentials::load(Some("wrong".into()), None).unwrap();

        let err = timeout(TICK, TunnelSession::establish(&config, credentials))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TunnelError::AuthRejected { .. }));
    }

    #[tokio::test]
    async fn pinned_fingerprint_gates_the_handshake() {
        let server = spawn_server("tester").await;
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_client_key(&dir);
        let expected = server
            .host_key
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string();

        let mut config = client_config(server.addr, None, Some(&key_path));
        config.host_key = HostKeyPolicy::Fingerprint(expected);
        let credentials = Credentials::load(None, Some(&key_path)).unwrap();
        let session = timeout(TICK, TunnelSession::establish(&config, credentials))
            .await
            .unwrap()
            .unwrap();
        session.close().await.unwrap();

        config.host_key =
            HostKeyPolicy::Fingerprint("SHA256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into());
        let credentials = Credentials::load(None, Some(&key_path)).unwrap();
        let err = timeout(TICK, TunnelSession::establish(&config, credentials))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TunnelError::Connect { .. }));
    }

    #[tokio::test]
    async fn concurrent_dials_are_independent_streams() {
        let server = spawn_server("tester").await;
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_client_key(&dir);
        let config = client_config(server.addr, None, Some(&key_path));
        let credentials = Credentials::load(None, Some(&key_path)).unwrap();
        let session = Arc::new(
            timeout(TICK, TunnelSession::establish(&config, credentials))
                .await
                .unwrap()
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for payload in [&b"alpha"[..], &b"bravo"[..], &b"charlie"[..]] {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                let mut stream = session.dial("192.0.2.10", 80).await.unwrap();
                stream.write_all(payload).await.unwrap();
                let mut buf = vec![0u8; payload.len()];
                stream.read_exact(&mut buf).await.unwrap();
                buf
            }));
        }
        let mut results = Vec::new();
        for task in tasks {
            results.push(timeout(TICK, task).await.unwrap().unwrap());
        }
        assert_eq!(
            results,
            vec![b"alpha".to_vec(), b"bravo".to_vec(), b"charlie".to_vec()]
        );
    }

    #[tokio::test]
    async fn reverse_connections_reach_the_local_destination() {
        let mut server = spawn_server("tester").await;
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_client_key(&dir);
        let config = client_config(server.addr, None, Some(&key_path));
        let credentials = Credentials::load(None, Some(&key_path)).unwrap();
        let mut session = timeout(TICK, TunnelSession::establish(&config, credentials))
            .await
            .unwrap()
            .unwrap();

        let listener = session.listen_remote("0.0.0.0", 9000).await.unwrap();
        assert_eq!(listener.bound_addr(), ("0.0.0.0", 9000));
        assert!(matches!(
            session.listen_remote("0.0.0.0", 9001).await,
            Err(TunnelError::ListenerActive)
        ));

        let echo = spawn_echo().await;
        tokio::spawn(reverse::run(listener, echo.to_string()));

        // The server side opens a forwarded channel, as if a client had
        // connected to the bound port, and must get its bytes echoed back
        // through the local destination.
        let handle = timeout(TICK, server.handles.recv()).await.unwrap().unwrap();
        let channel = handle
            .channel_open_forwarded_tcpip("0.0.0.0", 9000, "203.0.113.7", 40404)
            .await
            .unwrap();
        let mut stream = channel.into_stream();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(TICK, stream.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn zero_port_listen_reports_the_assigned_port() {
        let server = spawn_server("tester").await;
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_client_key(&dir);
        let config = client_config(server.addr, None, Some(&key_path));
        let credentials = Credentials::load(None, Some(&key_path)).unwrap();
        let mut session = timeout(TICK, TunnelSession::establish(&config, credentials))
            .await
            .unwrap()
            .unwrap();

        let listener = session.listen_remote("127.0.0.1", 0).await.unwrap();
        assert_eq!(listener.bound_addr(), ("127.0.0.1", 2222));
    }
}
