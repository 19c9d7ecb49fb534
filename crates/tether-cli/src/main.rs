//! tether: HTTP forward proxy and reverse relay over a single SSH session.
//!
//! Connects to one SSH host, serves a local HTTP proxy whose outbound
//! connections are dialed from the remote side, and relays connections
//! accepted on a remote listener back to a local service.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tether_core::{
    reverse, Config, Credentials, HostKeyPolicy, HostPort, TunnelResult, TunnelSession,
};
use tether_proxy::{BoxedStream, Dialer, ProxyServer};
use tracing::{error, info};

/// tether: forward proxy and reverse relay over SSH
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Forward proxy and reverse relay over SSH")]
struct Cli {
    /// SSH username
    #[arg(short, long, default_value = "root")]
    user: String,

    /// SSH server hostname
    #[arg(short = 'H', long)]
    host: String,

    /// SSH server port
    #[arg(short, long, default_value_t = 22)]
    port: u16,

    /// Local listen address for the HTTP proxy
    #[arg(long, default_value = "127.0.0.1:8888")]
    proxy_addr: std::net::SocketAddr,

    /// Local service that reverse connections are relayed to
    #[arg(long, default_value = "127.0.0.1:18083")]
    local_addr: HostPort,

    /// Listen address requested on the remote side
    #[arg(long, default_value = "0.0.0.0:18083")]
    remote_addr: HostPort,

    /// SSH password
    #[arg(long = "pass", env = "TETHER_PASSWORD")]
    pass: Option<String>,

    /// SSH private key file; pass an empty string to disable key auth
    #[arg(short, long, default_value_os_t = default_key_path())]
    key: PathBuf,

    /// Pin the server to this SHA-256 host key fingerprint
    #[arg(long, conflicts_with = "known_hosts")]
    fingerprint: Option<String>,

    /// Verify the server against ~/.ssh/known_hosts
    #[arg(long)]
    known_hosts: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> TunnelResult<Config> {
        let host_key = if let Some(fingerprint) = self.fingerprint {
            HostKeyPolicy::Fingerprint(fingerprint)
        } else if self.known_hosts {
            HostKeyPolicy::KnownHosts
        } else {
            HostKeyPolicy::AcceptAll
        };
        let key_path = if self.key.as_os_str().is_empty() {
            None
        } else {
            Some(self.key)
        };
        let config = Config {
            username: self.user,
            host: self.host,
            port: self.port,
            proxy_addr: self.proxy_addr,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            password: self.pass,
            key_path,
            host_key,
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".ssh")
        .join("id_rsa")
}

/// Routes the proxy's outbound connections through the transport session.
struct SessionDialer {
    session: Arc<TunnelSession>,
}

#[async_trait]
impl Dialer for SessionDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = self
            .session
            .dial(host, port)
            .await
            .map_err(io::Error::other)?;
        Ok(Box::new(stream))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.verbose {
        "info,tether=debug,tether_core=debug,tether_proxy=debug"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match cli.into_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        "starting tether"
    );

    let credentials = match Credentials::load(config.password.clone(), config.key_path.as_deref())
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "cannot load credentials");
            std::process::exit(1);
        }
    };

    let mut session = match TunnelSession::establish(&config, credentials).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot establish transport session");
            std::process::exit(1);
        }
    };

    let listener = match session
        .listen_remote(&config.remote_addr.host, config.remote_addr.port)
        .await
    {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "cannot register remote listener");
            std::process::exit(1);
        }
    };

    let session = Arc::new(session);
    let mut reverse_loop = tokio::spawn(reverse::run(listener, config.local_addr.to_string()));
    let proxy = ProxyServer::new(SessionDialer {
        session: Arc::clone(&session),
    });

    // The reverse loop and the proxy both run for the process lifetime;
    // either one ending is fatal.
    tokio::select! {
        result = proxy.serve(config.proxy_addr) => {
            if let Err(e) = result {
                error!(error = %e, "proxy endpoint failed");
                std::process::exit(1);
            }
        }
        result = &mut reverse_loop => {
            match result {
                Ok(Err(e)) => error!(error = %e, "reverse listener loop failed"),
                Ok(Ok(())) => error!("reverse listener loop stopped"),
                Err(e) => error!(error = %e, "reverse listener task aborted"),
            }
            std::process::exit(1);
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    reverse_loop.abort();
    if let Err(e) = session.close().await {
        info!(error = %e, "disconnect was not clean");
    }
    info!("tether stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
