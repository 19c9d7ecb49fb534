use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the tunnel core.
///
/// Everything up to and including the remote listen request is fatal to the
/// process; failures scoped to a single relayed connection never surface
/// here and are logged where they happen.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no authentication method configured: set a password or a key file")]
    NoCredentials,

    #[error("cannot load key file {path}: {source}")]
    Key {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: Box<TunnelError>,
    },

    #[error("authentication rejected for user {user}")]
    AuthRejected { user: String },

    #[error("remote refused to listen on {addr}:{port}: {source}")]
    ListenRefused {
        addr: String,
        port: u16,
        #[source]
        source: russh::Error,
    },

    #[error("remote listener already taken for this session")]
    ListenerActive,

    #[error("remote listener closed: transport session is gone")]
    ListenerClosed,

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
