//! Error types for tunnel establishment and session handling.

use thiserror::Error;

/// Boxed source error for transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the tunnel core.
///
/// The establishment path is strict: any of these aborts the attempt.
/// Per-stream I/O errors inside a running session are never represented
/// here; they are routine peer behavior and are swallowed at the pipe.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote URL could not be parsed or is not usable for a tunnel.
    #[error("invalid remote url {0:?}: {1}")]
    InvalidRemote(String, String),

    /// Neither an id token nor a service account was configured.
    #[error("unable to get token, missing id token or service account")]
    MissingCredential,

    /// Invalid configuration detected before any socket work.
    #[error("{0}")]
    Config(String),

    /// Identity token minting through the IAM credentials service failed.
    #[error("token exchange failed: {0}")]
    Token(String),

    /// TCP/TLS dial or HTTP round-trip failure.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// The server answered with something other than a `websocket` 101.
    #[error("server refused upgrade: {0}")]
    UpgradeRefused(String),

    /// The HTTP client never handed over the raw post-upgrade connection.
    #[error("transport did not yield a raw connection: {0}")]
    Unhijackable(#[source] hyper::Error),

    /// The mux session died while the tunnel was running.
    #[error("disconnected from server")]
    Disconnected,

    /// Multiplexer failure on the session connection.
    #[error("multiplexer error: {0}")]
    Mux(#[from] yamux::ConnectionError),
}

impl Error {
    /// Wrap any dial or round-trip failure as a transport error.
    pub fn transport<E: Into<BoxError>>(err: E) -> Self {
        Error::Transport(err.into())
    }
}

/// Result type used throughout the tunnel core.
pub type Result<T> = std::result::Result<T, Error>;
