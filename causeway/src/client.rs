//! Tunnel client: one session to the remote, local connections fanned out
//! over it as mux streams.

use causeway_core::{pipe, upgrade, Error, MuxSession, TokenSource};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Address the local listener binds to.
    pub addr: String,
    /// Remote tunnel server URL.
    pub remote: String,
    /// Credential source for the upgrade request.
    pub tokens: TokenSource,
}

/// A tunnel client with an established session and a bound local listener.
#[derive(Debug)]
pub struct TunnelClient {
    listener: TcpListener,
    session: MuxSession,
}

impl TunnelClient {
    /// Acquire a token, upgrade the connection to the remote, and bind the
    /// local listener.
    ///
    /// Credential and remote-URL problems surface before any socket work,
    /// and the listener only comes up once the session is established: a
    /// refused upgrade never leaves a local port bound.
    pub async fn connect(config: ClientConfig) -> Result<Self, Error> {
        let bearer = config.tokens.bearer(&config.remote).await?;
        let transport = upgrade::connect(&config.remote, &bearer).await?;
        let session = MuxSession::client(transport.compat());

        let listener = TcpListener::bind(&config.addr)
            .await
            .map_err(Error::transport)?;
        info!("tunnel to {} established", config.remote);
        Ok(Self { listener, session })
    }

    /// The address the local listener actually bound.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Fan local connections out over the session until `shutdown` fires
    /// (clean exit) or the session dies ([`Error::Disconnected`]).
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let Self { listener, session } = self;
        info!(
            "listening on {}",
            listener.local_addr().map_err(Error::transport)?
        );

        let acceptor = tokio::spawn(fanout(listener, session.clone()));

        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            _ = session.closed() => Err(Error::Disconnected),
        };

        // Scoped teardown: the acceptor owns the listener, so stopping it
        // unbinds the local port; the session and its socket go last.
        acceptor.abort();
        session.close();
        result
    }
}

/// Run a tunnel client to completion.
pub async fn run(config: ClientConfig, shutdown: CancellationToken) -> Result<(), Error> {
    TunnelClient::connect(config).await?.run(shutdown).await
}

async fn fanout(listener: TcpListener, session: MuxSession) {
    loop {
        let (mut local, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("local accept failed: {}", e);
                return;
            }
        };
        let session = session.clone();
        tokio::spawn(async move {
            // A dead session fails the open; the local connection just
            // closes and the terminal select reports the disconnect.
            let stream = match session.open().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer, "cannot open stream: {}", e);
                    return;
                }
            };
            let mut stream = stream.compat();
            pipe(&mut local, &mut stream).await;
        });
    }
}
