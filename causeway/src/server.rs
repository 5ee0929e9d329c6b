//! Tunnel server: upgrade acceptor and per-session stream dispatch.
//!
//! Each physical client performs one HTTP upgrade; the upgraded socket
//! carries a mux session whose streams are terminated according to the
//! configured mode.

use crate::connect::{self, empty, text_response, Body, DIAL_TIMEOUT};
use causeway_core::{pipe, Error, MuxSession};
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the server does with tunnelled streams.
#[derive(Debug, Clone)]
pub enum ServerMode {
    /// Terminate each stream as an HTTP CONNECT proxy.
    Proxy,
    /// Relay each stream byte-for-byte to a fixed upstream.
    Forward {
        /// `host:port` every stream is dialed to.
        upstream: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the upgrade listener binds to.
    pub addr: String,
    /// Stream termination mode.
    pub mode: ServerMode,
}

/// A bound tunnel server.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    mode: ServerMode,
}

impl Server {
    /// Validate the configuration and bind the upgrade listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, Error> {
        if let ServerMode::Forward { upstream } = &config.mode {
            // The CLI lets an empty upstream through; it stops here.
            if upstream.is_empty() {
                return Err(Error::Config(
                    "forward mode requires a non-empty upstream".into(),
                ));
            }
        }
        let listener = TcpListener::bind(&config.addr)
            .await
            .map_err(Error::transport)?;
        Ok(Self {
            listener,
            mode: config.mode,
        })
    }

    /// The address the upgrade listener actually bound.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept upgrade connections until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), Error> {
        info!(
            "listening on {}",
            self.listener.local_addr().map_err(Error::transport)?
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };
            // Transient accept failures (ECONNABORTED, EMFILE, ...) must not
            // take down the sessions already running.
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("accept failed: {}", e);
                    continue;
                }
            };
            debug!(%peer, "client connected");

            let mode = self.mode.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| tunnel(req, mode.clone()));
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!(%peer, "connection ended: {}", e);
                }
            });
        }
    }
}

/// Run a tunnel server to completion.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<(), Error> {
    Server::bind(config).await?.serve(shutdown).await
}

/// The upgrade endpoint every tunnel client hits exactly once.
///
/// Anything that is not a `websocket` upgrade is turned away with a `400`;
/// a valid request gets its `101` and the raw socket moves to
/// [`serve_session`] in a background task.
async fn tunnel<B>(mut req: Request<B>, mode: ServerMode) -> Result<Response<Body>, hyper::Error>
where
    B: Send + 'static,
{
    match req.headers().get(UPGRADE) {
        Some(proto) if proto.as_bytes().eq_ignore_ascii_case(b"websocket") => {}
        Some(_) => return Ok(text_response(StatusCode::BAD_REQUEST, "unknown next protocol")),
        None => return Ok(text_response(StatusCode::BAD_REQUEST, "missing next protocol")),
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => serve_session(upgraded, mode).await,
            Err(e) => debug!("tunnel upgrade failed: {}", e),
        }
    });

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("websocket"));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    Ok(response)
}

/// Dispatch streams for one upgraded session until it dies.
async fn serve_session(upgraded: Upgraded, mode: ServerMode) {
    let session = MuxSession::server(TokioIo::new(upgraded).compat());
    info!("tunnel session established");

    match mode {
        ServerMode::Proxy => {
            // Every accepted stream is one connection to the embedded
            // CONNECT server.
            while let Some(stream) = session.accept().await {
                tokio::spawn(async move {
                    let io = TokioIo::new(stream.compat());
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service_fn(|req| connect::proxy(req)))
                        .with_upgrades()
                        .await
                    {
                        debug!("proxied stream ended: {}", e);
                    }
                });
            }
        }
        ServerMode::Forward { upstream } => {
            while let Some(stream) = session.accept().await {
                let upstream = upstream.clone();
                tokio::spawn(async move {
                    let mut stream = stream.compat();
                    let mut target =
                        match timeout(DIAL_TIMEOUT, TcpStream::connect(upstream.as_str())).await {
                            Ok(Ok(target)) => target,
                            Ok(Err(e)) => {
                                debug!(%upstream, "upstream dial failed: {}", e);
                                return;
                            }
                            Err(_) => {
                                debug!(%upstream, "upstream dial timed out");
                                return;
                            }
                        };
                    pipe(&mut stream, &mut target).await;
                });
            }
        }
    }

    info!("tunnel session closed");
}
