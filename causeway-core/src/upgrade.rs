//! Client side of the HTTP/1.1 tunnel upgrade.
//!
//! Dials the remote, issues an authenticated upgrade request, and hands
//! back the raw post-upgrade byte stream. The handshake runs over a bare
//! HTTP/1.1 connection on purpose: the hijack-style upgrade this tunnel
//! relies on does not exist on HTTP/2, so none is ever negotiated.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONNECTION, HOST, UPGRADE};
use http::{Request, StatusCode, Uri};
use http_body_util::Empty;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// The upgrade protocol token offered to the server.
///
/// `websocket` keeps upgrade-whitelisting load balancers in front of the
/// server happy; no WebSocket framing ever crosses the wire.
pub const UPGRADE_PROTOCOL: &str = "websocket";

/// The raw byte stream carrying a tunnel session after a successful upgrade.
///
/// Reads and writes go to the post-upgrade body while shutdown reaches the
/// socket itself; hyper's `Upgraded` bundles both halves.
pub type TunnelStream = TokioIo<Upgraded>;

/// Establish the tunnel transport against `remote`.
///
/// Performs the TCP (and, for `https` remotes, TLS) dial, the upgrade
/// request carrying `bearer`, and the strict 101 validation. Any response
/// other than `101` with `Upgrade: websocket` refuses the tunnel and the
/// response body is released.
pub async fn connect(remote: &str, bearer: &str) -> Result<TunnelStream> {
    let uri: Uri = remote
        .parse()
        .map_err(|e: http::uri::InvalidUri| Error::InvalidRemote(remote.into(), e.to_string()))?;

    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidRemote(remote.into(), "missing host".into()))?
        .to_string();
    let tls = match uri.scheme_str() {
        Some("https") => true,
        Some("http") | None => false,
        Some(other) => {
            return Err(Error::InvalidRemote(
                remote.into(),
                format!("unsupported scheme {other:?}"),
            ))
        }
    };
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let host_header = match uri.authority() {
        Some(authority) => authority.to_string(),
        None => host.clone(),
    };

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(Error::transport)?;
    debug!(%host, port, tls, "connected to remote");

    if tls {
        let stream = tls_connect(stream, &host).await?;
        handshake(stream, &uri, &host_header, bearer).await
    } else {
        handshake(stream, &uri, &host_header, bearer).await
    }
}

/// Wrap the dialed socket in TLS without offering ALPN, so the peer cannot
/// select HTTP/2 underneath the upgrade.
async fn tls_connect(
    stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    // rustls needs an explicit provider once more than one crypto backend
    // is linked into the build.
    let config = ClientConfig::builder_with_provider(ring::default_provider().into())
        .with_safe_default_protocol_versions()
        .map_err(Error::transport)?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::InvalidRemote(host.into(), "not a valid TLS server name".into()))?;
    TlsConnector::from(Arc::new(config))
        .connect(name, stream)
        .await
        .map_err(Error::transport)
}

async fn handshake<T>(stream: T, uri: &Uri, host: &str, bearer: &str) -> Result<TunnelStream>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(io)
        .await
        .map_err(Error::transport)?;

    // The connection task keeps driving I/O after the 101 so the upgraded
    // stream can be claimed below.
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("tunnel connection ended: {}", e);
        }
    });

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let request = Request::get(path)
        .header(HOST, host)
        .header(UPGRADE, UPGRADE_PROTOCOL)
        .header(CONNECTION, "upgrade")
        .header(AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Empty::new())
        .map_err(|e| Error::Config(format!("invalid upgrade request: {e}")))?;

    let response = sender.send_request(request).await.map_err(Error::transport)?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::UpgradeRefused(format!(
            "unexpected HTTP status {}",
            response.status()
        )));
    }
    match response.headers().get(UPGRADE) {
        Some(proto) if proto.as_bytes().eq_ignore_ascii_case(UPGRADE_PROTOCOL.as_bytes()) => {}
        proto => {
            return Err(Error::UpgradeRefused(format!(
                "server switched to unexpected protocol {proto:?}"
            )))
        }
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(Error::Unhijackable)?;
    Ok(TokioIo::new(upgraded))
}
