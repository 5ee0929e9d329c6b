//! End-to-end tunnel scenarios over real TCP on loopback.

use causeway::client::{ClientConfig, TunnelClient};
use causeway::server::{Server, ServerConfig, ServerMode};
use causeway_core::{Error, MuxSession, TokenSource};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;

/// TCP echo service on an ephemeral port.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn id_token_config(remote: String) -> ClientConfig {
    ClientConfig {
        addr: "127.0.0.1:0".into(),
        remote,
        tokens: TokenSource {
            id_token: Some("test-token".into()),
            ..Default::default()
        },
    }
}

async fn start_server(mode: ServerMode) -> (SocketAddr, CancellationToken) {
    let server = Server::bind(ServerConfig {
        addr: "127.0.0.1:0".into(),
        mode,
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { server.serve(signal).await });
    (addr, shutdown)
}

async fn start_client(
    remote: SocketAddr,
) -> (SocketAddr, CancellationToken, JoinHandle<Result<(), Error>>) {
    let client = TunnelClient::connect(id_token_config(format!("http://{remote}")))
        .await
        .unwrap();
    let addr = client.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(client.run(shutdown.clone()));
    (addr, shutdown, handle)
}

async fn read_head(conn: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        conn.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn forward_round_trip() {
    let echo = spawn_echo().await;
    let (server_addr, _server_stop) = start_server(ServerMode::Forward {
        upstream: echo.to_string(),
    })
    .await;
    let (local, stop, handle) = start_client(server_addr).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"hello\n").await.unwrap();
    let mut buf = [0u8; 6];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello\n");

    // A second connection rides its own stream, and closing the first one
    // must not disturb it.
    let mut other = TcpStream::connect(local).await.unwrap();
    other.write_all(b"second").await.unwrap();
    drop(conn);
    let mut buf = [0u8; 6];
    other.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"second");

    // Cancellation is the clean exit.
    stop.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn proxy_connect_round_trip() {
    let echo = spawn_echo().await;
    let (server_addr, _server_stop) = start_server(ServerMode::Proxy).await;
    let (local, _client_stop, _handle) = start_client(server_addr).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut conn).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    conn.write_all(b"through the tunnel").await.unwrap();
    let mut buf = [0u8; 18];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the tunnel");
}

#[tokio::test]
async fn proxy_rejects_non_connect_and_survives() {
    let echo = spawn_echo().await;
    let (server_addr, _server_stop) = start_server(ServerMode::Proxy).await;
    let (local, _client_stop, _handle) = start_client(server_addr).await;

    let mut bad = TcpStream::connect(local).await.unwrap();
    bad.write_all(b"GET / HTTP/1.1\r\nHost: nowhere\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut bad).await;
    assert!(head.starts_with("HTTP/1.1 405"), "{head}");
    drop(bad);

    // The session survived: a fresh stream can still CONNECT.
    let mut good = TcpStream::connect(local).await.unwrap();
    good.write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut good).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
}

#[tokio::test]
async fn refused_upgrade_leaves_nothing_bound() {
    // A remote that talks plain HTTP and never switches protocols.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let err = TunnelClient::connect(id_token_config(format!("http://{addr}")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UpgradeRefused(_)), "got {err:?}");
}

#[tokio::test]
async fn missing_credential_fails_before_dialing() {
    // The remote points at a closed port; reaching it would produce a
    // transport error, so the credential check must come first.
    let config = ClientConfig {
        addr: "127.0.0.1:0".into(),
        remote: "http://127.0.0.1:1".into(),
        tokens: TokenSource::default(),
    };
    let err = TunnelClient::connect(config).await.unwrap_err();
    assert!(matches!(err, Error::MissingCredential), "got {err:?}");
}

#[tokio::test]
async fn session_loss_reports_disconnected() {
    // A hand-rolled upgrade server whose session the test can kill.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            socket.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        socket
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Upgrade: websocket\r\nConnection: upgrade\r\n\r\n",
            )
            .await
            .unwrap();

        let session = MuxSession::server(socket.compat());
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.close();
        session.closed().await;
    });

    let client = TunnelClient::connect(id_token_config(format!("http://{addr}")))
        .await
        .unwrap();
    let local = client.local_addr().unwrap();
    let err = client.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Disconnected), "got {err:?}");

    // The local listener went down with the session.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(local).await.is_err());
}
