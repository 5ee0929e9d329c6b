//! HTTP CONNECT termination for proxied tunnel streams.

use bytes::Bytes;
use causeway_core::pipe;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Connect timeout applied to upstream and CONNECT target dials.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Body type shared by the tunnel's embedded HTTP handlers.
pub type Body = BoxBody<Bytes, hyper::Error>;

/// Handle one request arriving on a proxied tunnel stream.
///
/// Only `CONNECT host:port` is served. The target is dialed before anything
/// is promised to the peer; the `200` then hands the stream over to a raw
/// splice. Dial failures come back as `503` with the reason in the body so
/// the far side can tell a dead target from a dead tunnel.
pub async fn proxy<B>(mut req: Request<B>) -> Result<Response<Body>, hyper::Error>
where
    B: Send + 'static,
{
    if req.method() != Method::CONNECT {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "tunnel streams only accept CONNECT",
        ));
    }

    // A missing or malformed target is not special-cased: the dial fails
    // and the peer gets the same 503 as any other unreachable host.
    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let target_stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(target.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(%target, "dial failed: {}", e);
            return Ok(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("unable to dial {target}, error: {e}"),
            ));
        }
        Err(_) => {
            debug!(%target, "dial timed out");
            return Ok(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("unable to dial {target}, error: connect timed out"),
            ));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let mut stream = TokioIo::new(upgraded);
                let mut target_stream = target_stream;
                pipe(&mut stream, &mut target_stream).await;
            }
            // The 200 is already on the wire at this point and hyper owns
            // the write path; there is nothing left to answer with.
            Err(e) => debug!("connect hijack failed: {}", e),
        }
    });

    Ok(Response::new(empty()))
}

/// Empty body for `101`/`200` responses.
pub fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_connect_is_rejected() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(())
            .unwrap();
        let res = proxy(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_connect_without_authority_maps_to_503() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("/")
            .body(())
            .unwrap();
        let res = proxy(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_dial_failure_maps_to_503() {
        // Port 1 on loopback refuses immediately.
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("127.0.0.1:1")
            .body(())
            .unwrap();
        let res = proxy(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = res.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains("unable to dial 127.0.0.1:1"), "{body}");
    }
}
