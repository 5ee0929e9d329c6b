//! Full-duplex byte splicing between two streams.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

/// Splice `a` and `b` in both directions until the link is exhausted.
///
/// When one direction reaches EOF the opposite write side is shut down and
/// the surviving direction drains; the first I/O error ends the splice
/// outright. Either way both endpoints are safe to close on return.
///
/// Neither endpoint is closed here, and errors are not surfaced: at this
/// layer a copy failure is indistinguishable from the peer hanging up.
pub async fn pipe<A, B>(a: &mut A, b: &mut B)
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy_bidirectional(a, b).await {
        Ok((to_b, to_a)) => trace!(to_b, to_a, "splice drained"),
        Err(e) => trace!("splice ended: {}", e),
    }
}
