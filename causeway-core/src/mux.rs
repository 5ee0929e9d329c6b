//! Stream multiplexing over a single byte transport.
//!
//! Wraps a yamux connection in a handle with `open`/`accept`/`closed`
//! operations. The connection itself lives in a driver task; yamux requires
//! a single poller, so stream opens are funneled through a command channel
//! and inbound streams are handed out through a bounded queue.

use crate::error::{Error, Result};
use futures::io::{AsyncRead, AsyncWrite};
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use yamux::{Config, Connection, Mode};

/// One logical byte channel inside a [`MuxSession`].
pub type MuxStream = yamux::Stream;

/// Inbound streams buffered between the driver and `accept` callers.
const ACCEPT_BACKLOG: usize = 32;

enum Command {
    Open(oneshot::Sender<Result<MuxStream>>),
    Close,
}

/// Handle to a multiplexed session over one upgraded transport.
///
/// Both endpoints of a tunnel hold one of these around their half of the
/// connection. Cloning shares the session. The session terminates when the
/// peer goes away, the connection errors, or [`close`](MuxSession::close)
/// is called; dropping every handle closes it as well.
#[derive(Clone)]
#[derive(Debug)]
pub struct MuxSession {
    commands: mpsc::UnboundedSender<Command>,
    inbound: Arc<Mutex<mpsc::Receiver<MuxStream>>>,
    closed: CancellationToken,
}

impl MuxSession {
    /// Wrap the client half of a session.
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(io, Mode::Client)
    }

    /// Wrap the server half of a session.
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(io, Mode::Server)
    }

    fn new<T>(io: T, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::new(io, Config::default(), mode);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::channel(ACCEPT_BACKLOG);
        let closed = CancellationToken::new();
        tokio::spawn(drive(connection, command_rx, inbound_tx, closed.clone()));
        Self {
            commands,
            inbound: Arc::new(Mutex::new(inbound)),
            closed,
        }
    }

    /// Open a new outbound stream.
    ///
    /// Fails with [`Error::Disconnected`] once the session has terminated.
    pub async fn open(&self) -> Result<MuxStream> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Open(reply))
            .map_err(|_| Error::Disconnected)?;
        result.await.map_err(|_| Error::Disconnected)?
    }

    /// Wait for the peer to open a stream.
    ///
    /// Returns `None` once the session has terminated and the backlog is
    /// drained.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.inbound.lock().await.recv().await
    }

    /// Resolves when the session has terminated, whatever the cause:
    /// peer close, I/O error, or a local [`close`](MuxSession::close).
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Check for termination without waiting.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Tear down all streams and the underlying transport.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Single poller for the yamux connection.
///
/// Every call below drives socket I/O, so open requests and inbound
/// acceptance have to be interleaved in one task rather than split across
/// callers.
async fn drive<T>(
    mut connection: Connection<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::Sender<MuxStream>,
    closed: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pending_open: VecDeque<oneshot::Sender<Result<MuxStream>>> = VecDeque::new();
    let mut shutdown = false;

    std::future::poll_fn(|cx| {
        loop {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => pending_open.push_back(reply),
                // Explicit close, or every handle dropped.
                Poll::Ready(Some(Command::Close)) | Poll::Ready(None) => {
                    shutdown = true;
                    break;
                }
                Poll::Pending => break,
            }
        }

        if shutdown {
            return match connection.poll_close(cx) {
                Poll::Ready(result) => {
                    if let Err(e) = result {
                        trace!("session close: {}", e);
                    }
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            };
        }

        while !pending_open.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(reply) = pending_open.pop_front() {
                        let _ = reply.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(e)) => {
                    debug!("outbound open failed, session is gone: {}", e);
                    if let Some(reply) = pending_open.pop_front() {
                        let _ = reply.send(Err(Error::Mux(e)));
                    }
                    return Poll::Ready(());
                }
                Poll::Pending => break,
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    // A full backlog means nobody is accepting; dropping the
                    // stream resets it on the peer without harming others.
                    if inbound.try_send(stream).is_err() {
                        debug!("inbound backlog full, resetting stream");
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!("session failed: {}", e);
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    trace!("peer closed the session");
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    for reply in pending_open.drain(..) {
        let _ = reply.send(Err(Error::Disconnected));
    }
    closed.cancel();
}
