//! Multiplexed connection to one RouterOS device.
//!
//! A single background reader task decodes reply sentences and routes each
//! one by its `.tag=` word to the pending exchange that sent the request;
//! any number of callers issue commands concurrently over the same socket.
//! Replies for one tag arrive in wire order, replies across tags interleave
//! freely -- which is the whole point of tag routing.
//!
//! Delivery to a waiting caller is a channel send, never a callback, so a
//! caller reacting to a reply by issuing another command cannot re-enter
//! the reader.
//!
//! # Example
//!
//! ```rust,ignore
//! use roswire_proto::{Connection, Request, TransportConfig};
//!
//! let conn = Connection::open("192.168.88.1", 8728, &TransportConfig::default()).await?;
//! roswire_proto::auth::login(&conn, "admin", &password, LoginScheme::Plain).await?;
//!
//! let reply = conn.command(Request::new("/system/resource/print")).await?;
//! for row in &reply.rows {
//!     println!("{row:?}");
//! }
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec;
use crate::error::Error;
use crate::sentence::{Reply, ReplyKind, Request, RowMap};
use crate::transport::{IoStream, TransportConfig};

/// Tags wrap within the u16 range, matching what the device echoes back.
const TAG_LIMIT: u32 = 0xFFFF;

/// How long to wait for the device to acknowledge a `/cancel`.
const CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(5);

// ── Results ──────────────────────────────────────────────────────────

/// The aggregated outcome of a one-shot command.
#[derive(Debug, Clone)]
pub struct CommandReply {
    /// Every `!re` data row received before the terminal reply.
    pub rows: Vec<RowMap>,
    /// Attributes of the terminal `!done` reply. Creation commands return
    /// the new entry id here (`ret`), and the login challenge travels the
    /// same way.
    pub done: RowMap,
}

impl CommandReply {
    /// The `ret` attribute of the terminal reply, where creation commands
    /// report the id of the entry they made.
    pub fn ret(&self) -> Option<&str> {
        self.done.get("ret").map(String::as_str)
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// Handle to one device connection.
///
/// Cheaply cloneable; all clones share the socket, the reader task, and
/// the pending-exchange table. Once the connection closes (error, EOF, or
/// [`close`](Self::close)) every pending exchange fails with
/// [`Error::ConnectionClosed`] and new sends are rejected -- reconnecting
/// is the registry's job, not this type's.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    peer: String,
    pending: Mutex<PendingTable>,
    writer: tokio::sync::Mutex<WriteHalf<IoStream>>,
    closed: CancellationToken,
    command_timeout: Duration,
}

impl ConnectionInner {
    /// The table is only ever locked for map surgery, never across an
    /// await; a poisoned lock just means a caller panicked mid-insert.
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct PendingTable {
    slots: HashMap<u32, mpsc::UnboundedSender<Reply>>,
    last_tag: u32,
}

impl PendingTable {
    /// Allocate the next free tag and register its exchange.
    ///
    /// Monotonic, wrapping at [`TAG_LIMIT`], skipping tags still in use
    /// by outstanding exchanges.
    fn register(&mut self) -> (u32, mpsc::UnboundedReceiver<Reply>) {
        loop {
            self.last_tag = if self.last_tag >= TAG_LIMIT { 1 } else { self.last_tag + 1 };
            if !self.slots.contains_key(&self.last_tag) {
                break;
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.slots.insert(self.last_tag, tx);
        (self.last_tag, rx)
    }
}

impl Connection {
    /// Connect to `host:port` and spawn the reader task.
    ///
    /// The returned connection is transport-ready but not authenticated;
    /// run [`auth::login`](crate::auth::login) before anything else.
    pub async fn open(host: &str, port: u16, config: &TransportConfig) -> Result<Self, Error> {
        let stream = config.connect(host, port).await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let inner = Arc::new(ConnectionInner {
            peer: format!("{host}:{port}"),
            pending: Mutex::new(PendingTable::default()),
            writer: tokio::sync::Mutex::new(write_half),
            closed: CancellationToken::new(),
            command_timeout: config.command_timeout,
        });

        tokio::spawn(reader_loop(read_half, Arc::clone(&inner), config.max_sentence));

        debug!(peer = %inner.peer, "connection established");
        Ok(Self { inner })
    }

    /// `host:port` of the device this connection talks to.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Whether the connection is still usable for new exchanges.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    /// Token that fires when the connection dies, however it dies.
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Tear the connection down. All pending exchanges fail with
    /// [`Error::ConnectionClosed`]; idempotent.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        fail_pending(&self.inner);
        debug!(peer = %self.inner.peer, "connection closed");
    }

    // ── One-shot commands ────────────────────────────────────────────

    /// Run a command and aggregate its replies, using the transport's
    /// default command timeout.
    pub async fn command(&self, request: Request) -> Result<CommandReply, Error> {
        self.command_with_timeout(request, self.inner.command_timeout).await
    }

    /// Run a command with an explicit deadline.
    ///
    /// On expiry the exchange's slot is released and the tag becomes
    /// reusable; the connection itself stays up -- a slow command is not
    /// a dead socket.
    pub async fn command_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<CommandReply, Error> {
        debug!(peer = %self.inner.peer, path = request.path(), "command");
        let (tag, mut rx) = self.send_request(request).await?;
        let _slot = SlotGuard { inner: Arc::clone(&self.inner), tag };

        let outcome = tokio::time::timeout(timeout, async {
            let mut rows = Vec::new();
            loop {
                let Some(reply) = rx.recv().await else {
                    return Err(Error::ConnectionClosed);
                };
                match reply.kind {
                    ReplyKind::Row => rows.push(reply.attrs),
                    ReplyKind::Done => return Ok(CommandReply { rows, done: reply.attrs }),
                    ReplyKind::Trap => return Err(Error::from_trap(reply)),
                    ReplyKind::Fatal => return Err(Error::from_fatal(&reply)),
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { timeout_secs: timeout.as_secs() }),
        }
    }

    // ── Streaming commands ───────────────────────────────────────────

    /// Start a streaming command (`/log/print` with `follow`, `/ping`
    /// without a count, ...) and return its row stream.
    ///
    /// The stream is unbounded and not restartable; it ends on
    /// [`cancel`](CommandStream::cancel), a terminal reply from the
    /// device, or connection loss.
    pub async fn stream(&self, request: Request) -> Result<CommandStream, Error> {
        debug!(peer = %self.inner.peer, path = request.path(), "streaming command");
        let (tag, rx) = self.send_request(request).await?;
        Ok(CommandStream { conn: self.clone(), tag, rx, finished: false })
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Register a pending exchange and write the framed request.
    ///
    /// The write happens under the writer lock so concurrent senders
    /// never interleave mid-sentence.
    async fn send_request(
        &self,
        request: Request,
    ) -> Result<(u32, mpsc::UnboundedReceiver<Reply>), Error> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let (tag, rx) = self.inner.pending().register();
        let words = request.into_words(tag);

        let mut frame = BytesMut::with_capacity(words.iter().map(|w| w.len() + 5).sum::<usize>() + 1);
        codec::encode_sentence(&words, &mut frame);

        let write_result = {
            let mut writer = self.inner.writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = write_result {
            self.inner.pending().slots.remove(&tag);
            // a failed write means the socket is gone; take everyone down
            self.inner.closed.cancel();
            fail_pending(&self.inner);
            return Err(Error::Io(e));
        }

        Ok((tag, rx))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Releases a one-shot exchange's slot when its caller stops waiting
/// (timeout, cancellation, or normal return).
struct SlotGuard {
    inner: Arc<ConnectionInner>,
    tag: u32,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.pending().slots.remove(&self.tag);
    }
}

// ── CommandStream ────────────────────────────────────────────────────

/// Lazy, cancellable sequence of data rows from a streaming command.
///
/// Implements [`futures_core::Stream`]; [`next`](Self::next) is the
/// inherent convenience. Dropping the stream cancels it best-effort (the
/// protocol-level `/cancel` is sent from a spawned task); call
/// [`cancel`](Self::cancel) to wait for the device's acknowledgement.
pub struct CommandStream {
    conn: Connection,
    tag: u32,
    rx: mpsc::UnboundedReceiver<Reply>,
    finished: bool,
}

impl CommandStream {
    /// The correlation tag of this exchange.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Next row, if any.
    ///
    /// `None` means the stream ended cleanly (`!done` or cancellation);
    /// connection loss and `!trap`/`!fatal` surface as one final `Err`.
    pub async fn next(&mut self) -> Option<Result<RowMap, Error>> {
        futures_util::StreamExt::next(self).await
    }

    /// Stop the command on the device and release the exchange.
    ///
    /// Sends `/cancel` carrying this exchange's tag and waits briefly for
    /// the acknowledgement; the slot is released either way, so the tag is
    /// reusable as soon as this returns.
    pub async fn cancel(mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let result = send_cancel(&self.conn, self.tag).await;
        self.release();
        result
    }

    fn release(&self) {
        self.conn.inner.pending().slots.remove(&self.tag);
    }

    fn map_reply(&mut self, reply: Reply) -> Option<Result<RowMap, Error>> {
        match reply.kind {
            ReplyKind::Row => Some(Ok(reply.attrs)),
            ReplyKind::Done => {
                self.finished = true;
                self.release();
                None
            }
            ReplyKind::Trap => {
                self.finished = true;
                self.release();
                Some(Err(Error::from_trap(reply)))
            }
            ReplyKind::Fatal => {
                self.finished = true;
                self.release();
                Some(Err(Error::from_fatal(&reply)))
            }
        }
    }
}

impl futures_core::Stream for CommandStream {
    type Item = Result<RowMap, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(reply)) => Poll::Ready(self.map_reply(reply)),
            Poll::Ready(None) => {
                self.finished = true;
                self.release();
                Poll::Ready(Some(Err(Error::ConnectionClosed)))
            }
        }
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.release();
        if !self.conn.is_connected() {
            return;
        }
        // best-effort /cancel so the device stops producing rows
        if let Ok(handle) = Handle::try_current() {
            let conn = self.conn.clone();
            let tag = self.tag;
            handle.spawn(async move {
                if let Err(e) = send_cancel(&conn, tag).await {
                    debug!(peer = %conn.peer(), tag, error = %e, "cancel-on-drop failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("peer", &self.conn.peer())
            .field("tag", &self.tag)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Ask the device to stop the command registered under `tag`.
async fn send_cancel(conn: &Connection, tag: u32) -> Result<(), Error> {
    let request = Request::new("/cancel").param("tag", &tag.to_string());
    match conn.command_with_timeout(request, CANCEL_ACK_TIMEOUT).await {
        Ok(_) => Ok(()),
        // the command may already have finished on its own; nothing to stop
        Err(Error::Trap { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

// ── Reader loop ──────────────────────────────────────────────────────

/// Single reader for the connection's lifetime: buffer bytes, decode
/// sentences, route replies by tag. Exits on close, EOF, I/O error, or a
/// decode error (a desynchronized stream cannot be resynchronized).
async fn reader_loop(mut read: ReadHalf<IoStream>, inner: Arc<ConnectionInner>, max_sentence: usize) {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let reason = 'conn: loop {
        // drain every complete sentence before reading more
        loop {
            match codec::decode_sentence(&buf, max_sentence) {
                Ok(Some((words, consumed))) => {
                    buf.advance(consumed);
                    if words.is_empty() {
                        // bare terminator; some firmwares emit these as keepalives
                        continue;
                    }
                    if let Err(e) = dispatch(&inner, &words) {
                        warn!(peer = %inner.peer, error = %e, "tearing down connection");
                        break 'conn "protocol error";
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %inner.peer, error = %e, "tearing down connection");
                    break 'conn "decode error";
                }
            }
        }

        tokio::select! {
            biased;
            _ = inner.closed.cancelled() => break "closed locally",
            result = read.read_buf(&mut buf) => match result {
                Ok(0) => break "peer closed the connection",
                Ok(_) => {}
                Err(e) => {
                    warn!(peer = %inner.peer, error = %e, "read error");
                    break "read error";
                }
            }
        }
    };

    inner.closed.cancel();
    fail_pending(&inner);
    debug!(peer = %inner.peer, reason, "reader loop exited");
}

/// Route one reply to its pending exchange.
///
/// Replies for unknown or missing tags are discarded -- a late reply for
/// a timed-out or cancelled exchange is expected traffic, not an error.
/// An untagged `!fatal` is the device killing the whole session.
fn dispatch(inner: &ConnectionInner, words: &[String]) -> Result<(), Error> {
    let reply = Reply::parse(words)?;

    let Some(tag) = reply.tag else {
        if reply.kind == ReplyKind::Fatal {
            return Err(Error::from_fatal(&reply));
        }
        debug!(peer = %inner.peer, kind = ?reply.kind, "discarding untagged reply");
        return Ok(());
    };

    let terminal = reply.is_terminal();
    let mut table = inner.pending();
    let Some(tx) = table.slots.get(&tag) else {
        debug!(peer = %inner.peer, tag, "discarding reply for unknown tag");
        return Ok(());
    };

    // a send error means the waiter is gone; its guard cleans the slot
    let _ = tx.send(reply);
    if terminal {
        table.slots.remove(&tag);
    }
    Ok(())
}

/// Fail every outstanding exchange with a connection-closed error.
///
/// Dropping the senders wakes each waiter exactly once with a closed
/// channel; draining under the lock makes double invocation harmless.
fn fail_pending(inner: &ConnectionInner) {
    let slots = std::mem::take(&mut inner.pending().slots);
    if !slots.is_empty() {
        debug!(peer = %inner.peer, count = slots.len(), "failing pending exchanges");
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_monotonic_from_one() {
        let mut table = PendingTable::default();
        let (t1, _rx1) = table.register();
        let (t2, _rx2) = table.register();
        let (t3, _rx3) = table.register();
        assert_eq!((t1, t2, t3), (1, 2, 3));
    }

    #[test]
    fn released_tags_are_not_reused_before_wrap() {
        let mut table = PendingTable::default();
        let (t1, _rx1) = table.register();
        table.slots.remove(&t1);
        let (t2, _rx2) = table.register();
        assert_eq!(t2, 2);
    }

    #[test]
    fn tag_counter_wraps_at_the_limit() {
        let mut table = PendingTable::default();
        table.last_tag = TAG_LIMIT - 1;
        let (t1, _rx1) = table.register();
        assert_eq!(t1, TAG_LIMIT);
        let (t2, _rx2) = table.register();
        assert_eq!(t2, 1);
    }

    #[test]
    fn allocation_skips_tags_still_in_use() {
        let mut table = PendingTable::default();
        let (t1, _rx1) = table.register(); // 1
        let (t2, _rx2) = table.register(); // 2
        table.slots.remove(&t2);
        table.last_tag = TAG_LIMIT; // force a wrap on the next allocation
        let (t3, _rx3) = table.register();
        assert_eq!(t3, 2, "tag {t1} is live and must be skipped");
    }
}
