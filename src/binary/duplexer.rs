//! Packet duplexer: owns the transport and moves framed messages across it.
//!
//! Sending and receiving are guarded by separate locks, so one send may run
//! concurrently with one receive, but two sends (or two receives) never
//! interleave.
//!
//! Every read is bounded by the per-message timeout and by the caller's
//! cancellation token. Interrupting a read after part of a frame has been
//! consumed leaves the stream unusable, so it disconnects.
//!
//! # Early finish
//!
//! A [`DuplexStream`] dropped before it has yielded `ReadyForCommand` leaves
//! the rest of that response on the wire. The duplexer records this and,
//! before the next send or read, discards messages up to and including the
//! next `ReadyForCommand`. The drain is bounded by the message timeout; if it
//! fails the connection is disconnected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::buffer::{BufferPool, Packet};
use super::protocol::{ClientMessage, PacketHeader, ServerMessageType, HEADER_LEN};
use crate::error::{EdgeError, Result};

/// Reads slower than this share of the message timeout are logged.
const SLOW_READ_RATIO: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexerState {
    Disconnected,
    Connected,
    Sending,
    Receiving,
}

struct ReadState<T> {
    reader: BufReader<ReadHalf<T>>,
    /// Set once the first header byte of a frame is consumed, cleared when
    /// its body has been read.
    mid_frame: bool,
}

impl<T: AsyncRead + AsyncWrite> ReadState<T> {
    async fn read_frame(&mut self, pool: &Arc<BufferPool>) -> Result<Option<Packet>> {
        let mut header = [0u8; HEADER_LEN];
        if self.reader.read(&mut header[..1]).await? == 0 {
            return Ok(None);
        }
        self.mid_frame = true;
        self.reader
            .read_exact(&mut header[1..])
            .await
            .map_err(closed_mid_frame)?;
        let header = PacketHeader::parse(&header)?;

        // The rental goes back to the pool if this future is dropped.
        let mut body = pool.rent(header.length);
        self.reader
            .read_exact(body.as_mut_slice())
            .await
            .map_err(closed_mid_frame)?;
        self.mid_frame = false;
        Ok(Some(Packet::new(header.message_type, body)))
    }
}

fn closed_mid_frame(err: std::io::Error) -> EdgeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        EdgeError::Disconnected("connection closed in the middle of a message".to_string())
    } else {
        EdgeError::Io(err)
    }
}

enum ReadOutcome {
    Frame(Result<Option<Packet>>),
    Cancelled,
    Disconnected,
    TimedOut,
}

pub struct Duplexer<T> {
    reader: Mutex<ReadState<T>>,
    writer: Mutex<WriteHalf<T>>,
    disconnect: CancellationToken,
    pending_drain: AtomicBool,
    pool: Arc<BufferPool>,
    message_timeout: Duration,
}

impl<T> Duplexer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: T, pool: Arc<BufferPool>, message_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(ReadState {
                reader: BufReader::new(read_half),
                mid_frame: false,
            }),
            writer: Mutex::new(write_half),
            disconnect: CancellationToken::new(),
            pending_drain: AtomicBool::new(false),
            pool,
            message_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn message_timeout(&self) -> Duration {
        self.message_timeout
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnect.is_cancelled()
    }

    /// Token cancelled once the connection is gone.
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect.clone()
    }

    pub fn state(&self) -> DuplexerState {
        if self.disconnect.is_cancelled() {
            DuplexerState::Disconnected
        } else if self.writer.try_lock().is_err() {
            DuplexerState::Sending
        } else if self.reader.try_lock().is_err() {
            DuplexerState::Receiving
        } else {
            DuplexerState::Connected
        }
    }

    /// Whether an early-finished response still has to be discarded.
    pub fn has_pending_drain(&self) -> bool {
        self.pending_drain.load(Ordering::Acquire)
    }

    /// Mark the connection as gone. Every waiter observes it.
    pub fn disconnect(&self, reason: &str) {
        if !self.disconnect.is_cancelled() {
            tracing::debug!(reason, "duplexer disconnected");
            self.disconnect.cancel();
        }
    }

    /// Disconnect and shut the write side of the transport down.
    pub async fn close(&self) -> Result<()> {
        self.disconnect("closed by client");
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.disconnect.is_cancelled() {
            return Err(EdgeError::Disconnected("connection is closed".to_string()));
        }
        Ok(())
    }

    /// Send a batch of messages as one contiguous write.
    pub async fn send(&self, messages: &[&dyn ClientMessage], cancel: &CancellationToken) -> Result<()> {
        self.ensure_connected()?;
        if self.has_pending_drain() {
            let mut state = self.reader.lock().await;
            self.drain_if_pending(&mut state).await?;
        }
        self.write_batch(messages, cancel).await
    }

    async fn write_batch(&self, messages: &[&dyn ClientMessage], cancel: &CancellationToken) -> Result<()> {
        let mut buf = BytesMut::new();
        for message in messages {
            message.encode_into(&mut buf);
        }
        if cancel.is_cancelled() {
            return Err(EdgeError::Cancelled);
        }

        let mut writer = self.writer.lock().await;
        let outcome = {
            let write = async {
                writer.write_all(&buf).await?;
                writer.flush().await?;
                Ok::<(), EdgeError>(())
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(EdgeError::Cancelled),
                _ = self.disconnect.cancelled() => {
                    Err(EdgeError::Disconnected("connection closed while sending".to_string()))
                }
                res = tokio::time::timeout(self.message_timeout, write) => match res {
                    Ok(res) => res,
                    Err(_) => Err(EdgeError::Timeout(self.message_timeout)),
                },
            }
        };

        if let Err(e) = &outcome {
            // A partial write leaves the server mid-message.
            self.disconnect(&format!("send failed: {}", e));
        } else {
            tracing::trace!(bytes = buf.len(), messages = messages.len(), "sent batch");
        }
        outcome
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the server closes the connection in an orderly
    /// way (zero-byte read at a frame boundary) or when another party
    /// disconnects while this read waits.
    pub async fn read_next(&self, cancel: &CancellationToken) -> Result<Option<Packet>> {
        self.ensure_connected()?;
        let mut state = self.reader.lock().await;
        self.drain_if_pending(&mut state).await?;
        self.read_locked(&mut state, cancel).await
    }

    /// Send `messages`, then stream the response while holding the receive
    /// side.
    pub async fn duplex(
        &self,
        messages: &[&dyn ClientMessage],
        cancel: &CancellationToken,
    ) -> Result<DuplexStream<'_, T>> {
        self.ensure_connected()?;
        let mut state = self.reader.lock().await;
        self.drain_if_pending(&mut state).await?;
        self.write_batch(messages, cancel).await?;
        Ok(DuplexStream {
            duplexer: self,
            state,
            cancel: cancel.clone(),
            finish: CancellationToken::new(),
            complete: false,
        })
    }

    async fn read_locked(&self, state: &mut ReadState<T>, cancel: &CancellationToken) -> Result<Option<Packet>> {
        if state.mid_frame {
            // An earlier read was dropped halfway through a frame.
            self.disconnect("stream desynchronized by an interrupted read");
            return Err(EdgeError::Disconnected(
                "stream desynchronized by an interrupted read".to_string(),
            ));
        }
        if self.disconnect.is_cancelled() {
            return Ok(None);
        }

        let started = Instant::now();
        let outcome = {
            let read = state.read_frame(&self.pool);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => ReadOutcome::Cancelled,
                _ = self.disconnect.cancelled() => ReadOutcome::Disconnected,
                res = tokio::time::timeout(self.message_timeout, read) => match res {
                    Ok(frame) => ReadOutcome::Frame(frame),
                    Err(_) => ReadOutcome::TimedOut,
                },
            }
        };

        match outcome {
            ReadOutcome::Frame(Ok(Some(packet))) => {
                let elapsed = started.elapsed();
                if elapsed.as_secs_f64() >= self.message_timeout.as_secs_f64() * SLOW_READ_RATIO {
                    tracing::warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        timeout_ms = self.message_timeout.as_millis() as u64,
                        message_type = ?packet.message_type(),
                        "slow read approaching the message timeout"
                    );
                }
                tracing::trace!(message_type = ?packet.message_type(), len = packet.len(), "received message");
                Ok(Some(packet))
            }
            ReadOutcome::Frame(Ok(None)) => {
                self.disconnect("server closed the connection");
                Ok(None)
            }
            ReadOutcome::Frame(Err(e)) => {
                if e.is_fatal_for_connection() || state.mid_frame {
                    self.disconnect(&format!("read failed: {}", e));
                }
                Err(e)
            }
            ReadOutcome::Disconnected => Ok(None),
            ReadOutcome::Cancelled => {
                if state.mid_frame {
                    self.disconnect("read cancelled mid-message");
                }
                Err(EdgeError::Cancelled)
            }
            ReadOutcome::TimedOut => {
                if state.mid_frame {
                    self.disconnect("read timed out mid-message");
                }
                Err(EdgeError::Timeout(self.message_timeout))
            }
        }
    }

    /// Discard the rest of an early-finished response.
    async fn drain_if_pending(&self, state: &mut ReadState<T>) -> Result<()> {
        if !self.has_pending_drain() {
            return Ok(());
        }
        if state.mid_frame {
            self.disconnect("stream desynchronized by an interrupted read");
            return Err(EdgeError::Disconnected(
                "stream desynchronized by an interrupted read".to_string(),
            ));
        }

        let pool = &self.pool;
        let drain = async {
            let mut dropped = 0usize;
            loop {
                match state.read_frame(pool).await? {
                    Some(packet) => {
                        dropped += 1;
                        if packet.message_type() == ServerMessageType::ReadyForCommand {
                            return Ok::<usize, EdgeError>(dropped);
                        }
                    }
                    None => {
                        return Err(EdgeError::Disconnected(
                            "connection closed while draining".to_string(),
                        ))
                    }
                }
            }
        };

        match tokio::time::timeout(self.message_timeout, drain).await {
            Ok(Ok(dropped)) => {
                self.pending_drain.store(false, Ordering::Release);
                tracing::debug!(dropped, "discarded undelivered messages after early finish");
                Ok(())
            }
            Ok(Err(e)) => {
                self.disconnect(&format!("drain failed: {}", e));
                Err(e)
            }
            Err(_) => {
                self.disconnect("drain timed out");
                Err(EdgeError::Timeout(self.message_timeout))
            }
        }
    }
}

/// Lets a consumer stop a response stream early.
#[derive(Debug, Clone)]
pub struct FinishHandle(CancellationToken);

impl FinishHandle {
    pub fn finish(&self) {
        self.0.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// One received message plus the handle that ends its stream.
#[derive(Debug)]
pub struct DuplexResult {
    pub packet: Packet,
    pub finish: FinishHandle,
}

/// Response stream produced by [`Duplexer::duplex`]. Holds the receive side
/// until dropped.
pub struct DuplexStream<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    duplexer: &'a Duplexer<T>,
    state: MutexGuard<'a, ReadState<T>>,
    cancel: CancellationToken,
    finish: CancellationToken,
    complete: bool,
}

impl<'a, T> DuplexStream<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Next message of the response; `None` after `ReadyForCommand`, after an
    /// early finish, or when the connection closes.
    pub async fn next(&mut self) -> Result<Option<DuplexResult>> {
        if self.complete || self.finish.is_cancelled() {
            return Ok(None);
        }
        match self.duplexer.read_locked(&mut self.state, &self.cancel).await? {
            Some(packet) => {
                if packet.message_type() == ServerMessageType::ReadyForCommand {
                    self.complete = true;
                }
                Ok(Some(DuplexResult {
                    packet,
                    finish: FinishHandle(self.finish.clone()),
                }))
            }
            None => {
                self.complete = true;
                Ok(None)
            }
        }
    }

    pub fn finish(&self) {
        self.finish.cancel();
    }

    pub fn finish_handle(&self) -> FinishHandle {
        FinishHandle(self.finish.clone())
    }

    /// Whether `ReadyForCommand` (or the end of the connection) was reached.
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

impl<T> Drop for DuplexStream<'_, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn drop(&mut self) {
        if !self.complete && self.duplexer.is_connected() {
            self.duplexer.pending_drain.store(true, Ordering::Release);
        }
    }
}
