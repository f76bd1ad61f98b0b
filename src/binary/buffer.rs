//! Pooled message buffers and the buffer contract used to read them.
//!
//! A received message body lives in a [`PooledChunk`] rented from a
//! [`BufferPool`]. The [`Packet`] that owns the chunk hands out
//! [`BufferContract`] cursors; nested decoders get sub-contracts that view a
//! byte range the parent has already stepped over, without copying.
//!
//! Ownership rules:
//! - the packet is the only owner of its chunk, contracts only borrow it
//! - every contract (root or nested) is counted while alive
//! - the chunk goes back to the pool exactly once, when the packet is
//!   released with no contract outstanding; otherwise it is retired

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use uuid::Uuid;

use super::protocol::ServerMessageType;
use crate::error::{EdgeError, Result};

// ============================================================================
// Buffer Pool
// ============================================================================

/// Default number of idle chunks kept by a pool.
pub const DEFAULT_POOLED_CHUNKS: usize = 16;

/// Default capacity of a freshly allocated chunk.
pub const DEFAULT_CHUNK_CAPACITY: usize = 8 * 1024;

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub rented: usize,
    pub returned: usize,
    pub retired: usize,
    pub idle: usize,
}

/// Free-list of reusable byte chunks.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_idle: usize,
    chunk_capacity: usize,
    rented: AtomicUsize,
    returned: AtomicUsize,
    retired: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_idle: usize, chunk_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            chunk_capacity,
            rented: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
        })
    }

    /// Rent a zero-filled chunk of exactly `len` bytes.
    pub fn rent(self: &Arc<Self>, len: usize) -> PooledChunk {
        let mut buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.chunk_capacity.max(len)));
        buf.clear();
        buf.resize(len, 0);
        self.rented.fetch_add(1, Ordering::Relaxed);

        PooledChunk {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn give_back(&self, buf: BytesMut) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        // Chunks grown for one large message are freed, not kept idle
        if buf.capacity() > self.chunk_capacity {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    fn note_retired(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.rented.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }

    /// Chunks currently handed out and not yet returned or retired.
    pub fn outstanding(&self) -> usize {
        let stats = self.stats();
        stats.rented - stats.returned - stats.retired
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle: DEFAULT_POOLED_CHUNKS,
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            rented: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
        }
    }
}

/// A rented chunk. Dropping it returns the memory to its pool.
#[derive(Debug)]
pub struct PooledChunk {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledChunk {
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the memory instead of returning it to the pool.
    fn retire(&mut self) {
        if self.buf.take().is_some() {
            self.pool.note_retired();
        }
    }
}

impl Drop for PooledChunk {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// One received message: its type tag and its pooled body.
#[derive(Debug)]
pub struct Packet {
    message_type: ServerMessageType,
    body: PooledChunk,
    outstanding: Cell<usize>,
    consumed: Cell<bool>,
}

impl Packet {
    pub fn new(message_type: ServerMessageType, body: PooledChunk) -> Self {
        Self {
            message_type,
            body,
            outstanding: Cell::new(0),
            consumed: Cell::new(false),
        }
    }

    /// Build a packet from raw body bytes, renting from `pool`.
    pub fn from_body(pool: &Arc<BufferPool>, message_type: ServerMessageType, body: &[u8]) -> Self {
        let mut chunk = pool.rent(body.len());
        chunk.as_mut_slice().copy_from_slice(body);
        Self::new(message_type, chunk)
    }

    pub fn message_type(&self) -> ServerMessageType {
        self.message_type
    }

    pub fn body(&self) -> &[u8] {
        self.body.as_slice()
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Open a cursor over the whole body.
    pub fn contract(&self) -> BufferContract<'_> {
        BufferContract::tracked(self.body.as_slice(), &self.outstanding, Some(&self.consumed))
    }

    /// Whether a root contract has read the body to the end.
    pub fn is_consumed(&self) -> bool {
        self.consumed.get()
    }

    /// Number of contracts currently borrowing the body.
    pub fn outstanding_contracts(&self) -> usize {
        self.outstanding.get()
    }

    /// Release the packet and give its chunk back to the pool.
    ///
    /// Releasing while a contract is still outstanding is a programming error:
    /// the chunk is retired instead of pooled and an error is returned.
    pub fn release(mut self) -> Result<()> {
        let outstanding = self.outstanding.get();
        if outstanding > 0 {
            self.body.retire();
            self.outstanding.set(0);
            tracing::error!(
                message_type = ?self.message_type,
                outstanding,
                "packet released with outstanding sub-contracts"
            );
            return Err(EdgeError::Internal(format!(
                "packet released with {} outstanding sub-contract(s)",
                outstanding
            )));
        }
        if !self.consumed.get() && !self.body.is_empty() {
            tracing::trace!(message_type = ?self.message_type, "packet released before full consumption");
        }
        Ok(())
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if self.outstanding.get() > 0 {
            tracing::error!(
                message_type = ?self.message_type,
                outstanding = self.outstanding.get(),
                "packet dropped with outstanding sub-contracts"
            );
            self.body.retire();
        }
    }
}

// ============================================================================
// Buffer Contract
// ============================================================================

/// A bounded read cursor over a byte range.
///
/// `position <= len()` always holds; any read that would cross `len()` fails
/// with a protocol violation and leaves the cursor where it was.
#[derive(Debug)]
pub struct BufferContract<'a> {
    data: &'a [u8],
    position: usize,
    tracker: Option<&'a Cell<usize>>,
    consumed: Option<&'a Cell<bool>>,
}

impl<'a> BufferContract<'a> {
    /// An untracked contract over borrowed bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            tracker: None,
            consumed: None,
        }
    }

    fn tracked(data: &'a [u8], tracker: &'a Cell<usize>, consumed: Option<&'a Cell<bool>>) -> Self {
        tracker.set(tracker.get() + 1);
        Self {
            data,
            position: 0,
            tracker: Some(tracker),
            consumed,
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(EdgeError::protocol(format!(
                "read of {} bytes at position {} exceeds buffer length {}",
                n,
                self.position,
                self.data.len()
            )));
        }
        let data: &'a [u8] = self.data;
        let slice = &data[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(EdgeError::protocol(format!("invalid boolean byte 0x{:02x}", other))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Everything from the cursor to the end.
    pub fn read_rest(&mut self) -> Result<&'a [u8]> {
        self.take(self.remaining())
    }

    /// u32 length followed by that many bytes. A zero length is empty, not absent.
    pub fn read_length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Length-prefixed UTF-8 text.
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_length_prefixed()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| EdgeError::protocol(format!("invalid UTF-8 in string: {}", e)))
    }

    /// Hand the next `n` bytes to a nested decoder.
    ///
    /// The parent steps past the range immediately; the sub-contract stays
    /// counted against the owning packet until it is dropped.
    pub fn reserve(&mut self, n: usize) -> Result<BufferContract<'a>> {
        let data = self.take(n)?;
        Ok(match self.tracker {
            Some(tracker) => BufferContract::tracked(data, tracker, None),
            None => BufferContract::new(data),
        })
    }

    /// Read an i32-length-framed element; `-1` means absent and consumes nothing more.
    pub fn read_element(&mut self) -> Result<Option<BufferContract<'a>>> {
        let len = self.read_i32()?;
        match len {
            -1 => Ok(None),
            n if n < 0 => Err(EdgeError::protocol(format!("negative element length {}", n))),
            n => self.reserve(n as usize).map(Some),
        }
    }

    /// Fail if bytes are left over after a decoder finished.
    pub fn ensure_exhausted(&self, what: &str) -> Result<()> {
        if self.is_exhausted() {
            Ok(())
        } else {
            Err(EdgeError::protocol(format!(
                "{} left {} unread byte(s)",
                what,
                self.remaining()
            )))
        }
    }
}

impl Drop for BufferContract<'_> {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker {
            tracker.set(tracker.get().saturating_sub(1));
        }
        if let Some(consumed) = self.consumed {
            if self.is_exhausted() {
                consumed.set(true);
            }
        }
    }
}
