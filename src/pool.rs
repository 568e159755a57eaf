//! Pooled, reference-counted data buffers for the media pipeline.
//!
//! Demuxers allocate one buffer per coded unit on the hot path. This module
//! amortises those allocations across the whole process: freed buffers are
//! kept in per-size-class free lists and handed back out, and the aggregate
//! of live and pooled bytes is capped.
//!
//! # Buffer lifecycle
//!
//! [`ChunkPool::acquire`] hands out a [`PooledBuffer`] with at least the
//! requested capacity. The buffer is mutable while it has a single owner;
//! cloning it creates a cheap aliasing view and freezes the contents. When
//! the last handle drops, the backing allocation returns to the pool (or is
//! freed outright if the pool is over budget).
//!
//! # Locking
//!
//! One mutex serialises all pool state. It is held only for size-class
//! bookkeeping, never across I/O, demuxing or decoding.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::error::{Error, Result};

/// Smallest size class handed out, in bytes.
///
/// Requests below this are rounded up so tiny coded units (highly
/// compressed FLAC frames can be 14 bytes) still reuse a common class.
const MIN_CLASS: usize = 1024;

/// Largest size class handed out, in bytes (1 MiB).
///
/// No audio coded unit handled by this crate approaches this; requests
/// beyond it are refused as malformed.
const MAX_CLASS: usize = 1024 * 1024;

/// Default cap on live + pooled bytes (32 MiB).
const DEFAULT_CAP: usize = 32 * 1024 * 1024;

/// Read-only snapshot of pool usage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Bytes currently handed out to live buffers.
    pub live_bytes: usize,

    /// Bytes currently parked in free lists.
    pub pooled_bytes: usize,

    /// Highest observed `live_bytes + pooled_bytes`.
    pub high_water: usize,
}

/// State behind the pool mutex.
///
/// Private functions on this type assume the lock is held; the public
/// [`ChunkPool`] methods scope the guard.
#[derive(Debug)]
struct PoolInner {
    /// Free lists indexed by size-class exponent.
    free: Vec<Vec<Box<[u8]>>>,
    cap: usize,
    stats: PoolStats,
}

impl PoolInner {
    fn new(cap: usize) -> Self {
        let classes = (usize::BITS - (MAX_CLASS / MIN_CLASS).leading_zeros()) as usize;
        Self {
            free: (0..classes).map(|_| Vec::new()).collect(),
            cap,
            stats: PoolStats::default(),
        }
    }

    /// Maps a requested capacity to its size class exponent.
    fn class_of(len: usize) -> usize {
        let rounded = len.next_power_of_two().max(MIN_CLASS);
        (rounded / MIN_CLASS).trailing_zeros() as usize
    }

    fn class_size(class: usize) -> usize {
        MIN_CLASS << class
    }

    fn take(&mut self, class: usize) -> Option<Box<[u8]>> {
        let data = self.free.get_mut(class)?.pop()?;
        self.stats.pooled_bytes -= data.len();
        Some(data)
    }

    /// Drops pooled buffers, largest classes first, until at least `needed`
    /// bytes of headroom exist under the cap or nothing is left to drop.
    fn optimise(&mut self, needed: usize) {
        for class in (0..self.free.len()).rev() {
            while self.stats.live_bytes + self.stats.pooled_bytes + needed > self.cap {
                match self.free[class].pop() {
                    Some(data) => self.stats.pooled_bytes -= data.len(),
                    None => break,
                }
            }
        }
    }

    fn note_live(&mut self, bytes: usize) {
        self.stats.live_bytes += bytes;
        let total = self.stats.live_bytes + self.stats.pooled_bytes;
        if total > self.stats.high_water {
            self.stats.high_water = total;
        }
    }

    fn release(&mut self, data: Box<[u8]>) {
        let len = data.len();
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(len);
        if self.stats.live_bytes + self.stats.pooled_bytes + len <= self.cap {
            self.stats.pooled_bytes += len;
            self.free[Self::class_of(len)].push(data);
        }
        // Over budget: let the allocation drop.
    }
}

/// Process-wide pool of reusable byte buffers.
///
/// Cloning the pool clones a handle to the same shared state; demuxers are
/// handed a clone at construction.
#[derive(Clone, Debug)]
pub struct ChunkPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl ChunkPool {
    /// Creates a pool with the given cap on live + pooled bytes.
    #[must_use]
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::new(cap_bytes))),
        }
    }

    /// Returns the shared process-wide pool.
    pub fn global() -> &'static ChunkPool {
        static GLOBAL: OnceLock<ChunkPool> = OnceLock::new();
        GLOBAL.get_or_init(|| ChunkPool::new(DEFAULT_CAP))
    }

    /// Acquires a buffer with capacity of at least `len` bytes.
    ///
    /// Reuses a pooled buffer of the matching size class when one exists.
    /// When the cap would be exceeded the pool first drops pooled buffers;
    /// if the request still does not fit, it fails.
    ///
    /// # Errors
    ///
    /// * [`Category::Memory`](crate::error::Category::Memory) if the cap is
    ///   exceeded even after dropping every pooled buffer, or if `len`
    ///   exceeds the largest supported class.
    pub fn acquire(&self, len: usize) -> Result<PooledBuffer> {
        if len > MAX_CLASS {
            return Err(Error::memory(format!(
                "requested {len} bytes exceeds the {MAX_CLASS} byte class limit"
            )));
        }

        let class = PoolInner::class_of(len);
        let size = PoolInner::class_size(class);

        let data = {
            let mut inner = self.inner.lock()?;
            match inner.take(class) {
                Some(data) => {
                    inner.note_live(size);
                    Some(data)
                }
                None => {
                    if inner.stats.live_bytes + inner.stats.pooled_bytes + size > inner.cap {
                        inner.optimise(size);
                    }
                    if inner.stats.live_bytes + size > inner.cap {
                        return Err(Error::memory(format!(
                            "pool cap reached with {} bytes live",
                            inner.stats.live_bytes
                        )));
                    }
                    inner.note_live(size);
                    None
                }
            }
        };

        // Allocation happens outside the lock.
        let data = data.unwrap_or_else(|| vec![0u8; size].into_boxed_slice());

        Ok(PooledBuffer {
            shared: Arc::new(SharedBuffer {
                data: Some(data),
                pool: Arc::downgrade(&self.inner),
            }),
            len: 0,
        })
    }

    /// Returns a snapshot of current pool usage.
    pub fn stats(&self) -> Result<PoolStats> {
        Ok(self.inner.lock()?.stats)
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAP)
    }
}

/// Backing allocation plus the route home.
#[derive(Debug)]
struct SharedBuffer {
    data: Option<Box<[u8]>>,
    pool: Weak<Mutex<PoolInner>>,
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Some(pool) = self.pool.upgrade() {
                if let Ok(mut inner) = pool.lock() {
                    inner.release(data);
                }
            }
        }
    }
}

/// Reference-counted handle to a pooled buffer.
///
/// The first `len` bytes are the payload; the rest of the capacity is
/// scratch. Mutation requires unique ownership: a cloned handle is an
/// aliasing read-only view, and the decoder taking such a view cannot
/// extend the buffer's life past the pool (the allocation always returns
/// when the last handle drops).
#[derive(Clone, Debug)]
pub struct PooledBuffer {
    shared: Arc<SharedBuffer>,
    len: usize,
}

impl PooledBuffer {
    /// Total capacity of the backing allocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.data.as_ref().map_or(0, |d| d.len())
    }

    /// Length of the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The payload bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.shared.data.as_ref().map_or(&[], |d| &d[..self.len])
    }

    /// Mutable access to the full capacity.
    ///
    /// # Panics
    ///
    /// Panics if the buffer has been cloned; only a uniquely owned buffer
    /// may be written.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let shared = Arc::get_mut(&mut self.shared).expect("write to an aliased pooled buffer");
        shared
            .data
            .as_mut()
            .map_or(&mut [][..], |d| &mut d[..])
    }

    /// Sets the payload length, clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Copies `src` into the buffer and sets the payload length.
    ///
    /// # Panics
    ///
    /// Panics if `src` exceeds capacity or the buffer is aliased.
    pub fn copy_from(&mut self, src: &[u8]) {
        let dst = self.as_mut_slice();
        dst[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }
}
