//! Buffer pool: rents zeroed byte buffers and descriptor arrays so steady
//! state processes rows without touching the allocator.
//!
//! Buffers come back automatically when the [`PooledBuf`] handle drops, so
//! every rent has a paired return in the same scope. The pool keeps
//! monotonic counters so callers (and tests) can observe that a warmed-up
//! pipeline stops allocating.

use crate::schema::{FieldDescriptor, Schema};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const MIN_CLASS: usize = 64;

/// Concurrency-safe pool of byte buffers, bucketed by power-of-two size
/// class.
#[derive(Debug, Default)]
pub struct BufferPool {
    shelves: Mutex<HashMap<usize, Vec<Box<[u8]>>>>,
    descriptor_arrays: Mutex<Vec<Vec<FieldDescriptor>>>,
    rents: AtomicU64,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rent a buffer of at least `min_size` bytes. The visible window is
    /// exactly `min_size` bytes and starts zeroed.
    pub fn rent(self: &Arc<Self>, min_size: usize) -> PooledBuf {
        let class = class_for(min_size);
        self.rents.fetch_add(1, Ordering::Relaxed);

        let reused = {
            let mut shelves = self.shelves.lock().expect("buffer pool poisoned");
            shelves.get_mut(&class).and_then(Vec::pop)
        };

        let buf = match reused {
            Some(mut buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf[..min_size].fill(0);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; class].into_boxed_slice()
            }
        };

        PooledBuf {
            buf: Some(buf),
            len: min_size,
            pool: Arc::clone(self),
        }
    }

    /// Rent a buffer sized for one row of `schema`.
    pub fn rent_for(self: &Arc<Self>, schema: &Schema) -> PooledBuf {
        self.rent(schema.row_size())
    }

    /// Rent an empty descriptor array with capacity for at least `n`
    /// entries.
    pub fn rent_descriptors(&self, n: usize) -> Vec<FieldDescriptor> {
        let mut arrays = self.descriptor_arrays.lock().expect("buffer pool poisoned");
        match arrays.iter().position(|a| a.capacity() >= n) {
            Some(i) => arrays.swap_remove(i),
            None => Vec::with_capacity(n),
        }
    }

    /// Return a descriptor array rented with [`rent_descriptors`].
    ///
    /// [`rent_descriptors`]: BufferPool::rent_descriptors
    pub fn return_descriptors(&self, mut array: Vec<FieldDescriptor>) {
        array.clear();
        let mut arrays = self.descriptor_arrays.lock().expect("buffer pool poisoned");
        arrays.push(array);
    }

    /// Total rents served.
    pub fn rents(&self) -> u64 {
        self.rents.load(Ordering::Relaxed)
    }

    /// Rents that had to allocate a fresh buffer.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Rents served from a returned buffer.
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    fn put_back(&self, buf: Box<[u8]>) {
        let class = buf.len();
        let mut shelves = self.shelves.lock().expect("buffer pool poisoned");
        shelves.entry(class).or_default().push(buf);
    }
}

fn class_for(min_size: usize) -> usize {
    min_size.next_power_of_two().max(MIN_CLASS)
}

/// An owned, rented buffer. Dereferences to its requested window and goes
/// back to the pool on drop.
pub struct PooledBuf {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer already returned")[..self.len]
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut().expect("buffer already returned")[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len).finish()
    }
}
