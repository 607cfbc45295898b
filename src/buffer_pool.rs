//! Byte-buffer pool taking allocations off the per-request hot path.
//!
//! Buffers are organised in power-of-two classes from 4 bytes (one request
//! tag) up to 4 KiB (response scratch). Each class keeps a small stash of
//! `Vec<u8>` instances behind a lock; callers lease a buffer sized to the
//! upcoming read or write and the lease returns it on drop.

use parking_lot::Mutex;

const MIN_BUFFER_SIZE: usize = 4;
const MAX_BUFFER_SIZE: usize = 4096;
const BUFFER_SIZES: [usize; 11] = [4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
const BUFFERS_PER_SIZE: usize = 32;

/// Pool of reusable byte buffers, one free-list per size class.
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            classes: BUFFER_SIZES
                .iter()
                .map(|_| Mutex::new(Vec::with_capacity(BUFFERS_PER_SIZE)))
                .collect(),
        }
    }

    /// Acquire a buffer with at least `size_hint` usable bytes.
    pub fn lease(&self, size_hint: usize) -> BufferLease<'_> {
        let size = size_class_for(size_hint);
        let idx = class_index(size);
        let data = self.classes[idx].lock().pop().unwrap_or_else(|| vec![0; size]);
        BufferLease {
            pool: self,
            class: idx,
            data: Some(data),
        }
    }

    fn release(&self, class: usize, mut data: Vec<u8>) {
        data.clear();
        data.resize(BUFFER_SIZES[class], 0);
        let mut stash = self.classes[class].lock();
        if stash.len() < BUFFERS_PER_SIZE {
            stash.push(data);
        }
    }

    #[cfg(test)]
    fn stashed(&self, size: usize) -> usize {
        self.classes[class_index(size_class_for(size))].lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn size_class_for(len: usize) -> usize {
    len.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE).next_power_of_two()
}

#[inline]
fn class_index(size: usize) -> usize {
    debug_assert!(size.is_power_of_two());
    size.trailing_zeros() as usize - MIN_BUFFER_SIZE.trailing_zeros() as usize
}

/// Exclusive access to a pooled buffer; returns it to the pool on drop.
pub struct BufferLease<'a> {
    pool: &'a BufferPool,
    class: usize,
    data: Option<Vec<u8>>,
}

impl BufferLease<'_> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data
            .as_mut()
            .expect("buffer lease already consumed")
            .as_mut_slice()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data
            .as_ref()
            .expect("buffer lease already consumed")
            .as_slice()
    }

    /// Clear the buffer so it can be reused as an output sink.
    pub fn reset(&mut self) -> &mut Vec<u8> {
        let data = self.data.as_mut().expect("buffer lease already consumed");
        data.clear();
        data
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(self.class, data);
        }
    }
}
