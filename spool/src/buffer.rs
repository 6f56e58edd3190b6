// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity batch buffers and the pool flush workers borrow them from.

use crossbeam_queue::ArrayQueue;

/// Sink that may refuse an item, handing it back.
///
/// [`SizeBoundedQueue::drain_to`](crate::queue::SizeBoundedQueue::drain_to) stops at the first refused item and
/// puts it back at the head of the queue.
pub trait Accept<T> {
    fn accept(&mut self, item: T) -> Result<(), T>;
}

impl<T> Accept<T> for Vec<T> {
    fn accept(&mut self, item: T) -> Result<(), T> {
        self.push(item);
        Ok(())
    }
}

/// A list that refuses inserts once it holds `capacity` items.
#[derive(Debug)]
pub struct Buffer<T> {
    capacity: usize,
    elements: Vec<T>,
}

impl<T> Buffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            elements: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.elements.len() >= self.capacity
    }

    /// Remove every item, keeping the allocation.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.elements.drain(..)
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }
}

impl<T> Accept<T> for Buffer<T> {
    fn accept(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.elements.push(item);
        Ok(())
    }
}

/// Bounded free-list of [`Buffer`]s.
///
/// Sized to the number of flush workers so steady-state flushing does not allocate. An empty pool hands out fresh
/// buffers, and buffers returned to a full pool are discarded.
pub struct BufferPool<T> {
    buffers: ArrayQueue<Buffer<T>>,
    buffer_capacity: usize,
}

impl<T> BufferPool<T> {
    /// Create a pool keeping at most `pool_size` buffers of `buffer_capacity` items each.
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(pool_size.max(1)),
            buffer_capacity,
        }
    }

    pub fn acquire(&self) -> Buffer<T> {
        self.buffers
            .pop()
            .unwrap_or_else(|| Buffer::new(self.buffer_capacity))
    }

    /// Return a buffer to the pool. Its contents are dropped.
    pub fn release(&self, mut buffer: Buffer<T>) {
        if buffer.capacity != self.buffer_capacity {
            return;
        }
        buffer.clear();
        // a full pool discards the buffer
        let _ = self.buffers.push(buffer);
    }

    /// Number of idle buffers held by the pool.
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

impl<T> std::fmt::Debug for BufferPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.buffers.len())
            .field("pool_size", &self.buffers.capacity())
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}
