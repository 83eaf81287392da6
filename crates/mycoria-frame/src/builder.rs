//! Pooled frame construction.
//!
//! Per-packet allocations are avoided with fixed-capacity byte-buffer pools
//! in four size classes, roughly matching a control frame, an MTU-sized
//! frame, a jumbo frame and the largest sealable frame. Buffers are handed
//! back after the frame leaves the router.

use std::sync::Mutex;

use crate::frame::{Frame, FrameOpts};

/// Buffer size classes in bytes.
pub const SIZE_CLASSES: [usize; 4] = [608, 1600, 5120, 65664];

/// Buffers kept per class.
const POOL_CAPACITY: usize = 64;

struct BytePool {
    class: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BytePool {
    fn new(class: usize) -> Self {
        Self {
            class,
            buffers: Mutex::new(Vec::with_capacity(POOL_CAPACITY)),
        }
    }

    fn get(&self) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.class))
    }

    fn put(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < self.class {
            return;
        }
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < POOL_CAPACITY {
            buffers.push(buffer);
        }
    }
}

/// Builds frames over pooled buffers.
pub struct FrameBuilder {
    pools: [BytePool; 4],
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            pools: [
                BytePool::new(SIZE_CLASSES[0]),
                BytePool::new(SIZE_CLASSES[1]),
                BytePool::new(SIZE_CLASSES[2]),
                BytePool::new(SIZE_CLASSES[3]),
            ],
        }
    }

    /// Fetch a buffer with at least `capacity` bytes from the smallest
    /// fitting class. Oversized requests fall through to a plain
    /// allocation.
    pub fn get_buffer(&self, capacity: usize) -> Vec<u8> {
        match self.pools.iter().find(|pool| pool.class >= capacity) {
            Some(pool) => pool.get(),
            None => {
                tracing::trace!(capacity, "buffer request above largest pool class");
                Vec::with_capacity(capacity)
            }
        }
    }

    /// Return a buffer to its class, dropping those that fit no class.
    pub fn recycle(&self, buffer: Vec<u8>) {
        let capacity = buffer.capacity();
        if let Some(pool) = self
            .pools
            .iter()
            .rev()
            .find(|pool| capacity >= pool.class)
        {
            pool.put(buffer);
        }
    }

    /// Build a frame over a pooled buffer.
    pub fn build(
        &self,
        opts: FrameOpts,
        switch_block: &[u8],
        message: &[u8],
        appendix: &[u8],
        reserve_signature: bool,
    ) -> Frame {
        let capacity = crate::frame::HEADER_SIZE
            + 12
            + switch_block.len()
            + message.len()
            + appendix.len()
            + crate::frame::SIGNATURE_SIZE
            + crate::frame::TAG_SIZE;
        let buffer = self.get_buffer(capacity);
        Frame::build(buffer, opts, switch_block, message, appendix, reserve_signature)
    }

    /// Tear a frame down and recycle its buffer.
    pub fn recycle_frame(&self, frame: Frame) {
        self.recycle(frame.into_buffer());
    }
}
