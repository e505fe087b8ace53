//! Pre-allocated receive buffers for the UDP listener
//!
//! An optional pool of datagram sized buffers, handed out to the receive
//! loop instead of fresh allocations. Purely a performance toggle: replies
//! are identical with or without it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Memory pool configuration
#[derive(Debug, Clone)]
pub struct MemoryPoolConfig {
    /// Buffer size; one plain UDP DNS message
    pub buffer_size: usize,
    /// Buffers allocated up front
    pub initial_pool_size: usize,
    /// Buffers kept around at most; releases beyond this are dropped
    pub max_pool_size: usize,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 512,
            initial_pool_size: 64,
            max_pool_size: 1024,
        }
    }
}

/// Pool usage counters, for the curious
#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: usize,
    pub misses: usize,
    pub returns: usize,
}

/// Fixed size buffer pool shared by the UDP worker threads
pub struct BufferPool {
    config: MemoryPoolConfig,
    available: Mutex<VecDeque<Vec<u8>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    returns: AtomicUsize,
}

impl BufferPool {
    pub fn new(config: MemoryPoolConfig) -> BufferPool {
        let mut available = VecDeque::with_capacity(config.initial_pool_size);
        for _ in 0..config.initial_pool_size {
            available.push_back(vec![0; config.buffer_size]);
        }

        BufferPool {
            config,
            available: Mutex::new(available),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            returns: AtomicUsize::new(0),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Take a zeroed buffer from the pool, allocating if it is empty
    pub fn acquire(&self) -> Vec<u8> {
        if let Some(buffer) = self.available.lock().pop_front() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return buffer;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        vec![0; self.config.buffer_size]
    }

    /// Hand a buffer back; it is re-zeroed so no query data leaks into the
    /// next receive
    pub fn release(&self, mut buffer: Vec<u8>) {
        let mut available = self.available.lock();
        if available.len() >= self.config.max_pool_size {
            return;
        }

        buffer.clear();
        buffer.resize(self.config.buffer_size, 0);
        available.push_back(buffer);
        self.returns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = BufferPool::new(MemoryPoolConfig {
            buffer_size: 512,
            initial_pool_size: 1,
            max_pool_size: 2,
        });

        let mut buffer = pool.acquire();
        assert_eq!(512, buffer.len());
        buffer[0] = 0xFF;
        pool.release(buffer);

        // released buffer comes back zeroed
        let buffer = pool.acquire();
        assert_eq!(0, buffer[0]);

        let stats = pool.stats();
        assert_eq!(2, stats.hits);
        assert_eq!(1, stats.returns);
    }

    #[test]
    fn test_pool_miss_allocates() {
        let pool = BufferPool::new(MemoryPoolConfig {
            buffer_size: 512,
            initial_pool_size: 0,
            max_pool_size: 2,
        });

        let buffer = pool.acquire();
        assert_eq!(512, buffer.len());
        assert_eq!(1, pool.stats().misses);
    }

    #[test]
    fn test_pool_does_not_grow_past_max() {
        let pool = BufferPool::new(MemoryPoolConfig {
            buffer_size: 16,
            initial_pool_size: 0,
            max_pool_size: 1,
        });

        pool.release(vec![0; 16]);
        pool.release(vec![0; 16]);

        assert_eq!(1, pool.stats().returns);
    }
}
