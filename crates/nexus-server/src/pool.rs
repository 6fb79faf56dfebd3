//! Bounded object pools for per-connection buffers.
//!
//! A pool hands out objects built by a factory and takes them back on
//! release. Released objects are reset; anything beyond `max_size` idle
//! objects is dropped instead of retained.

use std::sync::{Mutex, MutexGuard};

use bytes::BytesMut;

/// Objects that can be scrubbed before going back into a pool.
pub trait Reusable {
    fn reset(&mut self);
}

// Read buffers keep their length; only the contents are scrubbed.
impl Reusable for Vec<u8> {
    fn reset(&mut self) {
        self.fill(0);
    }
}

impl Reusable for BytesMut {
    fn reset(&mut self) {
        self.clear();
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

pub struct MemoryPool<T> {
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    max_size: usize,
}

impl<T: Reusable> MemoryPool<T> {
    /// Create a pool with `initial` preallocated objects.
    pub fn new<F>(initial: usize, max_size: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let idle = (0..initial.min(max_size)).map(|_| factory()).collect();
        Self {
            idle: Mutex::new(idle),
            factory: Box::new(factory),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        // The pool only holds scrubbed objects, so a poisoned guard is still usable.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take an idle object, or build a fresh one when the pool is empty.
    pub fn acquire(&self) -> T {
        let pooled = self.lock().pop();
        pooled.unwrap_or_else(|| (self.factory)())
    }

    /// Return an object. Dropped when the pool is already full.
    pub fn release(&self, mut object: T) {
        object.reset();
        let mut idle = self.lock();
        if idle.len() < self.max_size {
            idle.push(object);
        }
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

/// Pool of fixed-length socket read buffers.
pub fn recv_buffer_pool(initial: usize, max_size: usize, buffer_size: usize) -> MemoryPool<Vec<u8>> {
    MemoryPool::new(initial, max_size, move || vec![0u8; buffer_size])
}

/// Pool of frame accumulation buffers.
pub fn accumulator_pool(initial: usize, max_size: usize, capacity: usize) -> MemoryPool<BytesMut> {
    MemoryPool::new(initial, max_size, move || BytesMut::with_capacity(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuses() {
        let pool = accumulator_pool(2, 4, 64);
        assert_eq!(pool.available(), 2);

        let mut buf = pool.acquire();
        buf.extend_from_slice(b"leftover");
        assert_eq!(pool.available(), 1);

        pool.release(buf);
        assert_eq!(pool.available(), 2);
        let buf = pool.acquire();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_grows_on_demand_and_discards_overflow() {
        let pool = recv_buffer_pool(0, 2, 16);
        let objects: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.available(), 0);
        for object in objects {
            pool.release(object);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_initial_capped_by_max() {
        let pool = recv_buffer_pool(10, 3, 8);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.acquire().len(), 8);
    }
}
