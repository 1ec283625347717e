use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Objects that can be cleared for reuse without giving back their allocations.
pub trait Reset {
    fn reset(&mut self);
}

impl Reset for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Default fast-path capacity: `clamp(2 * CPUs, 8, 128)`.
pub fn default_pool_capacity() -> usize {
    (num_cpus::get() * 2).clamp(8, 128)
}

/// Bounded object pool.
///
/// `get` tries the lock-free queue first, then the overflow list, then allocates. `put`
/// resets the object and keeps it only while there is room; anything beyond both bounds is
/// dropped so the pool never grows without limit.
#[derive(Debug)]
pub struct ObjectPool<T> {
    fast: ArrayQueue<T>,
    overflow: Mutex<Vec<T>>,
    overflow_cap: usize,
}

impl<T: Reset + Default> ObjectPool<T> {
    pub fn new(capacity: usize, overflow_cap: usize) -> Self {
        Self {
            fast: ArrayQueue::new(capacity.max(1)),
            overflow: Mutex::new(Vec::new()),
            overflow_cap,
        }
    }

    pub fn with_default_capacity() -> Self {
        let cap = default_pool_capacity();
        Self::new(cap, cap)
    }

    pub fn get(&self) -> T {
        if let Some(v) = self.fast.pop() {
            return v;
        }
        if let Ok(mut list) = self.overflow.lock() {
            if let Some(v) = list.pop() {
                return v;
            }
        }
        T::default()
    }

    pub fn put(&self, mut v: T) {
        v.reset();
        let v = match self.fast.push(v) {
            Ok(()) => return,
            Err(v) => v,
        };
        // A poisoned overflow list only loses the object.
        if let Ok(mut list) = self.overflow.lock() {
            if list.len() < self.overflow_cap {
                list.push(v);
            }
        }
    }

    /// Objects currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.fast.len() + self.overflow.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.fast.capacity() + self.overflow_cap
    }
}

/// Pool of byte buffers used for key construction.
pub type BufferPool = ObjectPool<Vec<u8>>;

impl BufferPool {
    /// Leases a buffer that goes back to the pool when the guard drops.
    pub fn lease(&self) -> PooledBuf<'_> {
        PooledBuf {
            buf: self.get(),
            pool: self,
        }
    }
}

/// A byte buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuf<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn buffers_come_back_empty_with_capacity() {
        let pool = BufferPool::new(2, 0);
        let mut b = pool.get();
        b.extend_from_slice(&[1u8; 512]);
        let cap = b.capacity();
        pool.put(b);
        let b = pool.get();
        assert!(b.is_empty());
        assert_eq!(b.capacity(), cap);
    }

    #[test]
    fn leased_buffer_returns_on_drop() {
        let pool = BufferPool::new(2, 0);
        {
            let mut b = pool.lease();
            b.extend_from_slice(b"prefix");
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
        assert!(pool.lease().is_empty());
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new(2, 1);
        for _ in 0..10 {
            pool.put(Vec::with_capacity(8));
        }
        assert_eq!(pool.idle(), 3);
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn default_capacity_is_clamped() {
        let cap = default_pool_capacity();
        assert!((8..=128).contains(&cap));
    }

    #[test]
    fn concurrent_get_put() {
        let pool = Arc::new(BufferPool::new(4, 4));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut b = pool.get();
                        b.push(i as u8);
                        pool.put(b);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle() <= 8);
    }
}
