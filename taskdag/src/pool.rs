use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::collections::HashMap;

/// Alignment guaranteed for every block handed out by a pool.
pub const POOL_ALIGN: usize = 16;

/// Smallest block a pool will charge for.
pub const MIN_BLOCK: usize = 64;

/// Allocator contract consumed by the scheduler for task records.
///
/// Every record allocation is exact in size: the scheduler remembers the
/// requested size and passes it back verbatim to [`deallocate`]. The pool
/// is free to charge more per block ([`block_size`]), which is what the
/// allocation-size queries on the scheduler report.
///
/// Implementations must be safe for concurrent `allocate`/`deallocate`.
///
/// [`deallocate`]: MemoryPool::deallocate
/// [`block_size`]: MemoryPool::block_size
pub trait MemoryPool: Send + Sync {
    /// Returns a block of at least `n` bytes aligned to [`POOL_ALIGN`], or
    /// null when the pool cannot satisfy the request. Exhaustion is not an
    /// error; callers surface it as a null future.
    fn allocate(&self, n: usize) -> *mut u8;

    /// Returns a block to the pool. `n` must match the size passed to the
    /// `allocate` call that produced `ptr`.
    fn deallocate(&self, ptr: *mut u8, n: usize);

    /// The size actually charged against the pool for an `n`-byte request.
    fn block_size(&self, n: usize) -> usize;

    /// Total bytes this pool may have outstanding at once.
    fn capacity(&self) -> usize;
}

/// Bounded pool handing out power-of-two blocks from segregated free lists.
///
/// Freed blocks are cached per size class and reused before any new memory
/// is requested from the global allocator. The capacity bounds the bytes
/// outstanding at any moment, which makes exhaustion deterministic: a
/// request that would push usage past the capacity fails.
pub struct SuperblockPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    used: usize,
    /// Free blocks per size class, stored as addresses.
    free: HashMap<usize, Vec<usize>>,
    /// Every block ever fetched from the global allocator, for teardown.
    chunks: Vec<(usize, usize)>,
}

impl SuperblockPool {
    pub fn new(capacity: usize) -> SuperblockPool {
        SuperblockPool {
            capacity,
            inner: Mutex::new(PoolInner {
                used: 0,
                free: HashMap::new(),
                chunks: Vec::new(),
            }),
        }
    }

    /// Bytes currently outstanding.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }
}

impl MemoryPool for SuperblockPool {
    fn allocate(&self, n: usize) -> *mut u8 {
        let block = self.block_size(n);
        let mut inner = self.inner.lock();

        if inner.used + block > self.capacity {
            return std::ptr::null_mut();
        }

        if let Some(addr) = inner.free.get_mut(&block).and_then(Vec::pop) {
            inner.used += block;
            return addr as *mut u8;
        }

        let layout = Layout::from_size_align(block, POOL_ALIGN).expect("valid block layout");
        // Safety: `block` is non-zero (at least MIN_BLOCK).
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return ptr;
        }

        inner.used += block;
        inner.chunks.push((ptr as usize, block));
        ptr
    }

    fn deallocate(&self, ptr: *mut u8, n: usize) {
        let block = self.block_size(n);
        let mut inner = self.inner.lock();
        debug_assert!(inner.used >= block, "deallocate without matching allocate");
        inner.used -= block;
        inner.free.entry(block).or_default().push(ptr as usize);
    }

    fn block_size(&self, n: usize) -> usize {
        n.max(MIN_BLOCK).next_power_of_two()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for SuperblockPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for &(addr, block) in &inner.chunks {
            let layout = Layout::from_size_align(block, POOL_ALIGN).expect("valid block layout");
            // Safety: each chunk was obtained from the global allocator with
            // this exact layout and is returned exactly once.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes_are_powers_of_two() {
        let pool = SuperblockPool::new(1 << 16);
        assert_eq!(pool.block_size(1), MIN_BLOCK);
        assert_eq!(pool.block_size(MIN_BLOCK), MIN_BLOCK);
        assert_eq!(pool.block_size(MIN_BLOCK + 1), MIN_BLOCK * 2);
        assert_eq!(pool.block_size(200), 256);
    }

    #[test]
    fn exhaustion_is_non_fatal_and_frees_recover() {
        let pool = SuperblockPool::new(2 * MIN_BLOCK);

        let a = pool.allocate(10);
        let b = pool.allocate(10);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(pool.used(), 2 * MIN_BLOCK);

        let c = pool.allocate(10);
        assert!(c.is_null());

        pool.deallocate(a, 10);
        let d = pool.allocate(10);
        assert_eq!(d, a, "freed block is reused");
        pool.deallocate(b, 10);
        pool.deallocate(d, 10);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn blocks_are_aligned() {
        let pool = SuperblockPool::new(1 << 16);
        let p = pool.allocate(100);
        assert_eq!(p as usize % POOL_ALIGN, 0);
        pool.deallocate(p, 100);
    }
}
