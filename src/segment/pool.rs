//! Fixed-capacity free-list pool for brick channel buffers.
//!
//! Buffers are acquired on streaming worker threads during voxelization and
//! released on the main thread during eviction, so the free list sits behind
//! a lock. The pool is sized for the worst-case number of simultaneously
//! loaded bricks; going past capacity still succeeds but is reported.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::brick::{Texel, BRICK_VOXELS};

/// Shared pool of `BRICK_VOXELS`-capacity RGBA8 buffers.
pub struct BrickBufferPool {
    free: Mutex<Vec<Vec<Texel>>>,
    capacity: usize,
    in_use: AtomicUsize,
    overflowed: AtomicUsize,
}

impl BrickBufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            capacity,
            in_use: AtomicUsize::new(0),
            overflowed: AtomicUsize::new(0),
        })
    }

    /// Take a zeroed full-resolution buffer out of the pool.
    pub fn acquire(self: &Arc<Self>) -> PooledBrick {
        let recycled = self.free.lock().expect("brick pool lock").pop();
        let buf = match recycled {
            Some(mut buf) => {
                buf.clear();
                buf.resize(BRICK_VOXELS, [0; 4]);
                buf
            }
            None => {
                let outstanding = self.in_use.load(Ordering::Relaxed);
                if outstanding >= self.capacity {
                    let n = self.overflowed.fetch_add(1, Ordering::Relaxed);
                    if n == 0 {
                        log::warn!(
                            "brick pool over capacity ({} buffers); check max_loaded_bricks",
                            outstanding
                        );
                    }
                }
                vec![[0; 4]; BRICK_VOXELS]
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        PooledBrick {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Worst-case bytes held by outstanding buffers.
    pub fn usage_bytes(&self) -> usize {
        self.in_use() * BRICK_VOXELS * std::mem::size_of::<Texel>()
    }

    fn release(&self, buf: Vec<Texel>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock().expect("brick pool lock");
        if free.len() < self.capacity {
            free.push(buf);
        }
    }
}

/// A channel buffer checked out of the pool; returns itself on drop.
///
/// After `crop_to_bounds` the logical length is the crop volume; the backing
/// allocation keeps full capacity for reuse.
pub struct PooledBrick {
    buf: Vec<Texel>,
    pool: Arc<BrickBufferPool>,
}

impl PooledBrick {
    /// Shrink the logical texel count to the crop volume.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }
}

impl std::ops::Deref for PooledBrick {
    type Target = [Texel];
    fn deref(&self) -> &[Texel] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBrick {
    fn deref_mut(&mut self) -> &mut [Texel] {
        &mut self.buf
    }
}

impl Drop for PooledBrick {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

impl std::fmt::Debug for PooledBrick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBrick")
            .field("len", &self.buf.len())
            .finish()
    }
}
