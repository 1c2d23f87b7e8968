//! Bounded pool of fixed-size memory blocks.
//!
//! The pool hands out [`Block`]s up to a ceiling derived from the memory
//! currently available to the process. Blocking requests wait for other
//! holders to drop their blocks; non-blocking requests fail immediately.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

const RECOMPUTE_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot of pool accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Blocks currently held by consumers.
    pub checked_out: u64,
    /// Current ceiling on `checked_out`.
    pub computed_max: u64,
    /// Blocks handed out since creation.
    pub acquired: u64,
    /// Blocks returned since creation.
    pub freed: u64,
    /// Recycled blocks waiting for reuse.
    pub idle: usize,
}

struct PoolState {
    checked_out: u64,
    computed_max: u64,
    last_recompute: Option<Instant>,
    idle: Vec<Vec<u8>>,
    acquired: u64,
    freed: u64,
}

/// Shared allocator of fixed-size blocks.
pub struct BufferPool {
    block_size: usize,
    max_buffers: Option<u64>,
    state: Mutex<PoolState>,
    released: Notify,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.block_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    /// Creates a pool of `block_size` blocks, optionally capped at `max_buffers`.
    pub fn new(block_size: usize, max_buffers: Option<u64>) -> Arc<Self> {
        let pool = BufferPool {
            block_size: block_size.max(1),
            max_buffers,
            state: Mutex::new(PoolState {
                checked_out: 0,
                computed_max: 1,
                last_recompute: None,
                idle: Vec::new(),
                acquired: 0,
                freed: 0,
            }),
            released: Notify::new(),
        };
        {
            let mut st = pool.state.lock();
            pool.recompute(&mut st, true);
        }
        Arc::new(pool)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            checked_out: st.checked_out,
            computed_max: st.computed_max,
            acquired: st.acquired,
            freed: st.freed,
            idle: st.idle.len(),
        }
    }

    /// Number of blocks needed to hold `size` bytes.
    pub fn blocks_for(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size as u64).max(1)
    }

    fn recompute(&self, st: &mut PoolState, force: bool) {
        let due = st
            .last_recompute
            .map_or(true, |t| t.elapsed() >= RECOMPUTE_INTERVAL);
        if !force && !due {
            return;
        }
        let mut max = (available_memory() / 2 / self.block_size as u64).max(1);
        if let Some(cap) = self.max_buffers {
            max = max.min(cap.max(1));
        }
        if max != st.computed_max {
            debug!("buffer pool ceiling {} -> {} blocks", st.computed_max, max);
        }
        st.computed_max = max;
        st.last_recompute = Some(Instant::now());

        let keep = max.saturating_sub(st.checked_out) as usize;
        st.idle.truncate(keep);
    }

    fn take(self: &Arc<Self>, st: &mut PoolState, n: u64) -> Vec<Block> {
        st.checked_out += n;
        st.acquired += n;
        (0..n)
            .map(|_| {
                let data = st.idle.pop().unwrap_or_else(|| vec![0u8; self.block_size]);
                Block {
                    data,
                    pool: Arc::clone(self),
                }
            })
            .collect()
    }

    /// Non-blocking request for enough blocks to hold `size` bytes.
    ///
    /// All-or-nothing: returns `None` if the ceiling would be exceeded.
    pub fn try_request(self: &Arc<Self>, size: u64) -> Option<Vec<Block>> {
        let n = self.blocks_for(size);
        let mut st = self.state.lock();
        self.recompute(&mut st, false);
        if st.checked_out + n <= st.computed_max {
            Some(self.take(&mut st, n))
        } else {
            None
        }
    }

    /// Blocking request for enough blocks to hold `size` bytes.
    ///
    /// Waits for other holders to release blocks. Panics if the request
    /// cannot be met even with nothing checked out.
    pub async fn request(self: &Arc<Self>, size: u64) -> Vec<Block> {
        let n = self.blocks_for(size);
        loop {
            let released = self.released.notified();
            {
                let mut st = self.state.lock();
                self.recompute(&mut st, false);
                if st.checked_out + n <= st.computed_max {
                    return self.take(&mut st, n);
                }
                if st.checked_out == 0 {
                    self.recompute(&mut st, true);
                    if n <= st.computed_max {
                        return self.take(&mut st, n);
                    }
                    panic!(
                        "buffer pool out of memory: {} blocks requested, ceiling {} with none outstanding",
                        n, st.computed_max
                    );
                }
            }
            released.await;
        }
    }

    /// Requests blocks for `size` bytes, waiting only if `block` is set.
    pub async fn request_multiple(self: &Arc<Self>, size: u64, block: bool) -> Option<Vec<Block>> {
        if block {
            Some(self.request(size).await)
        } else {
            self.try_request(size)
        }
    }

    fn release(&self, data: Vec<u8>) {
        let mut st = self.state.lock();
        if st.checked_out == 0 {
            panic!("buffer pool released more blocks than it handed out");
        }
        st.checked_out -= 1;
        st.freed += 1;
        if (st.idle.len() as u64) + st.checked_out < st.computed_max {
            st.idle.push(data);
        }
        drop(st);
        self.released.notify_one();
    }
}

#[cfg(target_os = "linux")]
fn available_memory() -> u64 {
    // SAFETY: sysinfo only writes into the struct we pass it.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        warn!("sysinfo failed, assuming no spare memory");
        return 0;
    }
    let unit = u64::from(info.mem_unit.max(1));
    (info.freeram as u64 + info.bufferram as u64).saturating_mul(unit)
}

#[cfg(not(target_os = "linux"))]
fn available_memory() -> u64 {
    1 << 30
}

/// One pooled block, returned to its pool on drop.
pub struct Block {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_for_rounds_up() {
        let pool = BufferPool::new(10, Some(8));
        assert_eq!(pool.blocks_for(1), 1);
        assert_eq!(pool.blocks_for(10), 1);
        assert_eq!(pool.blocks_for(11), 2);
        assert_eq!(pool.blocks_for(0), 1);
    }

    #[test]
    fn test_try_request_is_all_or_nothing() {
        let pool = BufferPool::new(10, Some(3));
        let a = pool.try_request(20).unwrap();
        assert_eq!(a.len(), 2);
        assert!(pool.try_request(20).is_none());
        assert_eq!(pool.stats().checked_out, 2);
        let b = pool.try_request(5).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(pool.stats().checked_out, 3);
    }

    #[test]
    fn test_drop_returns_blocks() {
        let pool = BufferPool::new(10, Some(2));
        let blocks = pool.try_request(20).unwrap();
        drop(blocks);
        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.freed, 2);
        assert_eq!(stats.idle, 2);
    }

    #[test]
    fn test_block_has_full_size() {
        let pool = BufferPool::new(64, Some(1));
        let mut blocks = pool.try_request(1).unwrap();
        assert_eq!(blocks[0].len(), 64);
        blocks[0][0] = 7;
        assert_eq!(blocks[0][0], 7);
    }

    #[tokio::test]
    async fn test_blocking_request_waits_for_release() {
        let pool = BufferPool::new(10, Some(1));
        let held = pool.request(10).await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.request(10).await.len() })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_request_multiple_non_blocking() {
        let pool = BufferPool::new(10, Some(1));
        let _held = pool.request_multiple(10, true).await.unwrap();
        assert!(pool.request_multiple(10, false).await.is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "out of memory")]
    async fn test_unsatisfiable_request_with_nothing_outstanding_panics() {
        let pool = BufferPool::new(10, Some(2));
        let _ = pool.request(100).await;
    }
}
