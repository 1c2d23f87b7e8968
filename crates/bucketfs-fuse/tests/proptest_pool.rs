//! Property-based tests for the buffer pool.

use std::sync::Arc;

use bucketfs_fuse::pool::{Block, BufferPool};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Acquire(u64),
    Release(usize),
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..200u64).prop_map(Op::Acquire),
        (0usize..16usize).prop_map(Op::Release),
    ]
}

proptest! {
    /// Checked-out blocks never exceed the ceiling and always equal
    /// acquisitions minus frees.
    #[test]
    fn test_pool_conservation(
        cap in 1u64..32u64,
        ops in proptest::collection::vec(any_op(), 1..64),
    ) {
        let pool: Arc<BufferPool> = BufferPool::new(16, Some(cap));
        let mut held: Vec<Vec<Block>> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire(size) => {
                    if let Some(blocks) = pool.try_request(size) {
                        prop_assert_eq!(blocks.len() as u64, pool.blocks_for(size));
                        held.push(blocks);
                    }
                }
                Op::Release(i) => {
                    if !held.is_empty() {
                        let idx = i % held.len();
                        held.swap_remove(idx);
                    }
                }
            }
            let stats = pool.stats();
            let outstanding: u64 = held.iter().map(|b| b.len() as u64).sum();
            prop_assert!(stats.checked_out <= stats.computed_max);
            prop_assert_eq!(stats.checked_out, stats.acquired - stats.freed);
            prop_assert_eq!(stats.checked_out, outstanding);
        }

        drop(held);
        prop_assert_eq!(pool.stats().checked_out, 0);
    }

    /// A request the ceiling can hold succeeds on an idle pool.
    #[test]
    fn test_idle_pool_grants_fitting_request(cap in 1u64..32u64, blocks in 1u64..32u64) {
        let pool = BufferPool::new(16, Some(cap));
        let got = pool.try_request(blocks * 16);
        prop_assert_eq!(got.is_some(), blocks <= pool.stats().computed_max);
    }
}
