//! Fixed-size block pool manager (spec.md §4.1).
//!
//! The original RT-Thread port reserves real memory blocks per pool; here
//! the "block" is purely an accounting unit (`free`/`used`/`peak` counts)
//! guarded by a short critical section, while the event payload itself is
//! an ordinary heap allocation owned by an `Arc`. This is a deliberate
//! simplification the REDESIGN FLAGS in spec.md §9 invite: the pool's job
//! — bounding concurrent outstanding allocations per size class and
//! honoring margins — survives; the manual fixed-block memory layout does
//! not need to, since Rust's allocator already gives safe per-event
//! storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{instrument, trace, warn};

use crate::config::PoolSpec;
use crate::error::{FrameworkError, Result};
use crate::event::{Event, EventFlags, Extended, PoolId, Signal};

#[derive(Debug, Clone, Copy)]
struct PoolState {
    free: usize,
    used: usize,
    peak: usize,
}

/// Snapshot of one pool's accounting (spec.md §4.1 `stats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub free: usize,
    pub used: usize,
    pub peak: usize,
    pub block_size: usize,
    pub block_count: usize,
}

pub struct PoolManager {
    /// Sorted ascending by block size at registration time; never
    /// reordered afterward (spec.md: "pools are sorted once at
    /// registration time; later registrations append").
    specs: Vec<PoolSpec>,
    inner: Mutex<Vec<PoolState>>,
    alloc_failures: AtomicU64,
}

impl PoolManager {
    pub fn new(mut specs: Vec<PoolSpec>) -> Arc<Self> {
        specs.sort_by_key(|s| s.block_size);
        let states = specs
            .iter()
            .map(|s| PoolState {
                free: s.block_count,
                used: 0,
                peak: 0,
            })
            .collect();
        Arc::new(PoolManager {
            specs,
            inner: Mutex::new(states),
            alloc_failures: AtomicU64::new(0),
        })
    }

    /// First-fit pool selection honoring margin, with fallback to the
    /// next larger pool (spec.md §4.1 `alloc`). Returns `None` iff every
    /// candidate pool is below its effective margin.
    fn reserve_block(&self, size: usize, margin_override: Option<usize>) -> Option<PoolId> {
        let start = self.specs.iter().position(|s| s.block_size >= size)?;
        let mut inner = self.inner.lock();
        for idx in start..self.specs.len() {
            // An override can only raise the effective margin, never lower
            // the pool's own configured floor below what it was registered
            // with.
            let margin = margin_override.map_or(self.specs[idx].margin, |m| m.max(self.specs[idx].margin));
            if inner[idx].free > margin {
                inner[idx].free -= 1;
                inner[idx].used += 1;
                inner[idx].peak = inner[idx].peak.max(inner[idx].used);
                return Some((idx + 1) as PoolId);
            }
        }
        None
    }

    #[instrument(skip(self), fields(sig))]
    pub fn alloc(self: &Arc<Self>, size: usize, sig: Signal, margin_override: Option<usize>) -> Option<Event> {
        match self.reserve_block(size, margin_override) {
            Some(pool_id) => {
                trace!(pool_id, "allocated block");
                Some(Event::new_dynamic(sig, pool_id, None, self.clone()))
            }
            None => {
                self.alloc_failures.fetch_add(1, Ordering::Relaxed);
                warn!("{}", FrameworkError::PoolExhausted { requested: size });
                None
            }
        }
    }

    /// Allocates an extended event. `sig != 0` is required for a
    /// well-formed extended event (spec.md §3).
    #[instrument(skip(self), fields(sig, priority))]
    pub fn alloc_extended(
        self: &Arc<Self>,
        size: usize,
        sig: Signal,
        priority: u8,
        flags: EventFlags,
        margin_override: Option<usize>,
    ) -> Result<Option<Event>> {
        if sig == 0 {
            return Err(FrameworkError::ContractViolation(
                "extended event requires sig != 0",
            ));
        }
        match self.reserve_block(size, margin_override) {
            Some(pool_id) => {
                let extended = Extended {
                    timestamp: std::time::Instant::now(),
                    priority,
                    flags,
                    retry_count: Default::default(),
                };
                trace!(pool_id, "allocated extended block");
                Ok(Some(Event::new_dynamic(
                    sig,
                    pool_id,
                    Some(extended),
                    self.clone(),
                )))
            }
            None => {
                self.alloc_failures.fetch_add(1, Ordering::Relaxed);
                warn!("{}", FrameworkError::PoolExhausted { requested: size });
                Ok(None)
            }
        }
    }

    /// Called from `Slot::drop` exactly once, when the last outstanding
    /// reference to a dynamic event goes away.
    pub(crate) fn recycle(&self, pool_id: PoolId) {
        let idx = pool_id.checked_sub(1).expect("pool_id is 1-based") as usize;
        let mut inner = self.inner.lock();
        debug_assert!(
            idx < inner.len(),
            "gc on unregistered pool id is a contract violation"
        );
        if let Some(state) = inner.get_mut(idx) {
            state.used -= 1;
            state.free += 1;
        }
        trace!(pool_id, "recycled block");
    }

    pub fn stats(&self, pool_id: PoolId) -> Option<PoolStats> {
        let idx = pool_id.checked_sub(1)? as usize;
        let inner = self.inner.lock();
        let state = inner.get(idx)?;
        let spec = self.specs.get(idx)?;
        Some(PoolStats {
            free: state.free,
            used: state.used,
            peak: state.peak,
            block_size: spec.block_size,
            block_count: spec.block_count,
        })
    }

    pub fn alloc_failures(&self) -> u64 {
        self.alloc_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> Arc<PoolManager> {
        PoolManager::new(vec![
            PoolSpec {
                block_size: 16,
                block_count: 4,
                margin: 1,
            },
            PoolSpec {
                block_size: 64,
                block_count: 2,
                margin: 0,
            },
        ])
    }

    #[test]
    fn margin_respected_then_falls_back() {
        let pool = pools();
        // Drain the small pool down to its margin (margin=1, capacity=4):
        // 3 successful allocs should leave exactly 1 free, at which point
        // the 4th request must fall back to the larger pool.
        let a = pool.alloc(10, 1, None).unwrap();
        let b = pool.alloc(10, 2, None).unwrap();
        let c = pool.alloc(10, 3, None).unwrap();
        assert_eq!(pool.stats(1).unwrap().free, 1);

        let d = pool.alloc(10, 4, None).unwrap();
        assert_eq!(d.pool_id(), 2, "must fall back to the larger pool");
        assert_eq!(pool.stats(1).unwrap().free, 1, "small pool untouched");
        assert_eq!(pool.stats(2).unwrap().free, 1);

        drop((a, b, c, d));
        assert_eq!(pool.stats(1).unwrap().free, 4);
        assert_eq!(pool.stats(2).unwrap().free, 2);
    }

    #[test]
    fn exact_margin_boundary() {
        let pool = PoolManager::new(vec![PoolSpec {
            block_size: 16,
            block_count: 1,
            margin: 1,
        }]);
        // One free block, margin == 1: free - 1 < margin -> must fail.
        assert!(pool.alloc(10, 99, None).is_none());

        let pool0 = PoolManager::new(vec![PoolSpec {
            block_size: 16,
            block_count: 1,
            margin: 0,
        }]);
        // Same setup but margin == 0: must succeed.
        assert!(pool0.alloc(10, 99, None).is_some());
    }

    #[test]
    fn alloc_then_gc_returns_free_to_prior_value_without_changing_peak() {
        let pool = pools();
        let before = pool.stats(1).unwrap();
        let e = pool.alloc(10, 1, None).unwrap();
        drop(e);
        let after = pool.stats(1).unwrap();
        assert_eq!(before.free, after.free);
        assert_eq!(before.peak, after.peak);
    }

    #[test]
    fn exhaustion_increments_failure_counter_without_faulting() {
        let pool = PoolManager::new(vec![PoolSpec {
            block_size: 16,
            block_count: 1,
            margin: 0,
        }]);
        let _held = pool.alloc(10, 1, None).unwrap();
        assert!(pool.alloc(10, 2, None).is_none());
        assert_eq!(pool.alloc_failures(), 1);
    }
}
