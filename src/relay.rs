//! ISR relay: lifts interrupt-context signal publication into task context
//! (spec.md §4.3), grounded directly on
//! `original_source/ports/rt-thread/qf_isr_relay.c`.
//!
//! ISR callers never touch the allocator, the pub/sub registry, or any AO
//! queue — all of which may be guarded by non-ISR-safe locks (spec.md §9).
//! They only ever push a fixed-size [`Descriptor`] into a lock-free ring and
//! flip a semaphore; a dedicated worker thread does the actual allocation
//! and publish on their behalf.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument, trace, warn};

use crate::config::RelayConfig;
use crate::event::{Event, PoolId, Signal};
use crate::pool::PoolManager;
use crate::pubsub::PubSub;

const BATCH_INIT_SIZE: usize = 8;
const BATCH_MAX_SIZE: usize = 16;
const BATCH_MIN_SIZE: usize = 1;

/// A compact descriptor copied into the relay rings — never an event
/// pointer, since ISRs must not touch the allocator (spec.md §4.3).
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub sig: Signal,
    pub pool_id: PoolId,
    pub param: u32,
    pub timestamp: Instant,
}

/// A binary semaphore: `release` is a no-op if already signaled, `wait`
/// blocks until signaled and clears the flag on wake.
struct Semaphore {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn release(&self) {
        let mut g = self.signaled.lock();
        if !*g {
            *g = true;
            self.cv.notify_one();
        }
    }

    fn wait(&self) {
        let mut g = self.signaled.lock();
        while !*g {
            self.cv.wait(&mut g);
        }
        *g = false;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StatsInner {
    primary_overflows: u64,
    overflow_overflows: u64,
    events_lost: u64,
    events_processed: u64,
    relay_wakeups: u64,
    max_batch_size: usize,
    max_process_time: Duration,
}

/// Snapshot of relay statistics (spec.md §4.3: "captured under a separate
/// mutex held only for stat updates, never across allocation or publish").
/// Field set mirrors `original_source/ports/rt-thread/qf_isr_relay.h`'s
/// `QF_ISRStats`.
#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub primary_overflows: u64,
    pub overflow_overflows: u64,
    pub events_lost: u64,
    pub events_processed: u64,
    pub relay_wakeups: u64,
    pub max_batch_size: usize,
    pub max_process_time: Duration,
    pub current_batch_size: usize,
}

pub struct IsrRelay {
    primary: ArrayQueue<Descriptor>,
    overflow: ArrayQueue<Descriptor>,
    overflow_active: AtomicBool,
    semaphore: Semaphore,
    stats: Mutex<StatsInner>,
    events_lost: AtomicU64,
    batch_size: Mutex<usize>,
    grow_threshold: Duration,
    shrink_threshold: Duration,
    default_alloc_size: usize,
}

impl IsrRelay {
    /// Spawns the relay worker thread and returns the shared handle ISR
    /// callers and the worker both hold.
    pub fn start(
        config: RelayConfig,
        pool: Arc<PoolManager>,
        pubsub: Arc<PubSub>,
        default_alloc_size: usize,
    ) -> Arc<Self> {
        let relay = Arc::new(IsrRelay {
            primary: ArrayQueue::new(config.main_buffer_size),
            overflow: ArrayQueue::new(config.overflow_buffer_size),
            overflow_active: AtomicBool::new(false),
            semaphore: Semaphore::new(),
            stats: Mutex::new(StatsInner::default()),
            events_lost: AtomicU64::new(0),
            batch_size: Mutex::new(BATCH_INIT_SIZE),
            grow_threshold: config.batch_grow_threshold,
            shrink_threshold: config.batch_shrink_threshold,
            default_alloc_size,
        });

        let worker_relay = relay.clone();
        std::thread::Builder::new()
            .name("isr-relay".into())
            .spawn(move || worker_relay.run(pool, pubsub))
            .expect("failed to spawn isr relay worker");

        relay
    }

    /// ISR-callable. Writes a descriptor into the primary ring, falling
    /// back to overflow, and releases the semaphore exactly once on
    /// success. Total loss increments `events_lost` and does NOT release
    /// the semaphore — the worker has nothing to do in that case, matching
    /// `qf_isr_relay.c`'s `notify_needed` pattern.
    pub fn relay_publish(&self, sig: Signal, pool_id: PoolId, param: u32) {
        let descriptor = Descriptor {
            sig,
            pool_id,
            param,
            timestamp: Instant::now(),
        };

        if self.primary.push(descriptor).is_ok() {
            self.semaphore.release();
            return;
        }

        if self.overflow.push(descriptor).is_ok() {
            self.overflow_active.store(true, Ordering::Relaxed);
            let mut stats = self.stats.lock();
            stats.primary_overflows += 1;
            drop(stats);
            self.semaphore.release();
            return;
        }

        self.events_lost.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.stats.lock();
        stats.overflow_overflows += 1;
        stats.events_lost += 1;
        warn!(sig, "both relay rings full, descriptor lost");
    }

    pub fn stats(&self) -> RelayStats {
        let inner = *self.stats.lock();
        RelayStats {
            primary_overflows: inner.primary_overflows,
            overflow_overflows: inner.overflow_overflows,
            events_lost: self.events_lost.load(Ordering::Relaxed),
            events_processed: inner.events_processed,
            relay_wakeups: inner.relay_wakeups,
            max_batch_size: inner.max_batch_size,
            max_process_time: inner.max_process_time,
            current_batch_size: *self.batch_size.lock(),
        }
    }

    #[instrument(skip(self, pool, pubsub))]
    fn run(&self, pool: Arc<PoolManager>, pubsub: Arc<PubSub>) {
        loop {
            self.semaphore.wait();
            {
                let mut stats = self.stats.lock();
                stats.relay_wakeups += 1;
            }
            let started = Instant::now();
            let batch = *self.batch_size.lock();
            let mut drained = 0usize;

            // Overflow first, then primary (spec.md §4.3 priority order).
            drained += self.drain_ring(&self.overflow, batch, &pool, &pubsub);
            if self.overflow.is_empty() {
                self.overflow_active.store(false, Ordering::Relaxed);
            }
            let remaining = batch.saturating_sub(drained);
            if remaining > 0 {
                drained += self.drain_ring(&self.primary, remaining, &pool, &pubsub);
            }

            let elapsed = started.elapsed();
            trace!(drained, batch, ?elapsed, "relay cycle complete");
            {
                let mut stats = self.stats.lock();
                if elapsed > stats.max_process_time {
                    stats.max_process_time = elapsed;
                }
            }
            self.adapt_batch_size(elapsed);
        }
    }

    fn drain_ring(
        &self,
        ring: &ArrayQueue<Descriptor>,
        max: usize,
        pool: &Arc<PoolManager>,
        pubsub: &Arc<PubSub>,
    ) -> usize {
        let mut count = 0;
        while count < max {
            let Some(descriptor) = ring.pop() else {
                break;
            };
            count += 1;
            match pool.alloc(self.default_alloc_size, descriptor.sig, None) {
                Some(event) => {
                    pubsub.publish(event);
                    let mut stats = self.stats.lock();
                    stats.events_processed += 1;
                }
                None => {
                    self.events_lost.fetch_add(1, Ordering::Relaxed);
                    warn!(sig = descriptor.sig, "pool exhausted, relayed descriptor dropped");
                }
            }
        }
        count
    }

    /// Grows or shrinks the batch size by one step per cycle, matching
    /// `qf_isr_relay.c`'s linear ±1 adjustment rather than an exponential one.
    fn adapt_batch_size(&self, elapsed: Duration) {
        let mut batch = self.batch_size.lock();
        if elapsed > self.grow_threshold {
            *batch = (*batch + 1).min(BATCH_MAX_SIZE);
        } else if elapsed < self.shrink_threshold {
            *batch = batch.saturating_sub(1).max(BATCH_MIN_SIZE);
        }
        let new_batch = *batch;
        drop(batch);
        let mut stats = self.stats.lock();
        stats.max_batch_size = stats.max_batch_size.max(new_batch);
        debug!(new_batch, "adapted relay batch size");
    }
}
