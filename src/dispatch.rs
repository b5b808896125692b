//! Priority-partitioned dispatcher (spec.md §4.4): the hardest piece, and
//! the one the REDESIGN FLAGS call out for atomic strategy swapping instead
//! of a raw function-pointer struct. `arc_swap::ArcSwap` gives single-word
//! atomic pointer replacement with lock-free reads, the same crate the
//! teacher reaches for around its own dispatcher's priority table.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument, trace, warn};

use crate::ao::AoHandle;
use crate::error::FrameworkError;
use crate::event::{Event, EventFlags};

/// Fixed backoff before re-staging a retryable event. Not specified by
/// spec.md; added so a NO_DROP event's retry loop can't exhaust
/// `MAX_RETRY` faster than the target AO's own thread can make progress
/// once whatever was blocking it clears.
const RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// The three staging levels (spec.md §3). Ordinal order is drain order:
/// HIGH fully drained and processed before NORMAL, NORMAL before LOW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrioLevel {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl PrioLevel {
    const ALL: [PrioLevel; 3] = [PrioLevel::High, PrioLevel::Normal, PrioLevel::Low];

    fn idx(self) -> usize {
        self as usize
    }
}

/// The four pluggable predicates spec.md §3 calls a "strategy".
pub trait Strategy: Send + Sync {
    fn classify_priority(&self, e: &Event) -> PrioLevel;
    fn should_merge(&self, prev: &Event, next: &Event) -> bool;
    fn should_drop(&self, e: &Event, target: &AoHandle) -> bool;
    fn compare_priority(&self, a: &Event, b: &Event) -> CmpOrdering;
}

/// Never drops, merges by equal signal, classifies everything `NORMAL`.
#[derive(Debug, Default)]
pub struct DefaultStrategy;

impl Strategy for DefaultStrategy {
    fn classify_priority(&self, _e: &Event) -> PrioLevel {
        PrioLevel::Normal
    }

    fn should_merge(&self, prev: &Event, next: &Event) -> bool {
        prev.sig() == next.sig()
    }

    fn should_drop(&self, _e: &Event, _target: &AoHandle) -> bool {
        false
    }

    fn compare_priority(&self, a: &Event, b: &Event) -> CmpOrdering {
        a.sig().cmp(&b.sig())
    }
}

/// Merges only mergeable-flagged extended events, drops non-critical
/// events under queue pressure, classifies by flag and explicit priority.
#[derive(Debug, Default)]
pub struct HighPerfStrategy;

impl Strategy for HighPerfStrategy {
    fn classify_priority(&self, e: &Event) -> PrioLevel {
        match e.as_extended() {
            Some(ext) if ext.flags.contains(EventFlags::CRITICAL) => PrioLevel::High,
            Some(ext) if ext.priority > 128 => PrioLevel::High,
            Some(ext) if ext.priority > 64 => PrioLevel::Normal,
            Some(_) => PrioLevel::Low,
            None => PrioLevel::Normal,
        }
    }

    fn should_merge(&self, prev: &Event, next: &Event) -> bool {
        match (prev.as_extended(), next.as_extended()) {
            (Some(a), Some(b)) => {
                prev.sig() == next.sig()
                    && a.flags.contains(EventFlags::MERGEABLE)
                    && b.flags.contains(EventFlags::MERGEABLE)
            }
            _ => false,
        }
    }

    fn should_drop(&self, e: &Event, target: &AoHandle) -> bool {
        match e.as_extended() {
            Some(ext) if !ext.flags.contains(EventFlags::CRITICAL) => {
                let capacity = target.queue().capacity() as f64;
                let count = target.queue().len() as f64;
                capacity > 0.0 && count > 0.8 * capacity
            }
            _ => false,
        }
    }

    fn compare_priority(&self, a: &Event, b: &Event) -> CmpOrdering {
        match (a.as_extended(), b.as_extended()) {
            (Some(ea), Some(eb)) => ea.priority.cmp(&eb.priority),
            _ => a.sig().cmp(&b.sig()),
        }
    }
}

struct StagedItem {
    event: Event,
    target: Arc<AoHandle>,
    #[allow(dead_code)]
    timestamp: Instant,
}

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

/// Monotonic counters (spec.md §3). All increments are relaxed atomics;
/// `reset` is the only operation expected from task context exclusively.
#[derive(Default)]
pub struct DispatcherMetrics {
    dispatch_cycles: AtomicU64,
    events_processed: AtomicU64,
    events_merged: AtomicU64,
    events_dropped: AtomicU64,
    events_retried: AtomicU64,
    max_batch_size: AtomicUsize,
    total_batch_size: AtomicU64,
    batch_count: AtomicU64,
    max_queue_depth: AtomicUsize,
    post_failures: AtomicU64,
    staging_overflows: [AtomicU64; 3],
}

/// Point-in-time copy of [`DispatcherMetrics`] (spec.md §6 `get_metrics`).
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub dispatch_cycles: u64,
    pub events_processed: u64,
    pub events_merged: u64,
    pub events_dropped: u64,
    pub events_retried: u64,
    pub max_batch_size: usize,
    pub avg_batch_size: f64,
    pub max_queue_depth: usize,
    pub post_failures: u64,
    pub staging_overflows: [u64; 3],
}

impl DispatcherMetrics {
    fn record_batch(&self, level: PrioLevel, size: usize) {
        self.max_batch_size.fetch_max(size, Ordering::Relaxed);
        self.total_batch_size
            .fetch_add(size as u64, Ordering::Relaxed);
        self.batch_count.fetch_add(1, Ordering::Relaxed);
        let _ = level;
    }

    fn record_overflow(&self, level: PrioLevel) {
        self.staging_overflows[level.idx()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_queue_depth(&self, depth: usize) {
        self.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let batch_count = self.batch_count.load(Ordering::Relaxed);
        let total = self.total_batch_size.load(Ordering::Relaxed);
        MetricsSnapshot {
            dispatch_cycles: self.dispatch_cycles.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_merged: self.events_merged.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_retried: self.events_retried.load(Ordering::Relaxed),
            max_batch_size: self.max_batch_size.load(Ordering::Relaxed),
            avg_batch_size: if batch_count == 0 {
                0.0
            } else {
                total as f64 / batch_count as f64
            },
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            post_failures: self.post_failures.load(Ordering::Relaxed),
            staging_overflows: [
                self.staging_overflows[0].load(Ordering::Relaxed),
                self.staging_overflows[1].load(Ordering::Relaxed),
                self.staging_overflows[2].load(Ordering::Relaxed),
            ],
        }
    }

    pub fn reset(&self) {
        self.dispatch_cycles.store(0, Ordering::Relaxed);
        self.events_processed.store(0, Ordering::Relaxed);
        self.events_merged.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        self.events_retried.store(0, Ordering::Relaxed);
        self.max_batch_size.store(0, Ordering::Relaxed);
        self.total_batch_size.store(0, Ordering::Relaxed);
        self.batch_count.store(0, Ordering::Relaxed);
        self.max_queue_depth.store(0, Ordering::Relaxed);
        self.post_failures.store(0, Ordering::Relaxed);
        for c in &self.staging_overflows {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// The dispatcher: three staging rings, a drain thread, and a hot-swappable
/// [`Strategy`].
///
/// REDESIGN FLAGS note (spec.md §9): the source's staging insert plus the
/// underlying post both call `incRef`, leaving the net outstanding count
/// ambiguous. Here staging never clones — `stage` *moves* the caller's
/// `Event` into the ring, and batch processing *moves* it again into the
/// target queue on success. One container holds it at a time, by
/// construction, with no incRef/decRef bookkeeping required.
pub struct Dispatcher {
    staging: [ArrayQueue<StagedItem>; 3],
    semaphore: Semaphore,
    strategy: ArcSwap<Box<dyn Strategy>>,
    metrics: DispatcherMetrics,
    enabled: AtomicBool,
    max_retry: u8,
}

impl Dispatcher {
    pub fn new(staging_size: usize, max_retry: u8, strategy: Box<dyn Strategy>) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher {
            staging: [
                ArrayQueue::new(staging_size),
                ArrayQueue::new(staging_size),
                ArrayQueue::new(staging_size),
            ],
            semaphore: Semaphore::new(),
            strategy: ArcSwap::from_pointee(strategy),
            metrics: DispatcherMetrics::default(),
            enabled: AtomicBool::new(true),
            max_retry,
        });
        let worker = dispatcher.clone();
        std::thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || worker.run())
            .expect("failed to spawn dispatcher thread");
        dispatcher
    }

    pub fn set_strategy(&self, strategy: Box<dyn Strategy>) {
        self.strategy.store(Arc::new(strategy));
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Belt-and-suspenders wakeup (spec.md §4.4 "idle hook"): call from an
    /// idle loop to guard against a coalesced semaphore signal.
    pub fn kick_if_pending(&self) {
        if self.staging.iter().any(|ring| !ring.is_empty()) {
            self.semaphore.release();
        }
    }

    /// Stages `e` for delivery to `target`. On success the dispatcher owns
    /// `e` until it is merged away, dropped, or delivered. On staging
    /// overflow, `e` is handed back — the caller owns cleanup, per
    /// spec.md §4.4.
    pub fn stage(&self, target: Arc<AoHandle>, e: Event) -> std::result::Result<(), Event> {
        let level = self.strategy.load().classify_priority(&e);
        self.metrics.record_queue_depth(target.queue().len());
        let item = StagedItem {
            event: e,
            target,
            timestamp: Instant::now(),
        };
        match self.staging[level.idx()].push(item) {
            Ok(()) => {
                self.semaphore.release();
                Ok(())
            }
            Err(item) => {
                self.metrics.record_overflow(level);
                warn!("{}", FrameworkError::StagingOverflow { level });
                Err(item.event)
            }
        }
    }

    #[instrument(skip(self))]
    fn run(&self) {
        loop {
            self.semaphore.wait();
            self.metrics.dispatch_cycles.fetch_add(1, Ordering::Relaxed);
            if !self.enabled.load(Ordering::Relaxed) {
                trace!("dispatcher disabled, skipping cycle");
                continue;
            }
            for level in PrioLevel::ALL {
                let batch = self.drain(level);
                if !batch.is_empty() {
                    trace!(?level, size = batch.len(), "draining staging level");
                    self.metrics.record_batch(level, batch.len());
                    self.process_batch(level, batch);
                }
            }
        }
    }

    fn drain(&self, level: PrioLevel) -> Vec<Option<StagedItem>> {
        let ring = &self.staging[level.idx()];
        let mut batch = Vec::new();
        while let Some(item) = ring.pop() {
            batch.push(Some(item));
        }
        batch
    }

    fn process_batch(&self, level: PrioLevel, mut batch: Vec<Option<StagedItem>>) {
        let strategy = self.strategy.load();
        for i in 0..batch.len() {
            let Some(item) = batch[i].take() else {
                continue;
            };

            if strategy.should_drop(&item.event, &item.target) {
                self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(sig = item.event.sig(), "strategy dropped event under load");
                item.event.gc();
                continue;
            }

            let merge_target = batch[i + 1..]
                .iter()
                .find(|slot| {
                    slot.as_ref().is_some_and(|later| {
                        later.target.prio() == item.target.prio()
                            && strategy.should_merge(&item.event, &later.event)
                    })
                })
                .is_some();

            if merge_target {
                self.metrics.events_merged.fetch_add(1, Ordering::Relaxed);
                debug!(sig = item.event.sig(), "merged duplicate event");
                item.event.gc();
                continue;
            }

            match item.target.post_fifo(item.event, 1) {
                Ok(()) => {
                    self.metrics
                        .events_processed
                        .fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_queue_depth(item.target.queue().len());
                }
                Err(e) => self.retry_or_drop(level, item.target, e),
            }
        }
    }

    fn retry_or_drop(&self, level: PrioLevel, target: Arc<AoHandle>, e: Event) {
        let retryable = e.as_extended().is_some_and(|ext| {
            ext.flags.contains(EventFlags::NO_DROP) && ext.retry_count() < self.max_retry
        });

        if retryable {
            let retry_count = e.as_extended().map_or(0, |ext| ext.bump_retry());
            self.metrics.events_retried.fetch_add(1, Ordering::Relaxed);
            warn!(sig = e.sig(), retry_count, "target queue full, retrying");
            std::thread::sleep(RETRY_BACKOFF);
            let item = StagedItem {
                event: e,
                target,
                timestamp: Instant::now(),
            };
            if self.staging[PrioLevel::Low.idx()].push(item).is_err() {
                // Re-staging into LOW lost the race against capacity; this
                // degrades to a drop rather than retrying forever.
                self.metrics.record_overflow(PrioLevel::Low);
            } else {
                self.semaphore.release();
            }
            let _ = level;
        } else {
            self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.post_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(ext) = e.as_extended() {
                warn!(
                    "{}",
                    FrameworkError::RetryExhausted { retries: ext.retry_count() }
                );
            }
            e.gc();
        }
    }
}
