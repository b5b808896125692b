//! Pub/Sub registry: `signal -> set of AOs` (spec.md §4.5).
//!
//! REDESIGN FLAGS (spec.md §9) retires the global subscriber table in favor
//! of an owned registry; [`DashMap`]/[`DashSet`] give the O(1) amortized
//! subscribe/unsubscribe spec.md asks for without a single coarse lock,
//! the same concurrent-map crate the teacher reaches for at its
//! controller/state boundaries.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::{debug, instrument, trace, warn};

use crate::ao::AoHandle;
use crate::error::{FrameworkError, Result};
use crate::event::{Event, Signal};

/// Outcome of a [`PubSub::publish`] call: which subscribers received the
/// event and which did not (queue full at post time).
#[derive(Debug, Clone, Default)]
pub struct PublishSummary {
    pub attempted: usize,
    pub delivered: usize,
    pub failed_aos: Vec<u8>,
}

impl PublishSummary {
    pub fn all_delivered(&self) -> bool {
        self.failed_aos.is_empty()
    }
}

/// The registry itself. AOs are identified by their priority, which
/// spec.md §4.2 requires to be unique in `[1, MAX_ACTIVE]`.
pub struct PubSub {
    max_pub_sig: u32,
    subscribers: DashMap<Signal, DashSet<u8>>,
    aos: DashMap<u8, Arc<AoHandle>>,
}

impl PubSub {
    pub fn new(max_pub_sig: u32) -> Self {
        PubSub {
            max_pub_sig,
            subscribers: DashMap::new(),
            aos: DashMap::new(),
        }
    }

    fn check_sig(&self, sig: Signal) -> Result<()> {
        if sig >= self.max_pub_sig {
            return Err(FrameworkError::SignalOutOfRange(sig));
        }
        Ok(())
    }

    /// Idempotent: subscribing twice has the same effect as once.
    #[instrument(skip(self, ao), fields(prio = ao.prio()))]
    pub fn subscribe(&self, ao: Arc<AoHandle>, sig: Signal) -> Result<()> {
        self.check_sig(sig)?;
        let prio = ao.prio();
        self.aos.entry(prio).or_insert(ao);
        self.subscribers.entry(sig).or_default().insert(prio);
        debug!("subscribed");
        Ok(())
    }

    /// Idempotent: unsubscribing an AO that was never subscribed is a no-op.
    #[instrument(skip(self))]
    pub fn unsubscribe(&self, ao_prio: u8, sig: Signal) -> Result<()> {
        self.check_sig(sig)?;
        if let Some(set) = self.subscribers.get(&sig) {
            set.remove(&ao_prio);
        }
        debug!("unsubscribed");
        Ok(())
    }

    /// Fans `e` out to every current subscriber of `e.sig()`.
    ///
    /// Refcount discipline (spec.md §9: "each container holds exactly one
    /// count"): every subscriber gets its own `inc_ref`'d clone; a clone
    /// that fails to post is dropped immediately. By the time this
    /// function returns, the caller's own handle to `e` has also been
    /// consumed, so the net reference count left outstanding equals
    /// exactly the number of successful deliveries.
    #[instrument(skip(self, e), fields(sig = e.sig()))]
    pub fn publish(&self, e: Event) -> PublishSummary {
        let mut summary = PublishSummary::default();
        let Some(set) = self.subscribers.get(&e.sig()) else {
            trace!("no subscribers");
            return summary;
        };
        let targets: Vec<u8> = set.iter().map(|r| *r).collect();
        drop(set);

        summary.attempted = targets.len();
        for prio in targets {
            let Some(ao) = self.aos.get(&prio).map(|r| r.clone()) else {
                continue;
            };
            let handle = e.inc_ref();
            match ao.post_fifo(handle, 0) {
                Ok(()) => summary.delivered += 1,
                Err(dropped) => {
                    dropped.gc();
                    warn!(prio, "subscriber queue full, delivery failed");
                    summary.failed_aos.push(prio);
                }
            }
        }
        debug!(delivered = summary.delivered, attempted = summary.attempted, "publish complete");
        summary
    }
}
