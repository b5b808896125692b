//! The event type: the unit of work flowing from producers through the
//! staging buffers into AO queues.
//!
//! spec.md §3 describes two forms sharing storage: a *base* event
//! (`sig`, `poolId`, `refCtr`) and an *extended* event that additionally
//! carries timestamp/priority/flags/retry bookkeeping. REDESIGN FLAGS in
//! spec.md §9 call for replacing the source's struct-embedding
//! inheritance with a tagged variant; here that variant is `Event` itself,
//! and the "stable marker checkable without dereferencing fields only
//! valid on extended events" is just the `Option<Extended>` tag.
//!
//! Reference counting is the other redesign called out in §9: rather than
//! manual `incRef`/`gc` on a raw pointer, a dynamic event's shared payload
//! lives behind an `Arc`. Cloning an `Event::Dynamic` *is* `incRef`;
//! dropping the last clone runs [`Slot`]'s `Drop` impl, which is exactly
//! `gc` reaching `refCtr == 0`. This gives refcount closure structurally
//! instead of by convention — see DESIGN.md for the Open Question this
//! resolves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use crate::pool::PoolManager;

/// A signal identifier. Spec.md requires at least 16 bits; `u32` leaves
/// headroom for a generous reserved range.
pub type Signal = u32;

/// 1-based pool identifier; `0` is reserved to mark a static event.
pub type PoolId = u32;

/// Reserved, framework-private signals (spec.md §3: "reserved (entry/exit
/// /init/empty plus framework-private) and user signals").
pub const SIG_EMPTY: Signal = 0;
pub const SIG_ENTRY: Signal = 1;
pub const SIG_EXIT: Signal = 2;
pub const SIG_INIT: Signal = 3;
/// Framework-private sentinel an [`crate::ao::AoHandle`] posts to itself
/// to unwind its event loop — the "sentinel event its handler interprets"
/// described in spec.md §5 for AO shutdown, promoted to a reserved signal
/// so application HSMs don't have to invent their own.
pub const SIG_QUIT: Signal = 4;
/// First signal value available to application code, named after the
/// `Q_USER_SIG` convention in the original RT-Thread port.
pub const SIG_USER: Signal = 16;

/// Event flags (spec.md §3: `MERGEABLE`, `CRITICAL`, `NO_DROP`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags(u8);

impl EventFlags {
    pub const NONE: Self = Self(0);
    pub const MERGEABLE: Self = Self(1 << 0);
    pub const CRITICAL: Self = Self(1 << 1);
    pub const NO_DROP: Self = Self(1 << 2);

    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Extended-event payload: timestamp, priority, flags, and the retry
/// counter the dispatcher's backpressure policy mutates.
#[derive(Debug)]
pub struct Extended {
    pub timestamp: Instant,
    pub priority: u8,
    pub flags: EventFlags,
    retry_count: AtomicU8,
}

impl Extended {
    pub fn retry_count(&self) -> u8 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Increments the retry counter and returns the new value. Called
    /// only by the dispatcher's retry policy (spec.md §4.4).
    pub(crate) fn bump_retry(&self) -> u8 {
        self.retry_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct Slot {
    sig: Signal,
    pool_id: PoolId,
    extended: Option<Extended>,
    pool: Arc<PoolManager>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Runs exactly once, when the last `Arc<Slot>` clone (i.e. the
        // last outstanding reference) goes away — the Rust-native
        // realization of "refCtr == 0 at the moment of recycle".
        self.pool.recycle(self.pool_id);
    }
}

/// The event type producers allocate, post, and AOs dispatch.
///
/// `Static` events are caller-owned and never touch a pool; cloning one is
/// a plain bitwise copy with no refcount effect, matching spec.md's
/// invariant that static events have `refCtr == 0` forever.
#[derive(Clone)]
pub enum Event {
    Static { sig: Signal },
    Dynamic(Arc<Slot>),
}

impl Event {
    pub(crate) fn new_dynamic(
        sig: Signal,
        pool_id: PoolId,
        extended: Option<Extended>,
        pool: Arc<PoolManager>,
    ) -> Self {
        Event::Dynamic(Arc::new(Slot {
            sig,
            pool_id,
            extended,
            pool,
        }))
    }

    pub fn sig(&self) -> Signal {
        match self {
            Event::Static { sig } => *sig,
            Event::Dynamic(slot) => slot.sig,
        }
    }

    /// `0` for static events; the 1-based owning pool index otherwise.
    pub fn pool_id(&self) -> PoolId {
        match self {
            Event::Static { .. } => 0,
            Event::Dynamic(slot) => slot.pool_id,
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Event::Static { .. })
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Event::Dynamic(_))
    }

    /// `Some` iff this event was allocated as an extended event. Safe to
    /// call on any event — the marker is the variant tag, never a
    /// dereference of a field only valid on one form.
    pub fn as_extended(&self) -> Option<&Extended> {
        match self {
            Event::Static { .. } => None,
            Event::Dynamic(slot) => slot.extended.as_ref(),
        }
    }

    /// Current outstanding reference count. Always `0` for static events.
    /// For dynamic events this is the `Arc` strong count, which *is* this
    /// crate's `refCtr`.
    pub fn ref_count(&self) -> usize {
        match self {
            Event::Static { .. } => 0,
            Event::Dynamic(slot) => Arc::strong_count(slot),
        }
    }

    /// Explicit `incRef`: produces a new handle sharing the same
    /// underlying slot (for dynamic events) or a cheap copy (for static
    /// events). Use this at true fan-out points — e.g. pub/sub multicast —
    /// where one logical event must be held by more than one container at
    /// once; a plain move suffices everywhere else.
    pub fn inc_ref(&self) -> Self {
        self.clone()
    }

    /// Explicit `gc`: releases this handle. Named for parity with
    /// spec.md's external interface; equivalent to `drop(e)`.
    pub fn gc(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Static { sig } => f.debug_struct("Event::Static").field("sig", sig).finish(),
            Event::Dynamic(slot) => f
                .debug_struct("Event::Dynamic")
                .field("sig", &slot.sig)
                .field("pool_id", &slot.pool_id)
                .field("ref_count", &Arc::strong_count(slot))
                .field("extended", &slot.extended.is_some())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSpec;
    use crate::pool::PoolManager;

    fn test_pool() -> Arc<PoolManager> {
        PoolManager::new(vec![PoolSpec {
            block_size: 16,
            block_count: 4,
            margin: 0,
        }])
    }

    #[test]
    fn static_event_never_touches_pool() {
        let e = Event::Static { sig: 42 };
        assert_eq!(e.pool_id(), 0);
        assert_eq!(e.ref_count(), 0);
        let e2 = e.inc_ref();
        assert_eq!(e2.ref_count(), 0);
        drop(e);
        drop(e2);
    }

    #[test]
    fn dynamic_event_recycles_on_last_drop() {
        let pool = test_pool();
        let e = pool.alloc(8, 7, None).expect("alloc");
        assert_eq!(e.ref_count(), 1);
        assert_eq!(pool.stats(1).unwrap().free, 3);

        let e2 = e.inc_ref();
        assert_eq!(e.ref_count(), 2);

        drop(e);
        assert_eq!(pool.stats(1).unwrap().free, 3);
        drop(e2);
        assert_eq!(pool.stats(1).unwrap().free, 4);
    }

    #[test]
    fn extended_marker_is_variant_tag() {
        let pool = test_pool();
        let base = pool.alloc(8, 7, None).unwrap();
        assert!(base.as_extended().is_none());

        let ext = pool
            .alloc_extended(8, 7, 200, EventFlags::CRITICAL, None)
            .unwrap();
        assert!(ext.as_extended().is_some());
        assert_eq!(ext.as_extended().unwrap().priority, 200);
    }
}
