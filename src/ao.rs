//! Active Object queue and event loop (spec.md §4.2).
//!
//! REDESIGN FLAGS (spec.md §9) calls for replacing `QActive`-as-first-field
//! struct embedding with composition: application state machines implement
//! [`Hsm`] and are handed to [`ao_start`], which owns the queue, the thread,
//! and the run-to-completion loop around them. There is still no HSM engine
//! here — `Hsm::dispatch` is the "opaque callee" spec.md §9 explicitly keeps
//! out of scope.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument, trace, warn};

use crate::error::{FrameworkError, Result};
use crate::event::{Event, SIG_QUIT};

/// A hierarchical state machine an active object drives. Treated as an
/// opaque callee per spec.md §6: `init` runs the initial transition,
/// `dispatch` runs one complete run-to-completion step.
pub trait Hsm: Send {
    fn init(&mut self, par: Option<&Event>);
    fn dispatch(&mut self, e: &Event);
}

struct QueueState {
    items: VecDeque<Event>,
}

/// A bounded FIFO-with-LIFO-urgent event queue (spec.md §4.2). Holds
/// events, never copies them — an `Event` is itself already a cheap
/// handle (a tag or an `Arc`).
pub struct Queue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    capacity: usize,
}

impl Queue {
    pub fn new(capacity: usize) -> Self {
        Queue {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `post_fifo`: fails (returning the event back to the caller rather
    /// than silently dropping it) iff `count >= capacity - margin`.
    pub fn post_fifo(&self, e: Event, margin: usize) -> std::result::Result<(), Event> {
        let mut state = self.state.lock();
        let threshold = self.capacity.saturating_sub(margin);
        if state.items.len() >= threshold {
            return Err(e);
        }
        state.items.push_back(e);
        self.not_empty.notify_one();
        Ok(())
    }

    /// `post_lifo`: urgent, unbounded-margin insertion at the head.
    /// Callers guarantee capacity, per spec.md §4.2; a caller that
    /// doesn't is a contract violation, not a recoverable condition.
    pub fn post_lifo(&self, e: Event) -> Result<()> {
        let mut state = self.state.lock();
        if state.items.len() >= self.capacity {
            return Err(FrameworkError::ContractViolation(
                "post_lifo on a full queue: caller must guarantee capacity",
            ));
        }
        state.items.push_front(e);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an event is available, then dequeues it.
    pub fn get(&self) -> Event {
        let mut state = self.state.lock();
        loop {
            if let Some(e) = state.items.pop_front() {
                return e;
            }
            self.not_empty.wait(&mut state);
        }
    }
}

/// Construction parameters for an active object (spec.md §4.2 identity:
/// priority, optional preemption threshold, queue capacity, name attr).
#[derive(Debug, Clone)]
pub struct ActiveObjectConfig {
    pub prio: u8,
    pub pthre: u8,
    pub queue_capacity: usize,
    pub name: String,
}

impl ActiveObjectConfig {
    pub fn new(prio: u8, queue_capacity: usize, name: impl Into<String>) -> Self {
        ActiveObjectConfig {
            prio,
            pthre: prio,
            queue_capacity,
            name: name.into(),
        }
    }
}

/// A running active object: its queue, identity, and event-loop thread.
pub struct AoHandle {
    prio: u8,
    pthre: u8,
    name: String,
    queue: Arc<Queue>,
    thread: Option<JoinHandle<()>>,
}

impl AoHandle {
    pub fn prio(&self) -> u8 {
        self.prio
    }

    pub fn pthre(&self) -> u8 {
        self.pthre
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn post_fifo(&self, e: Event, margin: usize) -> std::result::Result<(), Event> {
        match self.queue.post_fifo(e, margin) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "{}",
                    FrameworkError::QueueFull {
                        ao_name: self.name.clone(),
                        capacity: self.queue.capacity(),
                        margin,
                    }
                );
                Err(e)
            }
        }
    }

    pub fn post_lifo(&self, e: Event) -> Result<()> {
        self.queue.post_lifo(e)
    }

    /// Posts the reserved shutdown sentinel (spec.md §5: "shutting down an
    /// AO requires sending it a sentinel event that its handler
    /// interprets"). The event loop stops *after* the handler has seen it,
    /// so `Hsm::dispatch` always gets first refusal on `SIG_QUIT`.
    pub fn request_stop(&self) -> Result<()> {
        debug!(ao = %self.name, "requesting stop");
        self.queue.post_lifo(Event::Static { sig: SIG_QUIT })
    }

    /// Blocks until the event-loop thread exits. Only meaningful after
    /// [`AoHandle::request_stop`].
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Starts an active object: spawns its event-loop thread, runs the HSM's
/// initial transition, then loops `get` → `dispatch` → drop forever
/// (spec.md §4.2's run-to-completion loop). Returns once the thread is
/// spawned; it does not wait for the initial transition to finish.
#[instrument(skip(hsm, init_par), fields(ao = %config.name, prio = config.prio))]
pub fn ao_start<H>(mut hsm: H, config: ActiveObjectConfig, init_par: Option<Event>) -> Result<AoHandle>
where
    H: Hsm + 'static,
{
    if config.prio == 0 {
        return Err(FrameworkError::PriorityOutOfRange {
            requested: 0,
            max_active: u8::MAX,
        });
    }
    let queue = Arc::new(Queue::new(config.queue_capacity));
    let loop_queue = queue.clone();
    let name = config.name.clone();

    let thread = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            hsm.init(init_par.as_ref());
            loop {
                let e = loop_queue.get();
                let is_quit = e.sig() == SIG_QUIT;
                trace!(sig = e.sig(), "dispatching event");
                hsm.dispatch(&e);
                drop(e);
                if is_quit {
                    debug!("event loop stopping on quit sentinel");
                    break;
                }
            }
        })
        .map_err(|_| FrameworkError::ContractViolation("failed to spawn AO thread"))?;

    Ok(AoHandle {
        prio: config.prio,
        pthre: config.pthre,
        name,
        queue,
        thread: Some(thread),
    })
}
