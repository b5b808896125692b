//! Blocking proxy thread (spec.md §5, §9): lets an AO wait on an external
//! synchronization primitive without parking its own thread and breaking
//! the run-to-completion invariant. The AO submits a request, returns
//! immediately from its handler, and later receives a completion event
//! through its ordinary queue.

use std::sync::Arc;

use crossbeam::channel::{Sender, unbounded};
use tracing::{debug, error, instrument, trace};

use crate::ao::AoHandle;
use crate::error::{FrameworkError, Result};
use crate::event::Event;

/// A unit of blocking work submitted to a [`ProxyThread`]. `execute` runs
/// on the proxy thread, not the requesting AO's — it may block freely.
pub trait ProxyRequest: Send + 'static {
    /// Performs the blocking work and returns the event to post back to
    /// the requesting AO on completion.
    fn execute(self: Box<Self>) -> Event;
}

struct Job {
    request: Box<dyn ProxyRequest>,
    target: Arc<AoHandle>,
}

/// A dedicated worker thread that runs [`ProxyRequest`]s sequentially and
/// posts their results back to the AOs that submitted them.
///
/// Sequential by design: spec.md describes a single proxy thread per
/// blocking concern. An implementer who needs parallelism spins up more
/// than one `ProxyThread`.
pub struct ProxyThread {
    sender: Sender<Job>,
}

impl ProxyThread {
    pub fn start() -> Self {
        let (sender, receiver) = unbounded::<Job>();
        std::thread::Builder::new()
            .name("proxy".into())
            .spawn(move || {
                for job in receiver {
                    trace!(ao = %job.target.name(), "running proxy request");
                    let result = job.request.execute();
                    // Urgent: the requesting AO is typically parked
                    // awaiting exactly this completion.
                    if job.target.post_lifo(result).is_err() {
                        debug!(ao = %job.target.name(), "proxy result post_lifo failed");
                    }
                }
            })
            .expect("failed to spawn proxy thread");
        ProxyThread { sender }
    }

    /// Submits `request` to run on the proxy thread; its result will be
    /// posted to `target` via `post_lifo` once it completes.
    #[instrument(skip(self, request), fields(ao = %target.name()))]
    pub fn submit(&self, target: Arc<AoHandle>, request: Box<dyn ProxyRequest>) -> Result<()> {
        self.sender.send(Job { request, target }).map_err(|_| {
            let err = FrameworkError::ContractViolation("proxy thread is gone");
            error!("{err}");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ao::{ActiveObjectConfig, Hsm, ao_start};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct SleepThenSignal(u32);
    impl ProxyRequest for SleepThenSignal {
        fn execute(self: Box<Self>) -> Event {
            std::thread::sleep(Duration::from_millis(10));
            Event::Static { sig: self.0 }
        }
    }

    struct LastSeen(Arc<AtomicU32>);
    impl Hsm for LastSeen {
        fn init(&mut self, _par: Option<&Event>) {}
        fn dispatch(&mut self, e: &Event) {
            self.0.store(e.sig(), Ordering::SeqCst);
        }
    }

    #[test]
    fn proxy_result_arrives_at_target_ao() {
        let last = Arc::new(AtomicU32::new(0));
        let ao = Arc::new(
            ao_start(
                LastSeen(last.clone()),
                ActiveObjectConfig::new(1, 4, "waiter"),
                None,
            )
            .unwrap(),
        );
        let proxy = ProxyThread::start();
        proxy
            .submit(ao.clone(), Box::new(SleepThenSignal(77)))
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(last.load(Ordering::SeqCst), 77);
    }
}
