//! The framework root object (spec.md §9 REDESIGN FLAGS): replaces the
//! source's global subscriber tables, pool arrays, metrics singletons, and
//! active-strategy pointer with one owned object whose methods are the
//! public API. Lifecycle is init-once; there is no teardown path, matching
//! the source (spec.md §9 says this is out of scope unless an implementer
//! chooses to add one).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, instrument, trace};

use crate::ao::{ActiveObjectConfig, AoHandle, Hsm};
use crate::config::Config;
use crate::dispatch::{Dispatcher, DefaultStrategy, MetricsSnapshot, Strategy};
use crate::error::{FrameworkError, Result};
use crate::event::{Event, EventFlags, PoolId, Signal};
use crate::pool::PoolManager;
use crate::proxy::{ProxyRequest, ProxyThread};
use crate::pubsub::{PubSub, PublishSummary};
use crate::relay::{IsrRelay, RelayStats};

/// Owns every subsystem: event pool, pub/sub registry, dispatcher, ISR
/// relay, proxy thread, and the set of active objects started through it.
pub struct Framework {
    config: Config,
    pool: Arc<PoolManager>,
    pubsub: Arc<PubSub>,
    dispatcher: Arc<Dispatcher>,
    relay: Arc<IsrRelay>,
    proxy: ProxyThread,
    aos: DashMap<u8, Arc<AoHandle>>,
}

impl Framework {
    pub fn new(config: Config) -> Arc<Self> {
        let pool = PoolManager::new(config.pools.clone());
        let pubsub = Arc::new(PubSub::new(config.max_pub_sig));
        let dispatcher = Dispatcher::new(
            config.staging_size,
            config.max_retry,
            Box::new(DefaultStrategy),
        );
        let default_alloc_size = config
            .pools
            .iter()
            .map(|p| p.block_size)
            .min()
            .unwrap_or(16);
        let relay = IsrRelay::start(
            config.relay.clone(),
            pool.clone(),
            pubsub.clone(),
            default_alloc_size,
        );
        let proxy = ProxyThread::start();

        Arc::new(Framework {
            config,
            pool,
            pubsub,
            dispatcher,
            relay,
            proxy,
            aos: DashMap::new(),
        })
    }

    pub fn with_default_config() -> Arc<Self> {
        Self::new(Config::default())
    }

    /// Loads `Config` from the platform config directory (creating it with
    /// defaults if absent) and builds a `Framework` from it.
    pub fn load() -> Result<Arc<Self>> {
        let config = Config::load()?;
        Ok(Self::new(config))
    }

    // --- Event lifecycle (spec.md §6) -------------------------------

    pub fn alloc(&self, size: usize, sig: Signal) -> Option<Event> {
        self.pool.alloc(size, sig, None)
    }

    pub fn alloc_extended(
        &self,
        size: usize,
        sig: Signal,
        priority: u8,
        flags: EventFlags,
    ) -> Result<Option<Event>> {
        self.pool.alloc_extended(size, sig, priority, flags, None)
    }

    pub fn pool_stats(&self, pool_id: PoolId) -> Option<crate::pool::PoolStats> {
        self.pool.stats(pool_id)
    }

    // --- AO lifecycle ------------------------------------------------

    #[instrument(skip(self, hsm, init_par), fields(prio = config.prio, ao = %config.name))]
    pub fn ao_start<H>(
        &self,
        hsm: H,
        config: ActiveObjectConfig,
        init_par: Option<Event>,
    ) -> Result<Arc<AoHandle>>
    where
        H: Hsm + 'static,
    {
        if config.prio == 0 || config.prio > self.config.max_active {
            let err = FrameworkError::PriorityOutOfRange {
                requested: config.prio,
                max_active: self.config.max_active,
            };
            error!("{err}");
            return Err(err);
        }
        let handle = Arc::new(crate::ao::ao_start(hsm, config, init_par)?);
        self.aos.insert(handle.prio(), handle.clone());
        debug!("active object started");
        Ok(handle)
    }

    pub fn ao(&self, prio: u8) -> Option<Arc<AoHandle>> {
        self.aos.get(&prio).map(|r| r.clone())
    }

    // --- Posting -------------------------------------------------------

    pub fn post_fifo(
        &self,
        ao: &Arc<AoHandle>,
        e: Event,
        margin: usize,
    ) -> std::result::Result<(), Event> {
        ao.post_fifo(e, margin)
    }

    pub fn post_lifo(&self, ao: &Arc<AoHandle>, e: Event) -> Result<()> {
        ao.post_lifo(e)
    }

    pub fn publish(&self, e: Event) -> PublishSummary {
        trace!(sig = e.sig(), "publish requested");
        self.pubsub.publish(e)
    }

    // --- ISR path --------------------------------------------------

    pub fn isr_publish(&self, sig: Signal, pool_id: PoolId, param: u32) {
        self.relay.relay_publish(sig, pool_id, param);
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    // --- Subscription ------------------------------------------------

    pub fn subscribe(&self, ao: &Arc<AoHandle>, sig: Signal) -> Result<()> {
        self.pubsub.subscribe(ao.clone(), sig)
    }

    pub fn unsubscribe(&self, ao: &Arc<AoHandle>, sig: Signal) -> Result<()> {
        self.pubsub.unsubscribe(ao.prio(), sig)
    }

    // --- Dispatcher ----------------------------------------------------

    pub fn stage(&self, target: &Arc<AoHandle>, e: Event) -> std::result::Result<(), Event> {
        trace!(ao = %target.name(), sig = e.sig(), "staging event");
        self.dispatcher.stage(target.clone(), e)
    }

    pub fn set_strategy(&self, strategy: Box<dyn Strategy>) {
        self.dispatcher.set_strategy(strategy);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics()
    }

    pub fn reset_metrics(&self) {
        self.dispatcher.reset_metrics();
    }

    pub fn enable(&self) {
        self.dispatcher.enable();
    }

    pub fn disable(&self) {
        self.dispatcher.disable();
    }

    pub fn kick_dispatcher_if_pending(&self) {
        self.dispatcher.kick_if_pending();
    }

    // --- Proxy -----------------------------------------------------

    pub fn submit_proxy_request(
        &self,
        target: &Arc<AoHandle>,
        request: Box<dyn ProxyRequest>,
    ) -> Result<()> {
        self.proxy.submit(target.clone(), request)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
