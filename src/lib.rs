#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]

//! A hierarchical-state-machine Active Object framework with a
//! priority-partitioned event dispatch layer on top: fixed-size event
//! pools, an ISR relay, per-AO bounded queues, and a pluggable
//! merge/drop/priority strategy that runs on a dedicated dispatcher
//! thread. See [`Framework`] for the entry point.

pub mod ao;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod framework;
pub mod logging;
pub mod pool;
pub mod proxy;
pub mod pubsub;
pub mod relay;

pub use ao::{ActiveObjectConfig, AoHandle, Hsm};
pub use config::Config;
pub use dispatch::{DefaultStrategy, Dispatcher, HighPerfStrategy, MetricsSnapshot, PrioLevel, Strategy};
pub use error::{ConfigError, FrameworkError, Result};
pub use event::{Event, EventFlags, Extended, PoolId, Signal, SIG_EMPTY, SIG_ENTRY, SIG_EXIT, SIG_INIT, SIG_QUIT, SIG_USER};
pub use framework::Framework;
pub use logging::Logger;
pub use pool::{PoolManager, PoolStats};
pub use proxy::{ProxyRequest, ProxyThread};
pub use pubsub::{PubSub, PublishSummary};
pub use relay::{Descriptor, IsrRelay, RelayStats};
