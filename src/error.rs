//! Unified error type for the framework's public, fallible operations.
//!
//! Transient conditions (exhaustion, queue-full, staging overflow, retry
//! exhaustion) are modelled as ordinary enum variants returned to the
//! caller. Contract violations are a distinct variant: in debug builds the
//! call site additionally `debug_assert!`s before constructing it, so a
//! defect is caught at the point of the mistake during development while
//! release builds still get a typed error back instead of undefined
//! behaviour.

use std::io;
use thiserror::Error;

/// Unified error type for all framework operations.
#[derive(Debug, Error)]
pub enum FrameworkError {
    /// Every candidate pool (including size-class fallbacks) was below its
    /// configured margin. `PoolManager::alloc`/`alloc_extended` still
    /// return `Option`/`Result<Option<_>, _>` to the caller rather than
    /// this variant directly, so this is logged (`warn!`) at the call site
    /// rather than propagated — see DESIGN.md's Error handling section.
    #[error("pool exhausted: no pool with block size >= {requested} has free margin")]
    PoolExhausted { requested: usize },

    /// The target AO's queue had no room left under the requested margin.
    /// Logged at `AoHandle::post_fifo`'s failure site; the caller still
    /// gets the event back via `Result<(), Event>`.
    #[error("queue full: AO {ao_name} at capacity {capacity} (margin {margin})")]
    QueueFull {
        ao_name: String,
        capacity: usize,
        margin: usize,
    },

    /// A staging ring was full at insertion time. Logged at
    /// `Dispatcher::stage`'s failure site.
    #[error("staging overflow at priority level {level:?}")]
    StagingOverflow { level: crate::dispatch::PrioLevel },

    /// An extended event exhausted its retry budget and was dropped.
    /// Logged at `Dispatcher::retry_or_drop`'s non-retryable branch.
    #[error("retry budget exhausted after {retries} attempts")]
    RetryExhausted { retries: u8 },

    /// A signal outside the configured pub/sub range.
    #[error("signal {0} is outside the published signal range")]
    SignalOutOfRange(u32),

    /// An AO priority outside `[1, max_active]`.
    #[error("AO priority {requested} outside [1, {max_active}]")]
    PriorityOutOfRange { requested: u8, max_active: u8 },

    /// A defect in caller discipline: double free, recycling a static
    /// event, refcount underflow, or a `gc` on an unregistered pool id.
    /// These indicate code defects, not environmental conditions; see
    /// spec.md §7.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    /// Config file I/O or parse failure.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from loading or saving [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] io::Error),

    #[error("could not parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("could not serialize config TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine platform config directory")]
    NoConfigDir,
}

pub type Result<T> = std::result::Result<T, FrameworkError>;
