//! peerprobe harness library
//!
//! Supervises a relay node and a pair of protocol peers through a scripted
//! interoperability run: bring the relay up, start and connect both peers,
//! exchange a contact request, trade messages both ways, and report the
//! outcome per step. The protocol engine itself sits behind the traits in
//! [`engine`]; [`loopback`] provides an in-process implementation.

macro_rules! log_info {
    ($label:expr, $($arg:tt)*) => ({
        log::info!("[{}] {}", $label, format_args!($($arg)*));
    })
}

macro_rules! log_warn {
    ($label:expr, $($arg:tt)*) => ({
        log::warn!("[{}] {}", $label, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($label:expr, $($arg:tt)*) => ({
        log::error!("[{}] {}", $label, format_args!($($arg)*));
    })
}

macro_rules! log_debug {
    ($label:expr, $($arg:tt)*) => ({
        log::debug!("[{}] {}", $label, format_args!($($arg)*));
    })
}

pub mod config;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod orchestrator;
pub mod peer;
pub mod relay;
pub mod retry;
pub mod timing;
pub mod workflow;
mod worker;

pub use config::{ConfigError, PeerSettings, TestConfig};
pub use engine::{
    ConnectionStatus, ContactId, EngineError, EngineFactory, PeerEngine, PeerOptions, RelayEngine,
    RelayOptions,
};
pub use error::HarnessError;
pub use loopback::LoopbackNetwork;
pub use orchestrator::Orchestrator;
pub use peer::{ConnectionEvent, ContactRequest, IncomingMessage, PeerConfig, PeerState, PeerStatus, TestPeer};
pub use relay::{RelayConfig, RelayNode, RelayStatus};
pub use retry::{retry_operation, RetryPolicy};
pub use timing::{ManualClock, SystemClock, TimeProvider};
pub use workflow::{Phase, Workflow};

// Re-export from lib crate for convenience
pub use peerprobe_lib::{
    ContactRelation, ContactStatus, PeerMetrics, PortRange, PublicKey, RelayMetrics, Results,
    StepResult, StepStatus,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Every state struct guarded this way is left consistent between
/// statements, so a poisoned guard is still safe to read.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
