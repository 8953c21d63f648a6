//! In-memory backends for the service traits.
//!
//! These model the delivery semantics the pipeline relies on (visibility
//! timeouts, redelivery, instance state transitions) closely enough to
//! exercise the loops in tests and in `facegridd standalone`. Each backend
//! can be switched to "unavailable" to simulate an outage.

pub mod blob;
pub mod fleet;
pub mod queue;

pub use blob::MemoryBlobStore;
pub use fleet::{FleetCommand, MemoryFleet};
pub use queue::MemoryQueue;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this module leaves the data consistent, so
/// a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
