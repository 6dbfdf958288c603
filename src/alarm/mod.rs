pub mod engine;
pub mod locks;
pub mod model;
pub mod ring;
pub mod store;
pub mod time;
pub mod timer;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every structure guarded in this module is consistent between statements,
/// so a poisoned lock carries no torn state.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
