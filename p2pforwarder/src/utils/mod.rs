use std::sync::{Mutex, MutexGuard, PoisonError};

mod sockets;

pub use sockets::*;

#[cfg(test)]
pub mod test_utils;

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
