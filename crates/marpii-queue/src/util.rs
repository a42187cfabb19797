use std::sync::{Mutex, MutexGuard};

///Locks `mutex`, ignoring poisoning.
///
/// A panic while holding one of the queue locks never leaves the guarded data half-written (every critical section
/// only pushes, pops or stores), so the data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
