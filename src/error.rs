//! Error types surfaced by the public API.
//!
//! Per spec.md §7, the only failures the core itself can produce are
//! allocation exhaustion at version/gate construction time; everything
//! else (NULL resolution, CAS misses) is a normal, silently-handled
//! condition rather than an error.

use thiserror::Error;

/// Allocation exhaustion reported by [`crate::version::Gate::make_version`]
/// or [`crate::version::Gate::new`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError {
  /// Every thread index in `[0, MAX_THREADS)` is currently claimed by a
  /// live thread.
  #[error("no free thread index available (MAX_THREADS exhausted)")]
  ThreadPoolExhausted,
  /// The calling thread has already created `MAX_ARENAS_PER_THREAD`
  /// arenas and none have room.
  #[error("thread has exhausted its per-thread arena capacity")]
  ArenaCapacityExhausted,
  /// The global allocator failed to satisfy an arena's page request.
  #[error("page allocator failed while creating a new arena")]
  PageAllocationFailed,
}
