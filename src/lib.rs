//! Wait-free snapshot publication with lock-free reclamation.
//!
//! `snapgate` provides [`Gate<T>`], a publication point for a logically
//! single, versioned value. A writer builds an immutable snapshot
//! ([`Version<T>`]) off a thread-local slot allocator and publishes it
//! into a gate; readers acquire the currently-published snapshot, read
//! it, and release it. A detached snapshot is reclaimed automatically
//! once every acquire attributed to it has released — no epochs, no
//! hazard pointers, no stop-the-world pass.
//!
//! # Usage
//!
//! ```
//! use snapgate::{Gate, GateConfig};
//!
//! let gate: Gate<String> = Gate::new(GateConfig::new()).unwrap();
//!
//! let version = gate.make_version().unwrap();
//! version.set_object("hello".to_string());
//! gate.exchange(0, version);
//!
//! let read = gate.acquire(0).unwrap();
//! assert_eq!(read.get().as_str(), "hello");
//! read.release();
//! ```
//!
//! # Concurrency
//!
//! [`Gate::acquire`] is wait-free: it is a single `fetch_add` against the
//! gate's control word and can never be blocked or retried by another
//! thread's activity. [`Version::release`] is wait-free save for one
//! compare-exchange on the rare path where it is also the release that
//! triggers reclamation. [`Gate::exchange`] and [`Gate::compare_exchange`]
//! are lock-free (bounded CAS retry loops).
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::thread;
//!
//! use snapgate::{Gate, GateConfig};
//!
//! let gate: Arc<Gate<u64>> = Arc::new(Gate::new(GateConfig::new()).unwrap());
//!
//! let version = gate.make_version().unwrap();
//! version.set_object(0);
//! gate.exchange(0, version);
//!
//! let handles: Vec<_> = (0..4)
//!   .map(|_| {
//!     let gate = Arc::clone(&gate);
//!     thread::spawn(move || {
//!       for _ in 0..100 {
//!         let version = gate.acquire(0).unwrap();
//!         let _ = *version.get();
//!         version.release();
//!       }
//!     })
//!   })
//!   .collect();
//!
//! for handle in handles {
//!   handle.join().unwrap();
//! }
//! ```
//!
//! ## Memory reclamation
//!
//! Reclamation is a split reference count: an outer acquire counter
//! lives in the gate's control word, an inner release counter lives with
//! each version's slot. A version only becomes a reclamation candidate
//! once it is detached from the gate (by [`Gate::exchange`] or
//! [`Gate::compare_exchange`]); from there, the release that balances the
//! inner counter back to zero triggers cleanup exactly once. See
//! [`implementation`] for the full rationale, including the wraparound
//! discipline that makes the 32-bit counters safe indefinitely.
//!
//! # Build-time limits
//!
//! [`MAX_THREADS`](params::MAX_THREADS) and
//! [`MAX_ARENAS_PER_THREAD`](params::MAX_ARENAS_PER_THREAD) bound how
//! many threads may simultaneously hold an allocator context and how
//! many arenas a single thread may create; see [`params`] for the full
//! set of layout constants and their static assertions.

mod arena;
mod bitpack;
mod config;
mod error;
mod gate;
mod handle;
mod padded;
pub mod params;
mod slot;
mod thread;
mod utils;
mod version;

pub mod implementation {
  #![doc = include_str!("../IMPLEMENTATION.md")]
}

pub use self::config::GateConfig;
pub use self::error::GateError;
pub use self::version::Gate;
pub use self::version::Version;
