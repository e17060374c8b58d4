//! Version slot primitives (component B).
//!
//! A [`Slot`] is a fixed-size record. It never moves and is never
//! generic over a payload type: the payload is an opaque pointer set by
//! the writer before publication and read by observers after acquiring a
//! handle to it (spec.md §3, §4.2).

use core::ptr;

use crate::gate::GateInner;
use crate::handle::Handle;
use crate::utils::sync::atomic::AtomicPtr;
use crate::utils::sync::atomic::AtomicU64;
use crate::utils::sync::atomic::Ordering::AcqRel;
use crate::utils::sync::atomic::Ordering::Relaxed;
use crate::utils::sync::atomic::Ordering::Release;

// -----------------------------------------------------------------------------
// Inner State
// -----------------------------------------------------------------------------

/// `inner_state` bit layout.
///
/// spec.md §4.2 describes this as "low `W` bits = counter, bits
/// `W..W+1` = flags". This implementation packs the counter into the
/// **high** 32 bits and the flags into the low 2 bits instead — the
/// opposite of that literal description — so that [`InnerState::release`]
/// can use a single wait-free `fetch_add` without a carry out of a
/// counter wraparound corrupting the monotone flag bits. This mirrors the
/// same high-bits-counter trick spec.md §4.5 already uses for the Gate's
/// own control block (`fetch_add(1 << handle_bits)`). See DESIGN.md for
/// the full rationale; externally observable behavior (S1–S6, the
/// universal invariants) is unchanged.
const DETACHED_BIT: u64 = 1;
const FINALIZED_BIT: u64 = 1 << 1;
const FLAGS_MASK: u64 = DETACHED_BIT | FINALIZED_BIT;
const COUNTER_SHIFT: u32 = 32;
const COUNTER_ONE: u64 = 1 << COUNTER_SHIFT;

/// Outcome of a [`InnerState::release`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ReleaseOutcome {
  /// The version is still reachable by some path; nothing to do.
  Continue,
  /// The counter balanced to zero while `DETACHED` was set: the caller
  /// must attempt to claim `FINALIZED`.
  MaybeReclaim,
}

/// The packed `(counter, DETACHED, FINALIZED)` word of a version slot.
pub(crate) struct InnerState(AtomicU64);

impl InnerState {
  #[inline]
  fn new() -> Self {
    Self(AtomicU64::new(0))
  }

  /// Resets to the zero/flags-clear state. Only valid while the slot is
  /// exclusively owned by the writer building it (spec.md `init_for_build`).
  #[inline]
  pub(crate) fn reset(&self) {
    self.0.store(0, Relaxed);
  }

  #[inline]
  fn decode(state: u64) -> (u32, bool, bool) {
    let counter = (state >> COUNTER_SHIFT) as u32;
    let detached = state & DETACHED_BIT != 0;
    let finalized = state & FINALIZED_BIT != 0;

    (counter, detached, finalized)
  }

  /// Bumps the release counter by one. Wait-free save for the caller's
  /// own follow-up finalization CAS (spec.md §4.5 `Release`).
  #[inline]
  pub(crate) fn release(&self) -> ReleaseOutcome {
    let prev = self.0.fetch_add(COUNTER_ONE, Release);
    let state = prev.wrapping_add(COUNTER_ONE);
    let (counter, detached, _) = Self::decode(state);

    if detached && counter == 0 {
      ReleaseOutcome::MaybeReclaim
    } else {
      ReleaseOutcome::Continue
    }
  }

  /// Atomically sets `DETACHED` and subtracts `outer_snapshot` from the
  /// counter (spec.md §4.5 `Exchange` steps 5–6). Returns the resulting
  /// counter value and whether `FINALIZED` was already claimed by someone
  /// else.
  #[inline]
  pub(crate) fn detach_and_drain(&self, outer_snapshot: u32) -> (u32, bool) {
    let mut prev = self.0.load(Relaxed);

    loop {
      let (counter, _, finalized) = Self::decode(prev);
      let new_counter = counter.wrapping_sub(outer_snapshot);
      let new_state = ((new_counter as u64) << COUNTER_SHIFT) | (prev & FLAGS_MASK) | DETACHED_BIT;

      match self.0.compare_exchange_weak(prev, new_state, AcqRel, Relaxed) {
        Ok(_) => return (new_counter, finalized),
        Err(actual) => prev = actual,
      }
    }
  }

  /// Attempts to claim `FINALIZED`. The winner is the thread responsible
  /// for running the cleanup callback and returning the slot to its
  /// arena's free-stack.
  #[inline]
  pub(crate) fn try_claim_finalized(&self) -> bool {
    let mut prev = self.0.load(Relaxed);

    loop {
      if prev & FINALIZED_BIT != 0 {
        return false;
      }

      let new_state = prev | FINALIZED_BIT;

      match self.0.compare_exchange_weak(prev, new_state, AcqRel, Relaxed) {
        Ok(_) => return true,
        Err(actual) => prev = actual,
      }
    }
  }

  #[inline]
  pub(crate) fn is_detached(&self) -> bool {
    self.0.load(Relaxed) & DETACHED_BIT != 0
  }

  /// Test-only: force the counter to an arbitrary value, optionally with
  /// `DETACHED` set, without performing `2^32` real releases.
  #[cfg(test)]
  pub(crate) fn set_raw_for_test(&self, counter: u32, detached: bool) {
    let mut state = (counter as u64) << COUNTER_SHIFT;

    if detached {
      state |= DETACHED_BIT;
    }

    self.0.store(state, Relaxed);
  }
}

// -----------------------------------------------------------------------------
// Version Slot
// -----------------------------------------------------------------------------

/// A fixed-size record holding one immutable version (snapshot) and its
/// reclamation bookkeeping.
///
/// Never generic: `object`/`free_context` are opaque pointers, exactly
/// as spec.md §3 describes. Typed access is layered on top by
/// [`crate::version::Version`].
#[repr(C)]
pub(crate) struct Slot {
  object: AtomicPtr<()>,
  free_context: AtomicPtr<()>,
  gate: AtomicPtr<GateInner>,
  pub(crate) inner_state: InnerState,
  /// Dual-purpose field (spec.md §3 "link"): the free-stack `next`
  /// handle while this slot is `Free`, or a copy of the slot's own
  /// handle (`self_handle`) in every other state.
  link: AtomicU64,
}

// SAFETY: all fields are atomics; shared access across threads is the
// entire point of this type.
unsafe impl Sync for Slot {}

impl Slot {
  pub(crate) fn new() -> Self {
    Self {
      object: AtomicPtr::new(ptr::null_mut()),
      free_context: AtomicPtr::new(ptr::null_mut()),
      gate: AtomicPtr::new(ptr::null_mut()),
      inner_state: InnerState::new(),
      link: AtomicU64::new(Handle::NULL.into_bits() as u64),
    }
  }

  /// Stores the payload and cleanup context. Must happen-before
  /// publication; the writer holds exclusive access while `Building`.
  #[inline]
  pub(crate) fn set_object(&self, object: *mut (), free_context: *mut ()) {
    self.object.store(object, Relaxed);
    self.free_context.store(free_context, Relaxed);
  }

  #[inline]
  pub(crate) fn get_object(&self) -> *mut () {
    self.object.load(Relaxed)
  }

  #[inline]
  pub(crate) fn get_free_context(&self) -> *mut () {
    self.free_context.load(Relaxed)
  }

  /// Prepares a freshly allocated slot for the `Building` state: records
  /// the owning gate and clears the reclamation counters.
  #[inline]
  pub(crate) fn init_for_build(&self, gate: *const GateInner) {
    self.gate.store(gate.cast_mut(), Relaxed);
    self.inner_state.reset();
  }

  #[inline]
  pub(crate) fn gate(&self) -> *const GateInner {
    self.gate.load(Relaxed)
  }

  #[inline]
  pub(crate) fn self_handle(&self) -> Handle {
    Handle::from_bits(self.link.load(Relaxed) as u32)
  }

  #[inline]
  pub(crate) fn set_self_handle(&self, handle: Handle) {
    self.link.store(handle.into_bits() as u64, Relaxed);
  }

  #[inline]
  pub(crate) fn free_next(&self) -> Handle {
    Handle::from_bits(self.link.load(Relaxed) as u32)
  }

  #[inline]
  pub(crate) fn set_free_next(&self, handle: Handle) {
    self.link.store(handle.into_bits() as u64, Relaxed);
  }
}
