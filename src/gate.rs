//! The published-version control block (component E).
//!
//! A [`GateInner`] packs the currently-published [`Handle`] together with
//! a monotone "outer" acquire counter into one 64-bit word, so that a
//! single `fetch_add` both bumps the counter and tells the caller exactly
//! which handle that increment was attributed to (spec.md §4.5). This is
//! the same trick [`crate::slot::InnerState`] uses for its own counter,
//! mirrored here on the publishing side.

use crate::bitpack;
use crate::handle::Handle;
use crate::slot::ReleaseOutcome;
use crate::slot::Slot;
use crate::utils::sync::atomic::AtomicU64;
use crate::utils::sync::atomic::Ordering::AcqRel;
use crate::utils::sync::atomic::Ordering::Acquire;
use crate::utils::sync::atomic::Ordering::Relaxed;

/// Type-erased drop glue for a version's payload: a function pointer
/// transmuted to and from a raw `*mut ()`, the same pattern
/// [`core::task::RawWakerVTable`] uses to erase a concrete type behind a
/// pointer-sized handle without a trait object.
pub(crate) type DropGlue = unsafe fn(*mut ());

#[inline]
pub(crate) fn encode_drop_glue(drop_fn: DropGlue) -> *mut () {
  drop_fn as *mut ()
}

#[inline]
fn decode_drop_glue(raw: *mut ()) -> Option<DropGlue> {
  if raw.is_null() {
    return None;
  }

  // SAFETY: only ever produced by `encode_drop_glue` from a real
  // `DropGlue` function pointer of matching signature.
  Some(unsafe { core::mem::transmute::<*mut (), DropGlue>(raw) })
}

/// The control block behind a published version. Lives for as long as the
/// owning [`crate::version::Gate`] does (spec.md §5 `init_gate`/`destroy_gate`).
pub(crate) struct GateInner {
  /// Packs `(outer_refcount: u32, handle: u32)`. Every swap in
  /// [`exchange`](Self::exchange) or
  /// [`compare_exchange`](Self::compare_exchange) snapshots the
  /// outgoing handle's accumulated count and resets the counter to zero
  /// for the incoming handle, so each handle's outer count always
  /// starts fresh relative to its own publication (spec.md §4.5 step 1:
  /// the new control-block value is `(outer = 0, handle = new_handle)`).
  /// The snapshot taken at swap time is subtracted from the detached
  /// version's own inner counter
  /// ([`crate::slot::InnerState::detach_and_drain`]).
  control: AtomicU64,
}

impl GateInner {
  pub(crate) fn new(initial: Handle) -> Self {
    Self { control: AtomicU64::new(bitpack::pack(0, initial.into_bits())) }
  }

  /// Wait-free: bumps the outer counter and returns the handle that
  /// increment was attributed to (spec.md §4.5 `Acquire`).
  #[inline]
  pub(crate) fn acquire(&self) -> Handle {
    let prev = self.control.fetch_add(bitpack::pack(1, 0), Acquire);
    let (_, handle_bits) = bitpack::unpack(prev);

    Handle::from_bits(handle_bits)
  }

  #[inline]
  pub(crate) fn current(&self) -> Handle {
    let (_, handle_bits) = bitpack::unpack(self.control.load(Acquire));

    Handle::from_bits(handle_bits)
  }

  /// Unconditionally publishes `new_handle`, returning the handle it
  /// replaced. Loops only because the outer counter keeps changing
  /// underneath concurrent [`acquire`](Self::acquire) calls — the handle
  /// swap itself is not conditioned on the old handle's value, which is
  /// what distinguishes this from [`compare_exchange`](Self::compare_exchange)
  /// (spec.md §4.5 `Exchange`).
  pub(crate) fn exchange(&self, new_handle: Handle) -> Handle {
    let mut prev = self.control.load(Relaxed);

    loop {
      let (outer, old_bits) = bitpack::unpack(prev);
      let new_word = bitpack::pack(0, new_handle.into_bits());

      match self.control.compare_exchange_weak(prev, new_word, AcqRel, Relaxed) {
        Ok(_) => {
          let old_handle = Handle::from_bits(old_bits);

          detach(old_handle, outer);

          return old_handle;
        }
        Err(actual) => prev = actual,
      }
    }
  }

  /// Publishes `new_handle` only if the currently published handle is
  /// `expected`. Returns the handle that was replaced on success, or the
  /// handle actually found on failure (spec.md §4.5 `CompareExchange`).
  pub(crate) fn compare_exchange(&self, expected: Handle, new_handle: Handle) -> Result<Handle, Handle> {
    let mut prev = self.control.load(Relaxed);

    loop {
      let (outer, current_bits) = bitpack::unpack(prev);

      if current_bits != expected.into_bits() {
        return Err(Handle::from_bits(current_bits));
      }

      let new_word = bitpack::pack(0, new_handle.into_bits());

      match self.control.compare_exchange_weak(prev, new_word, AcqRel, Relaxed) {
        Ok(_) => {
          detach(expected, outer);

          return Ok(expected);
        }
        Err(actual) => prev = actual,
      }
    }
  }
}

/// Marks `handle`'s version as detached and subtracts the outer snapshot
/// taken at swap time from its inner counter; finalizes immediately if
/// that brings the counter to zero with no outstanding acquires still in
/// flight (spec.md §4.5 steps 5-7).
fn detach(handle: Handle, outer_snapshot: u32) {
  let Some(slot) = handle.resolve() else { return };
  let (counter, already_finalized) = slot.inner_state.detach_and_drain(outer_snapshot);

  if counter == 0 && !already_finalized && slot.inner_state.try_claim_finalized() {
    finalize(handle, slot);
  }
}

/// Balances one prior [`GateInner::acquire`]. If this release brings the
/// version's counter back to zero after it was already detached, this
/// thread becomes responsible for finalizing it (spec.md §4.5 `Release`).
pub(crate) fn release(handle: Handle) {
  let Some(slot) = handle.resolve() else { return };

  if slot.inner_state.release() == ReleaseOutcome::MaybeReclaim && slot.inner_state.try_claim_finalized() {
    finalize(handle, slot);
  }
}

/// Discards a version that was built but never published: runs its drop
/// glue immediately and returns the slot to the allocator without ever
/// touching `inner_state` (spec.md §4.6 `free_unpublished` — a version
/// that was never handed to `Exchange`/`CompareExchange` has no
/// outstanding acquires to wait for).
pub(crate) fn free_unpublished(handle: Handle) {
  let Some(slot) = handle.resolve() else { return };

  finalize(handle, slot);
}

/// Runs the payload's drop glue (if any was registered) and returns the
/// slot to its arena's free pool. Called by whichever thread wins the
/// `FINALIZED` CAS race, which may not be the slot's owning thread.
fn finalize(handle: Handle, slot: &Slot) {
  if let Some(drop_fn) = decode_drop_glue(slot.get_free_context()) {
    // SAFETY: `drop_fn` was produced by `encode_drop_glue` alongside this
    // exact object pointer when the version was built, and this call
    // happens only once per slot (guarded by the `FINALIZED` CAS).
    unsafe { drop_fn(slot.get_object()) };
  }

  if crate::thread::with_context(|ctx| ctx.free(handle)).is_err() {
    tracing::debug!(?handle, "dropped a finalized slot: no thread index available to recycle it");
  }
}
