//! Build-time constants for handle layout, thread/arena limits, and the
//! reclamation counter width.
//!
//! None of these are runtime-tunable; see spec.md §6 ("Build-time
//! constants") for the rationale. They are grouped here the way the
//! teacher groups its capacity constants, with the static assertions that
//! protect the invariants living right next to the values they guard.

use core::mem::size_of;

use crate::slot::Slot;

// -----------------------------------------------------------------------------
// Handle Layout
// -----------------------------------------------------------------------------

/// Total bit width of a [`Handle`](crate::handle::Handle).
pub const HANDLE_BITS: u32 = 32;

/// Bits of a handle dedicated to the thread index.
pub const THREAD_BITS: u32 = 8;

/// Bits of a handle dedicated to the arena index within a thread.
pub const ARENA_BITS: u32 = 8;

/// Bits of a handle dedicated to the slot index within an arena.
pub const SLOT_BITS: u32 = 16;

const _: () = assert!(
  THREAD_BITS + ARENA_BITS + SLOT_BITS == HANDLE_BITS,
  "invalid params: handle field widths must sum to HANDLE_BITS",
);

/// Maximum number of threads that may simultaneously hold a thread index.
///
/// Must be strictly less than `(1 << THREAD_BITS) - 1` so that no legal
/// handle's thread field reaches the all-ones saturation value reserved
/// for [`Handle::NULL`](crate::handle::Handle::NULL).
pub const MAX_THREADS: u32 = 128;

/// Maximum number of arenas a single thread context may own.
pub const MAX_ARENAS_PER_THREAD: u32 = 64;

const _: () = assert!(
  MAX_THREADS < (1 << THREAD_BITS) - 1,
  "invalid params: MAX_THREADS must leave the NULL sentinel unreachable",
);

const _: () = assert!(
  MAX_ARENAS_PER_THREAD <= (1 << ARENA_BITS),
  "invalid params: MAX_ARENAS_PER_THREAD must fit ARENA_BITS",
);

// -----------------------------------------------------------------------------
// Reclamation Counter Width
// -----------------------------------------------------------------------------

/// Width, in bits, of the Gate's outer (acquire) counter.
///
/// Per spec.md §4.5 this must equal [`INNER_COUNTER_BITS`]. A 32-bit
/// counter comfortably supports `2^32 - 1` concurrent acquires-minus-
/// releases against a single published version.
pub const OUTER_COUNTER_BITS: u32 = 32;

/// Width, in bits, of a version's inner (release) counter.
pub const INNER_COUNTER_BITS: u32 = 32;

const _: () = assert!(
  OUTER_COUNTER_BITS == INNER_COUNTER_BITS,
  "invalid params: outer and inner counter widths must match",
);

// -----------------------------------------------------------------------------
// Arena Sizing
// -----------------------------------------------------------------------------

/// The size of a single page, in bytes, used to size arenas.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages backing a single arena's slot storage.
///
/// Chosen so that the derived [`SLOTS_PER_ARENA`] comfortably exceeds any
/// realistic batch-steal chain while keeping a single arena's footprint
/// small enough to allocate/deallocate cheaply when reclaiming physical
/// pages (see spec.md §4.4).
pub const ARENA_PAGES: usize = 8;

/// Number of slots in a single arena, including the reserved sentinel at
/// index 0.
///
/// Derived at compile time from `size_of::<Slot>()` so that
/// `ARENA_PAGES * PAGE_SIZE` is evenly divided, as spec.md §4.3 requires.
pub const SLOTS_PER_ARENA: usize = derive_slots_per_arena();

const fn derive_slots_per_arena() -> usize {
  let arena_bytes = ARENA_PAGES * PAGE_SIZE;
  let slot_size = size_of::<Slot>();
  let slots = arena_bytes / slot_size;

  assert!(slots >= 2, "invalid params: ARENA_PAGES too small for Slot size");

  slots
}

const _: () = assert!(
  SLOTS_PER_ARENA - 1 <= (1 << SLOT_BITS) - 1,
  "invalid params: SLOTS_PER_ARENA must fit SLOT_BITS (minus the sentinel)",
);

const _: () = assert!(
  (ARENA_PAGES * PAGE_SIZE).is_multiple_of(size_of::<Slot>()),
  "invalid params: arena byte size must be an exact multiple of Slot size",
);
