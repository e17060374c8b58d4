//! Page-aligned arenas and their lock-free free-stacks (component C).
//!
//! Each arena is a fixed block of [`SLOTS_PER_ARENA`] slots: index 0 is a
//! permanent sentinel that is never allocated, the rest are usable. The
//! free-stack's tagged top defeats ABA on the stack pointer without a
//! double-width CAS; pushes happen from any thread, pops are a
//! single-consumer batch-steal performed only by the arena's owning
//! thread (spec.md §4.3).

use core::ptr;
use core::ptr::NonNull;

use crate::bitpack;
use crate::handle::Handle;
use crate::params::MAX_ARENAS_PER_THREAD;
use crate::params::MAX_THREADS;
use crate::padded::CachePadded;
use crate::params::SLOTS_PER_ARENA;
use crate::slot::Slot;
use crate::utils::alloc::Layout;
use crate::utils::alloc::alloc;
use crate::utils::alloc::dealloc;
use crate::utils::sync::atomic::AtomicBool;
use crate::utils::sync::atomic::AtomicPtr;
use crate::utils::sync::atomic::AtomicU32;
use crate::utils::sync::atomic::AtomicU64;
use crate::utils::sync::atomic::Ordering::AcqRel;
use crate::utils::sync::atomic::Ordering::Acquire;
use crate::utils::sync::atomic::Ordering::Relaxed;
use crate::utils::sync::atomic::Ordering::Release;

fn slot_array_layout() -> Layout {
  Layout::array::<Slot>(SLOTS_PER_ARENA).expect("invalid params: arena slot array layout")
}

// -----------------------------------------------------------------------------
// Arena Header
// -----------------------------------------------------------------------------

/// Fixed process-lifetime metadata for one `(thread, arena)` table cell.
///
/// The header itself is never freed. Its slot storage, however, may be
/// released back to the allocator and lazily recreated (spec.md §4.4's
/// "advise the OS it may drop physical pages", implemented here as a
/// dealloc/realloc cycle through the global allocator — see DESIGN.md).
pub(crate) struct ArenaHeader {
  created: AtomicBool,
  thread_index: AtomicU32,
  arena_index: AtomicU32,
  /// Tagged free-stack top: high 32 bits = monotone depth tag, low 32
  /// bits = the handle at the top of the stack (the sentinel handle
  /// when empty).
  top: AtomicU64,
  storage: AtomicPtr<Slot>,
  /// Count of this arena's usable slots that are currently free, whether
  /// parked on the owning thread's local free-list or on `top`. Used to
  /// detect "full depth" for physical-page reclamation (spec.md §4.4
  /// step 4).
  free_count: AtomicU32,
}

impl ArenaHeader {
  fn new() -> Self {
    Self {
      created: AtomicBool::new(false),
      thread_index: AtomicU32::new(0),
      arena_index: AtomicU32::new(0),
      top: AtomicU64::new(0),
      storage: AtomicPtr::new(ptr::null_mut()),
      free_count: AtomicU32::new(0),
    }
  }

  #[inline]
  pub(crate) fn is_created(&self) -> bool {
    self.created.load(Acquire)
  }

  #[inline]
  pub(crate) fn sentinel_handle(&self) -> Handle {
    Handle::new(self.thread_index.load(Relaxed), self.arena_index.load(Relaxed), 0)
  }

  /// Allocates (or reallocates, after a physical-page reclaim) this
  /// arena's slot storage and returns the usable slots (indices
  /// `1..SLOTS_PER_ARENA`) for the caller to link into its local
  /// free-stack. Only ever called by the arena's owning thread.
  ///
  /// Returns `None` if the page allocator fails.
  pub(crate) fn allocate_storage(
    &self,
    thread_index: u32,
    arena_index: u32,
  ) -> Option<&'static [Slot]> {
    debug_assert!(self.storage.load(Relaxed).is_null(), "arena storage already allocated");

    // SAFETY: `slot_array_layout` always returns a non-zero-sized layout
    // (`SLOTS_PER_ARENA >= 2`, checked in params.rs).
    let raw = unsafe { alloc(slot_array_layout()) }.cast::<Slot>();
    let nonnull = NonNull::new(raw)?;

    for index in 0..SLOTS_PER_ARENA {
      // SAFETY: `index` is within the `SLOTS_PER_ARENA`-element
      // allocation just performed.
      unsafe {
        nonnull.add(index).write(Slot::new());
      }
    }

    self.thread_index.store(thread_index, Relaxed);
    self.arena_index.store(arena_index, Relaxed);
    self.top.store(bitpack::pack(0, self.sentinel_handle().into_bits()), Relaxed);
    self.free_count.store(SLOTS_PER_ARENA as u32 - 1, Relaxed);
    self.storage.store(nonnull.as_ptr(), Release);
    self.created.store(true, Release);

    // SAFETY: slots `1..SLOTS_PER_ARENA` were just initialized above and
    // the allocation is now published and process-lifetime (until a
    // later `release_storage`/`allocate_storage` cycle, which only the
    // owning thread performs, serialized with its own prior work).
    let slots: &'static [Slot] =
      unsafe { core::slice::from_raw_parts(nonnull.as_ptr(), SLOTS_PER_ARENA) };

    Some(&slots[1..])
  }

  /// Deallocates this arena's slot storage. Caller must have already
  /// verified [`is_full_depth`](Self::is_full_depth) and drained `top`
  /// (spec.md §4.4 step 4); a fully-drained, full-depth arena has no
  /// outstanding acquires for anyone to release, so nothing can be
  /// mid-push against it once drained.
  pub(crate) fn release_storage(&self) {
    debug_assert!(self.is_full_depth(), "releasing storage for an arena with outstanding slots");

    let raw = self.storage.swap(ptr::null_mut(), AcqRel);

    if raw.is_null() {
      return;
    }

    // SAFETY: `raw` was allocated by `allocate_storage` with this same
    // layout and has not been freed since (storage was non-null).
    unsafe {
      dealloc(raw.cast(), slot_array_layout());
    }
  }

  #[inline]
  pub(crate) fn is_storage_present(&self) -> bool {
    !self.storage.load(Acquire).is_null()
  }

  /// `true` once every usable slot in this arena is currently free
  /// (spec.md §4.4 step 4 "if its free-stack reports full depth").
  #[inline]
  pub(crate) fn is_full_depth(&self) -> bool {
    self.free_count.load(Acquire) as usize == SLOTS_PER_ARENA - 1
  }

  /// Records that one of this arena's slots was just handed out by the
  /// allocator.
  #[inline]
  pub(crate) fn mark_allocated(&self) {
    self.free_count.fetch_sub(1, AcqRel);
  }

  /// Records that one of this arena's slots was just returned to the
  /// free pool, wherever it physically landed (the owning thread's local
  /// free-list or this arena's own `top`).
  #[inline]
  pub(crate) fn mark_freed(&self) {
    self.free_count.fetch_add(1, AcqRel);
  }

  /// Returns the slot at `index`, or `None` if storage has been
  /// released. `index` must be `< SLOTS_PER_ARENA`.
  #[inline]
  pub(crate) fn slot(&self, index: usize) -> Option<&'static Slot> {
    debug_assert!(index < SLOTS_PER_ARENA, "slot index out of range for arena");

    let raw = self.storage.load(Acquire);

    if raw.is_null() {
      return None;
    }

    // SAFETY: `raw` is non-null, was allocated with `SLOTS_PER_ARENA`
    // elements, and remains valid for as long as a caller could be
    // holding a live handle into it (see module docs).
    Some(unsafe { &*raw.add(index) })
  }

  /// Pushes `slot` onto this arena's shared free-stack. Safe to call
  /// from any thread (spec.md §4.3 push).
  pub(crate) fn push(&self, slot: &Slot, handle: Handle) {
    let mut top = self.top.load(Relaxed);

    loop {
      let (depth, top_handle) = bitpack::unpack(top);

      slot.set_free_next(Handle::from_bits(top_handle));

      let new_top = bitpack::pack(depth.wrapping_add(1), handle.into_bits());

      match self.top.compare_exchange_weak(top, new_top, AcqRel, Relaxed) {
        Ok(_) => return,
        Err(actual) => top = actual,
      }
    }
  }

  /// Detaches the entire free-stack chain as a private list and returns
  /// its head, or `None` if the stack was already empty. Single-consumer:
  /// only the arena's owning thread may call this (spec.md §4.3 pop).
  pub(crate) fn steal(&self) -> Option<Handle> {
    let sentinel = self.sentinel_handle();
    let (_, top_handle) = bitpack::unpack(self.top.load(Relaxed));

    if top_handle == sentinel.into_bits() {
      return None;
    }

    let detached = self.top.swap(bitpack::pack(0, sentinel.into_bits()), AcqRel);
    let (_, top_handle) = bitpack::unpack(detached);

    if top_handle == sentinel.into_bits() {
      None
    } else {
      Some(Handle::from_bits(top_handle))
    }
  }
}

// -----------------------------------------------------------------------------
// Arena Table
// -----------------------------------------------------------------------------

const THREADS: usize = MAX_THREADS as usize;
const ARENAS: usize = MAX_ARENAS_PER_THREAD as usize;

/// Process-wide `[thread][arena]` table of arena headers, flattened to a
/// single heap allocation (`THREADS * ARENAS` cells) to avoid an
/// 8000-plus-element temporary on the stack while it is built.
///
/// Read-mostly: written only when a thread creates a new arena, guarded
/// by that arena header's own `created`/`storage` publication (spec.md
/// §9 "Global mutable state"). Each cell is cache-line padded so that two
/// threads racing to create neighboring arenas never tear each other's
/// cache lines, the same distribution-across-cache-lines concern the
/// teacher's own table layout addresses for its entries.
pub(crate) struct ArenaTable {
  cells: Box<[CachePadded<ArenaHeader>]>,
}

impl ArenaTable {
  fn new() -> Self {
    let cells = (0..THREADS * ARENAS).map(|_| CachePadded::new(ArenaHeader::new())).collect();

    Self { cells }
  }

  /// Looks up the table cell for `(thread_index, arena_index)` whether
  /// or not it has been created yet. Used by the owning thread when
  /// creating a new arena, which only ever targets a cell it is about to
  /// initialize itself (no concurrent writer, so no race to guard
  /// against here).
  #[inline]
  pub(crate) fn header(&self, thread_index: u32, arena_index: u32) -> Option<&ArenaHeader> {
    if thread_index as usize >= THREADS || arena_index as usize >= ARENAS {
      return None;
    }

    self
      .cells
      .get(thread_index as usize * ARENAS + arena_index as usize)
      .map(|padded| &**padded)
  }

  /// Looks up an already-created arena header, or `None` if out of
  /// range or never created — both are well-defined no-ops (spec.md
  /// §4.1).
  #[inline]
  pub(crate) fn get(&self, thread_index: u32, arena_index: u32) -> Option<&ArenaHeader> {
    let header = self.header(thread_index, arena_index)?;

    if header.is_created() {
      Some(header)
    } else {
      None
    }
  }
}

pub(crate) static ARENA_TABLE: std::sync::LazyLock<ArenaTable> = std::sync::LazyLock::new(ArenaTable::new);
