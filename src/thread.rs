//! Per-thread allocation context and the stable thread-index registry
//! (component D).
//!
//! Every thread that touches the allocator claims a small integer index
//! from a process-wide occupancy bitmap on first use and releases the
//! index (but not its arenas, which are process-lifetime) when the
//! thread exits (spec.md §4.4 "thread index lifecycle").

use core::cell::Cell;
use core::cell::RefCell;

use crate::arena::ARENA_TABLE;
use crate::error::GateError;
use crate::handle::Handle;
use crate::params::MAX_ARENAS_PER_THREAD;
use crate::params::MAX_THREADS;
use crate::utils::sync::atomic::AtomicBool;
use crate::utils::sync::atomic::Ordering::AcqRel;
use crate::utils::sync::atomic::Ordering::Relaxed;

const THREADS: usize = MAX_THREADS as usize;

/// Process-wide occupancy bitmap: `true` means some live thread currently
/// holds that index. An index is claimed with a single CAS and released
/// with a single store when its owning thread exits.
struct ThreadRegistry {
  occupied: Box<[AtomicBool]>,
}

impl ThreadRegistry {
  fn new() -> Self {
    Self { occupied: (0..THREADS).map(|_| AtomicBool::new(false)).collect() }
  }

  fn claim(&self) -> Option<u32> {
    for (index, slot) in self.occupied.iter().enumerate() {
      if slot.compare_exchange(false, true, AcqRel, Relaxed).is_ok() {
        return Some(index as u32);
      }
    }

    None
  }

  fn release(&self, index: u32) {
    self.occupied[index as usize].store(false, AcqRel);
  }
}

static THREAD_REGISTRY: std::sync::LazyLock<ThreadRegistry> =
  std::sync::LazyLock::new(ThreadRegistry::new);

/// Per-thread allocation state: the claimed thread index, the set of
/// arenas this thread has created, and a private free-list threaded
/// through each arena's slots via [`Slot::free_next`](crate::slot::Slot::free_next).
///
/// Dropped (and the thread index released back to [`THREAD_REGISTRY`])
/// when the owning thread exits, per the `thread_local!` destructor
/// contract: `Drop` flushes every handle still on this thread's private
/// [`local_free`](Self::local_free) out to its arena's shared free-stack
/// before the index is released, so a later thread that claims the same
/// index can recover them.
///
/// That later thread never inherits this `ThreadContext` value itself —
/// it builds a fresh one — but [`ThreadContext::new`] re-derives
/// `arena_count` from [`ArenaTable`](crate::arena::ArenaTable)'s
/// actually-live headers for that thread index, so it adopts the prior
/// owner's arenas (and, via `steal_from_owned_arenas`, their flushed
/// slots) rather than creating new ones on top of them (spec.md §9 "a
/// later thread may adopt a still-registered index whose original owner
/// has exited, along with whatever arenas that index already owns").
pub(crate) struct ThreadContext {
  thread_index: u32,
  /// Number of arenas currently active (storage-present) for this
  /// thread index; also the index the next `create_arena` call will
  /// use. Storage-present headers always form a contiguous `0..n`
  /// prefix, since arenas are created in order and only the highest one
  /// is ever reclaimed.
  arena_count: Cell<u32>,
  /// Private free-list, most recently pushed handle last. Popped from
  /// the back so the most recently touched (and likely cache-hot) slot
  /// is reused first.
  local_free: RefCell<Vec<Handle>>,
}

impl ThreadContext {
  fn new() -> Option<Self> {
    let thread_index = THREAD_REGISTRY.claim()?;
    let arena_count = Self::discover_arena_count(thread_index);

    Some(Self {
      thread_index,
      arena_count: Cell::new(arena_count),
      local_free: RefCell::new(Vec::new()),
    })
  }

  /// Counts how many of `thread_index`'s arenas already have live
  /// storage, left behind by a prior owner of the same index that
  /// exited without reclaiming them down to zero.
  fn discover_arena_count(thread_index: u32) -> u32 {
    for arena_index in 0..MAX_ARENAS_PER_THREAD {
      let present =
        ARENA_TABLE.header(thread_index, arena_index).is_some_and(|header| header.is_storage_present());

      if !present {
        return arena_index;
      }
    }

    MAX_ARENAS_PER_THREAD
  }

  #[inline]
  pub(crate) fn thread_index(&self) -> u32 {
    self.thread_index
  }

  fn pop_local(&self) -> Option<Handle> {
    self.local_free.borrow_mut().pop()
  }

  /// Pushes a handle onto this thread's local free-list. Only the
  /// handle's owning thread (the thread whose index it carries) ever
  /// calls this.
  fn push_local(&self, handle: Handle) {
    self.local_free.borrow_mut().push(handle);
  }

  /// Batch-steals every handle parked on an owned arena's shared
  /// free-stack into the local free-list (spec.md §4.3's "any thread may
  /// return a version belonging to another thread's arena; the owner
  /// later reclaims the whole chain at once").
  fn steal_from_owned_arenas(&self) -> bool {
    let mut stole_any = false;

    for arena_index in 0..self.arena_count.get() {
      let Some(header) = ARENA_TABLE.get(self.thread_index, arena_index) else {
        continue;
      };

      let Some(mut handle) = header.steal() else {
        continue;
      };

      stole_any = true;
      let sentinel = header.sentinel_handle();

      loop {
        let Some(slot) = handle.resolve() else { break };
        let next = slot.free_next();

        self.push_local(handle);

        if next == sentinel {
          break;
        }

        handle = next;
      }
    }

    stole_any
  }

  /// Creates a new arena owned by this thread and links its usable slots
  /// directly into the local free-list (spec.md §4.4 step 3: fresh slots
  /// are not contended, so they bypass the shared free-stack entirely).
  fn create_arena(&self) -> Result<(), GateError> {
    let arena_index = self.arena_count.get();

    if arena_index >= MAX_ARENAS_PER_THREAD {
      return Err(GateError::ArenaCapacityExhausted);
    }

    let header = ARENA_TABLE
      .header(self.thread_index, arena_index)
      .expect("thread/arena index computed from live counters must be in range");
    let slots = header
      .allocate_storage(self.thread_index, arena_index)
      .ok_or(GateError::PageAllocationFailed)?;

    for (offset, slot) in slots.iter().enumerate() {
      let handle = Handle::new(self.thread_index, arena_index, offset as u32 + 1);

      slot.set_self_handle(handle);
      self.push_local(handle);
    }

    self.arena_count.set(arena_index + 1);
    tracing::debug!(thread = self.thread_index, arena = arena_index, "created arena");

    Ok(())
  }

  /// Allocates a free slot, trying (in order): the local free-list, a
  /// batch-steal from an owned arena's shared free-stack, and finally
  /// creating a brand new arena (spec.md §4.4 "allocation strategy").
  pub(crate) fn allocate(&self) -> Result<Handle, GateError> {
    let handle = self.allocate_any()?;

    if let Some(header) = ARENA_TABLE.get(self.thread_index, handle.arena_index()) {
      header.mark_allocated();
    }

    Ok(handle)
  }

  fn allocate_any(&self) -> Result<Handle, GateError> {
    if let Some(handle) = self.pop_local() {
      return Ok(handle);
    }

    if self.steal_from_owned_arenas()
      && let Some(handle) = self.pop_local()
    {
      return Ok(handle);
    }

    self.create_arena()?;

    Ok(self.pop_local().expect("a freshly created arena always has usable slots"))
  }

  /// Returns a handle to the free pool. If this thread owns the arena
  /// the handle belongs to, it goes straight onto the local free-list;
  /// otherwise it is pushed onto that arena's shared free-stack for the
  /// owner to eventually steal back (spec.md §4.3 push). Either way,
  /// afterwards checks whether this thread's highest-indexed arena can
  /// now be physically reclaimed (spec.md §4.4 step 4).
  pub(crate) fn free(&self, handle: Handle) {
    let Some(slot) = handle.resolve() else { return };
    let Some(header) = ARENA_TABLE.get(handle.thread_index(), handle.arena_index()) else { return };

    if handle.thread_index() == self.thread_index {
      self.push_local(handle);
    } else {
      header.push(slot, handle);
    }

    header.mark_freed();

    if handle.thread_index() == self.thread_index {
      self.try_reclaim_highest_arena();
    }
  }

  /// If this thread's highest-indexed arena is entirely free, deallocates
  /// its physical storage and lowers the active-arena count by one
  /// (spec.md §4.4 step 4: "inspect the highest active arena; if its
  /// free-stack reports full depth, reclaim its physical pages and
  /// reduce the active-arena count"). Only ever reclaims the highest
  /// arena, so storage-present headers stay a contiguous `0..arena_count`
  /// prefix for [`Self::discover_arena_count`] to re-derive later.
  fn try_reclaim_highest_arena(&self) {
    let Some(arena_index) = self.arena_count.get().checked_sub(1) else { return };
    let Some(header) = ARENA_TABLE.header(self.thread_index, arena_index) else { return };

    if !header.is_storage_present() || !header.is_full_depth() {
      return;
    }

    // Everything usable in this arena is free; anything still parked on
    // its shared stack is about to be discarded along with the storage.
    while header.steal().is_some() {}

    self.local_free.borrow_mut().retain(|handle| handle.arena_index() != arena_index);

    header.release_storage();
    self.arena_count.set(arena_index);
    tracing::debug!(thread = self.thread_index, arena = arena_index, "reclaimed arena");
  }
}

impl Drop for ThreadContext {
  fn drop(&mut self) {
    // Hand every slot still on this thread's private free-list back to
    // its arena's shared free-stack so a later thread adopting this
    // index can steal them via `steal_from_owned_arenas`.
    for handle in self.local_free.borrow_mut().drain(..) {
      let Some(slot) = handle.resolve() else { continue };

      if let Some(header) = ARENA_TABLE.get(handle.thread_index(), handle.arena_index()) {
        header.push(slot, handle);
      }
    }

    THREAD_REGISTRY.release(self.thread_index);
  }
}

thread_local! {
  static CONTEXT: Result<ThreadContext, ()> = ThreadContext::new().ok_or(());
}

/// Runs `f` with the calling thread's allocation context, lazily claiming
/// a thread index on first use. Fails only if every index in
/// `[0, MAX_THREADS)` is already held by another live thread.
#[inline]
pub(crate) fn with_context<R>(f: impl FnOnce(&ThreadContext) -> R) -> Result<R, GateError> {
  CONTEXT.with(|result| match result {
    Ok(ctx) => Ok(f(ctx)),
    Err(()) => Err(GateError::ThreadPoolExhausted),
  })
}
