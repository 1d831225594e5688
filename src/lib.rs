//! Fixed-size object pool (slab) allocator for managed-memory runtimes.
//!
//! One [`Pool`] per object size hands out fixed-size entries carved from
//! size-aligned slabs ("holders"). Free entries are chained through their own
//! storage, so a holder carries no side metadata beyond its header. Holders
//! with spare capacity sit on a doubly linked ready list; fully idle holders
//! are returned to the OS eagerly, except for one warm slab cached at the
//! list head.

#![allow(clippy::missing_safety_doc)]

use core::{
  cell::UnsafeCell,
  hint,
  mem::{align_of, size_of},
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, error, warn};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

const WORD: usize = size_of::<usize>();

/// Slab size, fixed for the process. Every holder is allocated at an address
/// aligned to this, which is what makes [`holder_of`] valid.
pub const SLAB_SIZE: usize = WORD * 2048; // 16KB on 64-bit
const SLAB_ALIGN_MASK: usize = !(SLAB_SIZE - 1);

const HOLDER_HEADER_SIZE: usize = size_of::<Holder>();

/// Payload words available per slab once the holder header is paid for.
const DATA_WORDS: usize = (SLAB_SIZE - HOLDER_HEADER_SIZE) / WORD;

/// Lock attempts before yielding to the scheduler.
const MAX_TRY_CYCLES: u32 = 5;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SLAB_SIZE.is_power_of_two());
const _: () = assert!(HOLDER_HEADER_SIZE % WORD == 0);
const _: () = assert!(HOLDER_HEADER_SIZE < SLAB_SIZE / 2);
const _: () = assert!(DATA_WORDS > 0);

// =============================================================================
// Collaborator traits
// =============================================================================

/// Supplies aligned memory chunks for holders and takes them back.
///
/// `request` must return a chunk whose base address is a multiple of `align`
/// (a power of two). `release` is handed back the same size the chunk was
/// requested with, since backends like mmap need the mapping length.
pub trait ChunkSource: Sync {
  unsafe fn request(&self, size: usize, align: usize) -> Option<NonNull<u8>>;
  unsafe fn release(&self, chunk: NonNull<u8>, size: usize);
}

/// Hooks into the embedding runtime.
pub trait RuntimeHooks: Sync {
  /// Is more than one execution thread currently live? Queried on every
  /// lock/unlock to pick the uncontended fast path.
  fn is_multi_threaded(&self) -> bool;

  /// Try to reclaim memory (typically: run a GC cycle). Returns whether
  /// anything may have been freed. Invoked once on first chunk-request
  /// failure.
  fn attempt_reclaim(&self) -> bool;

  /// Unrecoverable out-of-memory. Must not return; the embedding runtime
  /// decides the disposition (abort, unwind, restart).
  fn out_of_memory(&self) -> !;
}

/// What to do with a holder that just went fully idle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Retention {
  /// Release it to the chunk source immediately unless it is the ready-list
  /// head, so steady-state memory tracks the live object count. One warm
  /// slab stays cached. Tuned for garbage-collector churn.
  #[default]
  Eager,
  /// Keep idle holders linked; footprint tracks the historical peak.
  Keep,
}

// =============================================================================
// Default collaborators
// =============================================================================

/// Chunk source backed by anonymous `mmap`.
///
/// Over-maps by the requested alignment, then unmaps the unaligned head and
/// tail so the remaining chunk starts exactly on an `align` boundary and can
/// be released with a plain `munmap`.
pub struct MmapSource;

fn page_size() -> usize {
  unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

impl ChunkSource for MmapSource {
  unsafe fn request(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    let page = page_size();
    let mapped = align_up(size, page);

    if align <= page {
      // mmap is already page-aligned.
      return NonNull::new(unsafe { os_mmap(mapped) });
    }

    // Over-map, then trim the slop. `align` is a multiple of the page size
    // here, so both cut points are page-aligned.
    let raw = unsafe { os_mmap(mapped + align) };
    if raw.is_null() {
      return None;
    }

    let base = align_up(raw as usize, align);
    let lead = base - raw as usize;
    if lead > 0 {
      unsafe { os_munmap(raw, lead) };
    }
    let tail = (raw as usize + mapped + align) - (base + mapped);
    if tail > 0 {
      unsafe { os_munmap((base + mapped) as *mut u8, tail) };
    }

    NonNull::new(base as *mut u8)
  }

  unsafe fn release(&self, chunk: NonNull<u8>, size: usize) {
    unsafe { os_munmap(chunk.as_ptr(), align_up(size, page_size())) };
  }
}

/// Hooks for a plain multi-threaded embedding: no GC to trigger, OOM aborts.
pub struct StdRuntime;

impl RuntimeHooks for StdRuntime {
  fn is_multi_threaded(&self) -> bool {
    true
  }

  fn attempt_reclaim(&self) -> bool {
    false
  }

  fn out_of_memory(&self) -> ! {
    std::process::abort()
  }
}

/// Hooks for a single-threaded embedding: the lock degenerates to flag writes.
pub struct SingleThread;

impl RuntimeHooks for SingleThread {
  fn is_multi_threaded(&self) -> bool {
    false
  }

  fn attempt_reclaim(&self) -> bool {
    false
  }

  fn out_of_memory(&self) -> ! {
    std::process::abort()
  }
}

static MMAP_SOURCE: MmapSource = MmapSource;
static STD_RUNTIME: StdRuntime = StdRuntime;

// =============================================================================
// Errors
// =============================================================================

/// Pool construction errors. Runtime out-of-memory is not an error value; it
/// goes through [`RuntimeHooks::out_of_memory`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
  #[error("entry size must be non-zero")]
  ZeroSized,
  #[error("entry of {size} bytes does not fit in a {max}-byte slab payload")]
  EntryTooLarge { size: usize, max: usize },
  #[error("entry alignment {align} exceeds word alignment")]
  AlignTooLarge { align: usize },
}

// =============================================================================
// Spinlock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  /// With `contended == false` (runtime reports a sole live thread) this is a
  /// plain flag write: no RMW, no barrier, since no contender can exist.
  #[inline]
  fn acquire(&self, contended: bool) {
    if !contended {
      self.locked.store(true, Ordering::Relaxed);
      return;
    }
    let mut tries = MAX_TRY_CYCLES;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      tries -= 1;
      if tries == 0 {
        std::thread::yield_now();
        tries = MAX_TRY_CYCLES;
      } else {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn release(&self, contended: bool) {
    if !contended {
      self.locked.store(false, Ordering::Relaxed);
      return;
    }
    self.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// Holder (slab)
// =============================================================================

/// Transient view of a free entry: its leading word links to the next one.
#[repr(C)]
struct FreeSlot {
  next: *mut FreeSlot,
}

/// Slab header. Sits at offset 0 of each size-aligned slab; the entry array
/// follows inline.
#[repr(C)]
struct Holder {
  free: u32,
  total: u32,
  /// Owning pool, recovered on free via address masking.
  pool: *const Pool,
  /// Head of the intrusive free list threaded through free entries.
  free_head: *mut FreeSlot,
  /// Ready-list neighbors. `back == null` means this holder is the head.
  fore: *mut Holder,
  back: *mut Holder,
}

/// First entry slot of a holder's inline array.
#[inline]
unsafe fn holder_data(holder: *mut Holder) -> *mut usize {
  unsafe { holder.cast::<u8>().add(HOLDER_HEADER_SIZE).cast() }
}

/// Recover the owning holder from any of its entries by masking the low
/// address bits. Valid because every slab base is `SLAB_SIZE`-aligned.
#[inline]
fn holder_of(entry: NonNull<u8>) -> *mut Holder {
  (entry.as_ptr() as usize & SLAB_ALIGN_MASK) as *mut Holder
}

/// Remove `holder` from the ready list (caller must hold the pool lock).
#[inline]
unsafe fn unchain(shared: &mut Shared, holder: *mut Holder) {
  unsafe {
    let fore = (*holder).fore;
    let back = (*holder).back;
    (*holder).fore = null_mut();
    (*holder).back = null_mut();
    if !fore.is_null() {
      (*fore).back = back;
    }
    if !back.is_null() {
      (*back).fore = fore;
    } else {
      shared.head = fore;
    }
  }
}

// =============================================================================
// Pool (allocator class)
// =============================================================================

/// Lock-protected shared state of one pool.
struct Shared {
  /// Ready list: holders known to have at least one free entry.
  head: *mut Holder,
  live_entries: usize,
  holders: usize,
}

/// Counters snapshot, taken under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
  /// Entries currently handed out and not yet freed.
  pub live_entries: usize,
  /// Holders currently backed by chunk-source memory.
  pub holders: usize,
}

/// One allocator class: all holders of a single fixed entry size.
///
/// `allocate` and `free` may be called concurrently from any number of
/// threads; distinct pools share no state. A pool must stay at a stable
/// address while any of its entries is live (holders keep a back-reference
/// to it), so embedders typically keep pools in statics.
pub struct Pool {
  lock: SpinLock,
  shared: UnsafeCell<Shared>,
  /// Entry size in address words.
  entry_words: u32,
  /// Entries per holder.
  capacity: u32,
  retention: Retention,
  source: &'static dyn ChunkSource,
  runtime: &'static dyn RuntimeHooks,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl core::fmt::Debug for Pool {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Pool")
      .field("entry_words", &self.entry_words)
      .field("capacity", &self.capacity)
      .field("retention", &self.retention)
      .finish_non_exhaustive()
  }
}

impl Pool {
  /// Pool over the default mmap source and multi-threaded runtime hooks.
  pub fn new(entry_size: usize) -> Result<Self, PoolError> {
    Self::with_parts(entry_size, Retention::Eager, &MMAP_SOURCE, &STD_RUNTIME)
  }

  /// Pool sized for `T` over the default collaborators.
  pub fn for_type<T>() -> Result<Self, PoolError> {
    if align_of::<T>() > WORD {
      return Err(PoolError::AlignTooLarge {
        align: align_of::<T>(),
      });
    }
    Self::new(size_of::<T>())
  }

  /// Fully injected constructor.
  pub fn with_parts(
    entry_size: usize,
    retention: Retention,
    source: &'static dyn ChunkSource,
    runtime: &'static dyn RuntimeHooks,
  ) -> Result<Self, PoolError> {
    if entry_size == 0 {
      return Err(PoolError::ZeroSized);
    }
    let entry_words = (entry_size - 1) / WORD + 1;
    let capacity = DATA_WORDS / entry_words;
    if capacity == 0 {
      return Err(PoolError::EntryTooLarge {
        size: entry_size,
        max: DATA_WORDS * WORD,
      });
    }

    Ok(Self {
      lock: SpinLock::new(),
      shared: UnsafeCell::new(Shared {
        head: null_mut(),
        live_entries: 0,
        holders: 0,
      }),
      entry_words: entry_words as u32,
      capacity: capacity as u32,
      retention,
      source,
      runtime,
    })
  }

  /// Entries per holder for this entry size.
  pub fn holder_capacity(&self) -> usize {
    self.capacity as usize
  }

  /// Entry size in bytes as carved from the slab (word-rounded).
  pub fn entry_bytes(&self) -> usize {
    self.entry_words as usize * WORD
  }

  pub fn stats(&self) -> PoolStats {
    self.lock_shared();
    let shared = unsafe { &*self.shared.get() };
    let stats = PoolStats {
      live_entries: shared.live_entries,
      holders: shared.holders,
    };
    self.unlock_shared();
    stats
  }

  /// Exact slab bytes in use: header plus the entry array.
  #[inline]
  fn slab_bytes(&self) -> usize {
    HOLDER_HEADER_SIZE + self.entry_words as usize * self.capacity as usize * WORD
  }

  #[inline]
  fn lock_shared(&self) {
    self.lock.acquire(self.runtime.is_multi_threaded());
  }

  #[inline]
  fn unlock_shared(&self) {
    self.lock.release(self.runtime.is_multi_threaded());
  }

  /// Hand out one entry. The returned storage is uninitialized and belongs
  /// exclusively to the caller until passed back to [`Pool::free`].
  ///
  /// Never returns on unrecoverable out-of-memory; see
  /// [`RuntimeHooks::out_of_memory`].
  pub fn allocate(&self) -> NonNull<u8> {
    self.lock_shared();
    let entry = loop {
      let shared = unsafe { &mut *self.shared.get() };
      let holder = shared.head;
      if holder.is_null() {
        // Drops and retakes the lock; the list must be re-checked.
        unsafe { self.materialize() };
        continue;
      }

      // Linked holders always have at least one free entry.
      unsafe {
        let slot = (*holder).free_head;
        (*holder).free_head = (*slot).next;
        (*holder).free -= 1;
        if (*holder).free == 0 {
          unchain(shared, holder);
        }
        shared.live_entries += 1;
        break slot.cast::<u8>();
      }
    };
    self.unlock_shared();
    unsafe { NonNull::new_unchecked(entry) }
  }

  /// Return an entry to its holder.
  ///
  /// # Safety
  /// `entry` must come from a prior [`Pool::allocate`] on this pool, must not
  /// be freed twice, and the pool must not have moved since.
  pub unsafe fn free(&self, entry: NonNull<u8>) {
    let holder = holder_of(entry);
    debug_assert!(core::ptr::eq(unsafe { (*holder).pool }, self));
    unsafe { self.release_into(holder, entry) }
  }

  /// Ready list is empty: fetch a slab from the chunk source and install it
  /// as the new head. Called with the lock held; the lock is dropped around
  /// the source call (which may be slow) and re-held on return. Another
  /// thread may have installed a holder in the meantime, so the caller must
  /// re-check the list either way.
  unsafe fn materialize(&self) {
    let sz = self.slab_bytes();

    self.unlock_shared();
    let chunk = match unsafe { self.source.request(sz, SLAB_SIZE) } {
      Some(chunk) => chunk,
      None => {
        warn!("slabpool: {sz}-byte chunk request failed, triggering reclaim");
        let retry = if self.runtime.attempt_reclaim() {
          unsafe { self.source.request(sz, SLAB_SIZE) }
        } else {
          None
        };
        match retry {
          Some(chunk) => chunk,
          None => {
            error!("slabpool: out of memory, {sz}-byte chunk unavailable after reclaim");
            self.runtime.out_of_memory()
          }
        }
      }
    };
    self.lock_shared();

    let shared = unsafe { &mut *self.shared.get() };
    if !shared.head.is_null() {
      // Lost the race: another thread populated the list while the lock was
      // down. The spare chunk goes straight back; one warm slab is enough.
      unsafe { self.source.release(chunk, sz) };
      return;
    }

    debug_assert_eq!(chunk.as_ptr() as usize & !SLAB_ALIGN_MASK, 0);
    let holder = chunk.as_ptr().cast::<Holder>();
    unsafe {
      (*holder).free = self.capacity;
      (*holder).total = self.capacity;
      (*holder).pool = self;
      (*holder).fore = null_mut();
      (*holder).back = null_mut();

      // Chain each entry's leading word to the next entry; last link is null.
      let words = self.entry_words as usize;
      let base = holder_data(holder);
      let mut slot = base;
      for _ in 1..self.capacity {
        let next = slot.add(words);
        (*slot.cast::<FreeSlot>()).next = next.cast();
        slot = next;
      }
      (*slot.cast::<FreeSlot>()).next = null_mut();
      (*holder).free_head = base.cast();
    }
    shared.head = holder;
    shared.holders += 1;
    debug!(
      "slabpool: materialized holder {holder:p} ({} entries of {} words)",
      self.capacity, self.entry_words
    );
  }

  unsafe fn release_into(&self, holder: *mut Holder, entry: NonNull<u8>) {
    self.lock_shared();
    let shared = unsafe { &mut *self.shared.get() };
    unsafe {
      (*holder).free += 1;
      if (*holder).free == 1 {
        // Was full and unlinked. Front of the ready list: newly-freed-from
        // holders are reused first, keeping the working set concentrated.
        let prev = shared.head;
        (*holder).back = null_mut();
        (*holder).fore = prev;
        if !prev.is_null() {
          (*prev).back = holder;
        }
        shared.head = holder;
        // At most one fully idle holder is ever retained. If the displaced
        // head was the cached idle slab, this holder takes over that role
        // and the old one goes back to the source.
        if self.retention == Retention::Eager
          && !prev.is_null()
          && (*prev).free == (*prev).total
        {
          unchain(shared, prev);
          shared.holders -= 1;
          debug!("slabpool: releasing displaced idle holder {prev:p}");
          self
            .source
            .release(NonNull::new_unchecked(prev.cast()), self.slab_bytes());
        }
      } else if (*holder).free == (*holder).total
        && shared.head != holder
        && self.retention == Retention::Eager
      {
        // Fully idle and not the cached warm slab: give it back now.
        unchain(shared, holder);
        shared.holders -= 1;
        shared.live_entries -= 1;
        debug!("slabpool: releasing idle holder {holder:p}");
        self
          .source
          .release(NonNull::new_unchecked(holder.cast()), self.slab_bytes());
        self.unlock_shared();
        return;
      }

      let slot = entry.as_ptr().cast::<FreeSlot>();
      (*slot).next = (*holder).free_head;
      (*holder).free_head = slot;
    }
    shared.live_entries -= 1;
    self.unlock_shared();
  }

  /// Release every holder still on the ready list: the cached warm slab
  /// under [`Retention::Eager`], every kept slab under [`Retention::Keep`].
  /// Invoked once at runtime teardown, when no entries are live; not safe to
  /// call concurrently with `allocate`/`free`.
  pub unsafe fn finalize(&self) {
    let shared = unsafe { &mut *self.shared.get() };
    let mut holder = shared.head;
    shared.head = null_mut();
    while !holder.is_null() {
      let fore = unsafe { (*holder).fore };
      shared.holders -= 1;
      unsafe {
        self
          .source
          .release(NonNull::new_unchecked(holder.cast()), self.slab_bytes())
      };
      holder = fore;
    }
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    unsafe { self.finalize() };
  }
}

/// Return an entry without naming its pool: the owning holder is recovered by
/// address masking, the pool through the holder's back-reference.
///
/// # Safety
/// Same contract as [`Pool::free`].
pub unsafe fn free_entry(entry: NonNull<u8>) {
  let holder = holder_of(entry);
  unsafe {
    let pool = &*(*holder).pool;
    pool.release_into(holder, entry);
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================
