//! The `BUCKET_NUM x ARENA_NUM` matrix of chunk stacks: one intrusive,
//! mutex-protected singly-linked list of chunks per (class, arena)
//! pair.  Allocating from a class means claiming a slot from the
//! calling thread's favourite arena's stack; freeing means clearing
//! that slot's bit in whichever chunk it came from, under that
//! chunk's arena's mutex.
//!
//! Splitting each class across `ARENA_NUM` independent stacks, and
//! letting each thread stick to its own favourite arena, is what lets
//! unrelated threads allocate from the same class without fighting
//! over one mutex.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::affinity;
use crate::error;
use crate::mapper::{get_default_mapper, Mapper};
use crate::mill;
use crate::page::PageHeader;
use crate::size_class::{self, ClassIndex, ARENA_NUM, BUCKET_NUM};

/// `PageHeader` pointers cross thread boundaries (a thread can free
/// an object a different thread allocated), but every access happens
/// under the owning arena's mutex, so this is safe the same way the
/// teacher's intrusive stack types are: the mutex is the only path in.
struct ChunkHandle(NonNull<PageHeader>);
unsafe impl Send for ChunkHandle {}

#[derive(Default)]
struct ArenaStack {
    head: Option<ChunkHandle>,
}

pub struct Arenas {
    // Indexed [class][arena].
    stacks: Vec<Vec<Mutex<ArenaStack>>>,
}

impl Arenas {
    fn new() -> Self {
        let stacks = (0..BUCKET_NUM)
            .map(|_| (0..ARENA_NUM).map(|_| Mutex::new(ArenaStack::default())).collect())
            .collect();

        Arenas { stacks }
    }
}

pub fn get_arenas() -> &'static Arenas {
    lazy_static::lazy_static! {
        static ref ARENAS: Arenas = Arenas::new();
    }

    &ARENAS
}

/// Allocates one slot from `class`, milling a fresh chunk if every
/// chunk already linked into the favourite arena's stack is full.
#[requires(class < BUCKET_NUM)]
#[ensures(!ret.as_ptr().is_null())]
pub fn allocate(class: ClassIndex) -> NonNull<c_void> {
    let arenas = get_arenas();
    let mapper = get_default_mapper();

    let favorite = affinity::favorite(class);
    let (arena_index, mut guard) = match arenas.stacks[class][favorite as usize].try_lock() {
        Ok(guard) => (favorite, guard),
        Err(_) => {
            let next = affinity::advance(class);
            let guard = arenas.stacks[class][next as usize]
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            (next, guard)
        }
    };

    let chunk_bytes = size_class::chunk_mapping_size(class);
    let slot_count = PageHeader::slot_count(class, chunk_bytes);

    let mut cursor = guard.head.as_ref().map(|h| h.0);
    while let Some(header) = cursor {
        let header_ref = unsafe { &mut *header.as_ptr() };
        if let Some(slot) = header_ref.claim_free_slot(slot_count) {
            return unsafe { PageHeader::write_slot_prefix(header, class, slot, arena_index) };
        }
        cursor = header_ref.next_page();
    }

    // Every linked chunk (if any) is full: mill a new one and push it
    // to the front of this arena's stack.
    let milled = mill::reserve_chunk(mapper, class)
        .unwrap_or_else(|e| error::fatal_os("mmap", chunk_bytes, e));

    unsafe {
        (*milled.header.as_ptr()).set_next_page(guard.head.as_ref().map(|h| h.0));
    }
    guard.head = Some(ChunkHandle(milled.header));

    let slot = unsafe { (*milled.header.as_ptr()).claim_first_slot() };
    unsafe { PageHeader::write_slot_prefix(milled.header, class, slot, arena_index) }
}

/// Releases a previously allocated bucketed slot back to its arena.
///
/// # Safety
///
/// `ptr` must be a live allocation returned by `allocate`.
#[requires(!ptr.as_ptr().is_null())]
pub unsafe fn release(ptr: NonNull<c_void>) {
    let (header, arena_index, slot) = PageHeader::locate(ptr);

    if arena_index as usize >= ARENA_NUM {
        error::fatal_corruption(ptr.as_ptr(), arena_index);
    }

    let class_size = (*header.as_ptr()).class_size();
    let class = size_class::class_index_for_exact_size(class_size)
        .unwrap_or_else(|| error::fatal_corruption(ptr.as_ptr(), arena_index));

    let arenas = get_arenas();
    let _guard = arenas.stacks[class][arena_index as usize]
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());

    (*header.as_ptr()).release_slot(slot);
}

/// Eagerly mills one chunk per (class, arena) pair, mirroring the
/// original allocator's startup behaviour.  Purely a warm-up: `allocate`
/// mills chunks lazily on demand regardless of whether this ran.
pub fn prime_all(mapper: &dyn Mapper) {
    let arenas = get_arenas();

    for class in 0..BUCKET_NUM {
        for arena_index in 0..ARENA_NUM {
            let mut guard = arenas.stacks[class][arena_index].lock().unwrap();
            if guard.head.is_some() {
                continue;
            }

            let milled = mill::reserve_chunk(mapper, class)
                .unwrap_or_else(|e| error::fatal_os("mmap", size_class::chunk_mapping_size(class), e));
            guard.head = Some(ChunkHandle(milled.header));
        }
    }
}

/// Releases every chunk across every (class, arena) pair.  Called
/// from process teardown; logs and continues past individual
/// `munmap` failures instead of stopping early.
pub fn release_all(mapper: &dyn Mapper) {
    let arenas = get_arenas();

    for class in 0..BUCKET_NUM {
        let chunk_bytes = size_class::chunk_mapping_size(class);

        for arena_index in 0..ARENA_NUM {
            let mut guard = arenas.stacks[class][arena_index]
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());

            let mut cursor = guard.head.take().map(|h| h.0);
            while let Some(header) = cursor {
                let next = unsafe { (*header.as_ptr()).next_page() };
                if let Err(e) = unsafe { mill::release_chunk(mapper, header, chunk_bytes) } {
                    error::log_teardown_failure("munmap", e);
                }
                cursor = next;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_then_release_a_bucket() {
        let class = 3;
        let ptr = allocate(class);

        unsafe {
            std::ptr::write_bytes(ptr.as_ptr() as *mut u8, 0x42, size_class::CLASS_SIZES[class]);
            release(ptr);
        }
    }

    #[test]
    fn allocations_from_the_same_class_are_distinct() {
        let class = 4;
        let a = allocate(class);
        let b = allocate(class);

        assert_ne!(a.as_ptr(), b.as_ptr());

        unsafe {
            release(a);
            release(b);
        }
    }

    #[test]
    fn back_to_back_allocate_release_cycles_reuse_slots() {
        let class = 1;

        for _ in 0..256 {
            let ptr = allocate(class);
            unsafe { release(ptr) };
        }
    }
}
