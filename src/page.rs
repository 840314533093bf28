//! The page header sits at the front of every chunk mapped for a
//! bucketed size class: a byte recording which class the chunk
//! serves, a link to the next chunk in the same arena's stack, a
//! rolling cursor into the free-slot bitmap, and the bitmap itself.
//!
//! Allocating a slot means finding a clear bit in the bitmap and
//! setting it; freeing one means clearing that bit again.  Both
//! operations happen under the arena's mutex (see `arena`), so the
//! header itself needs no internal synchronisation.
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

use static_assertions::const_assert;

use crate::size_class::{self, ClassIndex, BUCKET_METADATA_SIZE, CLASS_SIZES};

/// Number of `u64` words in the free-slot bitmap.  Sized so that even
/// the smallest class (8 bytes, the largest possible slot count for
/// a given chunk size) never runs out of bitmap bits.
const BITMAP_LONGS: usize = 2497;

const MSB: u64 = 0x8000_0000_0000_0000;
const BITS_PER_WORD: u32 = 64;

#[repr(C)]
pub struct PageHeader {
    /// This chunk's class size, `size_class::encode_size`d.
    size: u8,
    next_page: Option<NonNull<PageHeader>>,
    last_offset: u32,
    bitmap: [u64; BITMAP_LONGS],
}

const_assert!(std::mem::size_of::<PageHeader>() <= size_class::HEADER_PAGES_NEEDED * size_class::SMALL_PAGE);

impl PageHeader {
    /// Size in bytes of the header itself (size + next_page + last_offset + bitmap).
    pub const fn header_size() -> usize {
        std::mem::size_of::<PageHeader>()
    }

    /// Initialises a freshly mapped chunk's header in place.  The
    /// chunk's bytes are assumed to be zero-filled already (fresh
    /// anonymous mappings are), so the bitmap and `last_offset` need
    /// no explicit clearing.
    ///
    /// # Safety
    ///
    /// `base` must point at the start of a chunk mapping at least
    /// `Self::header_size()` bytes long.
    pub unsafe fn init(base: NonNull<c_void>, class: ClassIndex, next_page: Option<NonNull<PageHeader>>) -> NonNull<PageHeader> {
        let header = base.as_ptr() as *mut PageHeader;
        (*header).size = size_class::encode_size(CLASS_SIZES[class]);
        (*header).next_page = next_page;
        (*header).last_offset = 0;
        NonNull::new_unchecked(header)
    }

    pub fn class_size(&self) -> usize {
        size_class::decode_size(self.size)
    }

    pub fn next_page(&self) -> Option<NonNull<PageHeader>> {
        self.next_page
    }

    pub fn set_next_page(&mut self, next: Option<NonNull<PageHeader>>) {
        self.next_page = next;
    }

    /// Number of slots a chunk of `chunk_bytes` can hold for `class`.
    pub fn slot_count(class: ClassIndex, chunk_bytes: usize) -> u32 {
        let stride = CLASS_SIZES[class] + BUCKET_METADATA_SIZE;
        let usable = chunk_bytes - Self::header_size();

        (usable / stride) as u32
    }

    /// Scans the bitmap starting just after `last_offset`, looking
    /// for a clear bit.  On success, claims that slot (sets its bit,
    /// updates `last_offset`) and returns its index.
    ///
    /// All cursor arithmetic -- the "next bit" step and the "skip a
    /// fully-set word" step alike -- is taken modulo `slot_count`, so
    /// the cursor never walks into the zero-padded tail of a bitmap
    /// whose `slot_count` isn't a multiple of 64.
    #[requires(slot_count as usize <= BITMAP_LONGS * BITS_PER_WORD as usize)]
    #[ensures(ret.map_or(true, |slot| slot < slot_count))]
    pub fn claim_free_slot(&mut self, slot_count: u32) -> Option<u32> {
        if slot_count == 0 {
            return None;
        }

        let mut offset = (self.last_offset + 1) % slot_count;

        while offset != self.last_offset {
            let word = (offset / BITS_PER_WORD) as usize;
            let shift = offset % BITS_PER_WORD;

            if shift == 0 && self.bitmap[word] == u64::MAX {
                offset = (offset + BITS_PER_WORD) % slot_count;
                continue;
            }

            if self.bitmap[word] & (MSB >> shift) == 0 {
                self.last_offset = offset;
                self.bitmap[word] |= MSB >> shift;
                return Some(offset);
            }

            offset = (offset + 1) % slot_count;
        }

        None
    }

    /// Claims slot 0 of a brand new chunk.  Callers only use this
    /// right after `init`, when the bitmap is all zero.
    pub fn claim_first_slot(&mut self) -> u32 {
        self.last_offset = 0;
        self.bitmap[0] |= MSB;
        0
    }

    /// Clears the bit for `offset`, returning it to the free list.
    #[requires((offset / BITS_PER_WORD) < BITMAP_LONGS as u32)]
    pub fn release_slot(&mut self, offset: u32) {
        let word = (offset / BITS_PER_WORD) as usize;
        let shift = offset % BITS_PER_WORD;

        self.bitmap[word] &= !(MSB >> shift);
    }

    /// Byte offset from the header's base to the metadata prefix of `slot`.
    pub fn slot_metadata_offset(class: ClassIndex, slot: u32) -> usize {
        Self::header_size() + (slot as usize) * (CLASS_SIZES[class] + BUCKET_METADATA_SIZE)
    }

    /// Writes the self-describing prefix (chunk-relative offset +
    /// arena index) for `slot` and returns the user-visible pointer
    /// just past it.
    ///
    /// # Safety
    ///
    /// `header` must point at a chunk with room for `slot` under
    /// `class`'s layout.
    pub unsafe fn write_slot_prefix(
        header: NonNull<PageHeader>,
        class: ClassIndex,
        slot: u32,
        arena_index: u8,
    ) -> NonNull<c_void> {
        let metadata_offset = Self::slot_metadata_offset(class, slot);
        let metadata_ptr = (header.as_ptr() as *mut u8).add(metadata_offset);

        std::ptr::write_unaligned(metadata_ptr as *mut u32, metadata_offset as u32);
        std::ptr::write(metadata_ptr.add(4), arena_index);

        NonNull::new_unchecked(metadata_ptr.add(BUCKET_METADATA_SIZE) as *mut c_void)
    }

    /// Recovers a slot's header pointer, arena index, and slot index
    /// from a user pointer previously returned by `write_slot_prefix`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation obtained from this allocator's
    /// bucketed path.
    pub unsafe fn locate(ptr: NonNull<c_void>) -> (NonNull<PageHeader>, u8, u32) {
        let metadata_ptr = (ptr.as_ptr() as *mut u8).sub(BUCKET_METADATA_SIZE);
        let metadata_offset = std::ptr::read_unaligned(metadata_ptr as *const u32) as usize;
        let arena_index = std::ptr::read(metadata_ptr.add(4));

        let header_ptr = (metadata_ptr as usize - metadata_offset) as *mut PageHeader;
        let header = NonNull::new_unchecked(header_ptr);

        let class = size_class::class_index_for_exact_size((*header_ptr).class_size())
            .expect("page header must carry a valid encoded class size");
        let stride = CLASS_SIZES[class] + BUCKET_METADATA_SIZE;
        let slot = ((metadata_offset - Self::header_size()) / stride) as u32;

        (header, arena_index, slot)
    }
}
