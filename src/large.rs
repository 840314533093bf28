//! The large-allocation path: requests bigger than `BUCKET_MAX` skip
//! the bucket/arena machinery entirely and get their own direct OS
//! mapping, prefixed with an 8-byte size field and the `NON_BUCKET_FLAG`
//! sentinel byte instead of a bucket's 5-byte offset+arena prefix.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::error;
use crate::mapper::Mapper;
use crate::size_class::{NON_BUCKET_FLAG, NON_BUCKET_METADATA_SIZE, SMALL_PAGE};

fn round_up_to_page(size: usize) -> usize {
    let rem = size % SMALL_PAGE;
    if rem == 0 {
        size
    } else {
        size + (SMALL_PAGE - rem)
    }
}

/// Maps and initialises a large allocation for `requested` bytes.
/// Returns the user-visible pointer, just past the metadata prefix.
pub fn allocate(mapper: &dyn Mapper, requested: usize) -> NonNull<c_void> {
    let mapped_size = round_up_to_page(requested + NON_BUCKET_METADATA_SIZE);

    let base = mapper
        .reserve(mapped_size)
        .unwrap_or_else(|e| error::fatal_os("mmap", mapped_size, e));

    unsafe {
        std::ptr::write_unaligned(base.as_ptr() as *mut usize, mapped_size);
        let flag_ptr = (base.as_ptr() as *mut u8).add(std::mem::size_of::<usize>());
        std::ptr::write(flag_ptr, NON_BUCKET_FLAG);

        NonNull::new_unchecked(flag_ptr.add(1) as *mut c_void)
    }
}

/// Recovers the mapping's base address and total mapped size (the
/// user payload plus the metadata prefix, rounded up to a page) from
/// a user pointer returned by `allocate`.
///
/// # Safety
///
/// `ptr` must be a live large allocation.
pub unsafe fn locate(ptr: NonNull<c_void>) -> (NonNull<c_void>, usize) {
    let base = (ptr.as_ptr() as *mut u8).sub(NON_BUCKET_METADATA_SIZE);
    let mapped_size = std::ptr::read_unaligned(base as *const usize);

    (NonNull::new_unchecked(base as *mut c_void), mapped_size)
}

/// Releases a large allocation back to the OS.
///
/// # Safety
///
/// `ptr` must be a live large allocation, not already released.
pub unsafe fn release(mapper: &dyn Mapper, ptr: NonNull<c_void>) {
    let (base, mapped_size) = locate(ptr);

    mapper
        .release(base, mapped_size)
        .unwrap_or_else(|e| error::fatal_os("munmap", mapped_size, e));
}

/// Decides whether a large allocation should be resized in place.
///
/// Mirrors the original allocator's hysteresis: grow always
/// reallocates, but shrinking only reallocates once the new request
/// drops below three quarters of the currently usable payload, so a
/// caller that oscillates around one size doesn't thrash mappings.
///
/// `payload_capacity` is the mapping's usable size, i.e. `mapped_size
/// - NON_BUCKET_METADATA_SIZE`, not the raw mapped size: the user
/// pointer starts past the metadata prefix, so that prefix is never
/// writable space a caller can be told to keep.
pub fn should_keep_in_place(payload_capacity: usize, requested: usize) -> bool {
    requested <= payload_capacity && requested >= (payload_capacity * 3 / 4)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::get_default_mapper;

    #[test]
    fn allocate_then_release() {
        let mapper = get_default_mapper();
        let ptr = allocate(mapper, 1 << 20);

        unsafe {
            std::ptr::write_bytes(ptr.as_ptr() as *mut u8, 0x7, 1 << 20);
            release(mapper, ptr);
        }
    }

    #[test]
    fn resize_hysteresis() {
        let mapped = round_up_to_page(1_000_000 + NON_BUCKET_METADATA_SIZE);
        let payload = mapped - NON_BUCKET_METADATA_SIZE;

        assert!(should_keep_in_place(payload, payload));
        assert!(should_keep_in_place(payload, payload * 3 / 4));
        assert!(!should_keep_in_place(payload, payload * 3 / 4 - 1));
        assert!(!should_keep_in_place(payload, payload + 1));
    }
}
