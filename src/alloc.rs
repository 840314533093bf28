//! The allocation front end: dispatches `allocate`/`free`/`resize`
//! requests to either the bucketed arena path or the large-allocation
//! path, based on the requested size, and recovers that same
//! dispatch decision on `free`/`resize` from the one-byte flag every
//! live allocation carries just before its user pointer.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::arena;
use crate::error;
use crate::large;
use crate::mapper::get_default_mapper;
use crate::page::PageHeader;
use crate::size_class::{self, ARENA_NUM, NON_BUCKET_FLAG};

/// Allocates `n` bytes.  Requests above `BUCKET_MAX` go straight to
/// the large-allocation path; everything else is rounded up to the
/// smallest bucket that fits (so `n == 0` transparently gets the
/// minimum bucket).
///
/// Never returns null: an unsatisfiable OS mapping request is fatal
/// (see `error::fatal_os`), matching this allocator's "out of
/// virtual address space is unrecoverable" stance.
pub fn allocate(n: usize) -> NonNull<c_void> {
    match size_class::class_for_size(n) {
        Some(class) => arena::allocate(class),
        None => large::allocate(get_default_mapper(), n),
    }
}

/// Frees a previously allocated pointer.  `None` is a no-op, matching
/// `free(NULL)`.
///
/// # Safety
///
/// `ptr`, if present, must be a live allocation returned by `allocate`
/// or `resize`, not already freed.
pub unsafe fn free(ptr: Option<NonNull<c_void>>) {
    let ptr = match ptr {
        Some(ptr) => ptr,
        None => return,
    };

    let flag = std::ptr::read((ptr.as_ptr() as *const u8).sub(1));

    if flag == NON_BUCKET_FLAG {
        large::release(get_default_mapper(), ptr);
    } else if (flag as usize) < ARENA_NUM {
        arena::release(ptr);
    } else {
        error::fatal_corruption(ptr.as_ptr(), flag);
    }
}

/// Resizes a previously allocated pointer to `n` bytes, preserving
/// the shorter of the old and new sizes' worth of data.
///
/// `prev == None` returns `None` rather than behaving like
/// `allocate(n)`: unlike libc's `realloc`, this allocator never
/// treats a resize of nothing as an allocation.  Callers that want
/// `realloc`'s "NULL means malloc" convenience must check for it
/// themselves.
///
/// # Safety
///
/// `prev`, if present, must be a live allocation returned by
/// `allocate` or `resize`, not already freed.
pub unsafe fn resize(prev: Option<NonNull<c_void>>, n: usize) -> Option<NonNull<c_void>> {
    let prev = prev?;

    let flag = std::ptr::read((prev.as_ptr() as *const u8).sub(1));

    if flag == NON_BUCKET_FLAG {
        let (_, mapped_size) = large::locate(prev);
        let prev_payload = mapped_size - size_class::NON_BUCKET_METADATA_SIZE;

        if large::should_keep_in_place(prev_payload, n) {
            return Some(prev);
        }

        let new_ptr = allocate(n);
        let copy_len = n.min(prev_payload);
        std::ptr::copy_nonoverlapping(prev.as_ptr() as *const u8, new_ptr.as_ptr() as *mut u8, copy_len);
        free(Some(prev));

        return Some(new_ptr);
    }

    if (flag as usize) >= ARENA_NUM {
        error::fatal_corruption(prev.as_ptr(), flag);
    }

    let (header, _arena_index, _slot) = PageHeader::locate(prev);
    let prev_size = (*header.as_ptr()).class_size();

    let shrinking_too_far = n < (prev_size * 2 / 3) && prev_size != size_class::BUCKET_MIN;
    if n > size_class::BUCKET_MAX || n > prev_size || shrinking_too_far {
        let new_ptr = allocate(n);
        let copy_len = n.min(prev_size);
        std::ptr::copy_nonoverlapping(prev.as_ptr() as *const u8, new_ptr.as_ptr() as *mut u8, copy_len);
        free(Some(prev));

        return Some(new_ptr);
    }

    Some(prev)
}

/// # Safety
///
/// See `allocate`.
#[no_mangle]
pub unsafe extern "C" fn gristmill_allocate(n: usize) -> *mut c_void {
    allocate(n).as_ptr()
}

/// # Safety
///
/// `ptr` must be NULL or a live allocation from this allocator.
#[no_mangle]
pub unsafe extern "C" fn gristmill_free(ptr: *mut c_void) {
    free(NonNull::new(ptr));
}

/// # Safety
///
/// `prev` must be NULL or a live allocation from this allocator.
#[no_mangle]
pub unsafe extern "C" fn gristmill_resize(prev: *mut c_void, n: usize) -> *mut c_void {
    resize(NonNull::new(prev), n).map_or(std::ptr::null_mut(), |p| p.as_ptr())
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn smoke_bucketed_and_large() {
        unsafe {
            let small = allocate(64);
            std::ptr::write_bytes(small.as_ptr() as *mut u8, 1, 64);
            free(Some(small));

            let large = allocate(1 << 20);
            std::ptr::write_bytes(large.as_ptr() as *mut u8, 2, 1 << 20);
            free(Some(large));
        }
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        unsafe { free(None) };
    }

    #[test]
    fn resize_of_null_returns_none() {
        unsafe { assert_eq!(resize(None, 64), None) };
    }

    #[test]
    fn resize_bucketed_in_place_when_shrink_is_small() {
        unsafe {
            let ptr = allocate(120); // class 128
            let resized = resize(Some(ptr), 100).expect("should keep the same bucket");
            assert_eq!(resized.as_ptr(), ptr.as_ptr());
            free(Some(resized));
        }
    }

    #[test]
    fn resize_bucketed_moves_on_large_shrink() {
        unsafe {
            let ptr = allocate(192);
            let resized = resize(Some(ptr), 9).expect("should reallocate into a smaller class");
            free(Some(resized));
        }
    }

    #[test]
    fn resize_large_in_place_within_hysteresis() {
        unsafe {
            let ptr = allocate(1 << 20);
            let resized = resize(Some(ptr), (1 << 20) - 16).expect("small shrink stays in place");
            assert_eq!(resized.as_ptr(), ptr.as_ptr());
            free(Some(resized));
        }
    }

    fn check_new_allocation(current: &[NonNull<c_void>], new: NonNull<c_void>) -> bool {
        current.iter().all(|x| x.as_ptr() != new.as_ptr())
    }

    proptest! {
        // Bulk allocate across a mix of classes, then free and
        // reallocate in random-ish order.
        #[test]
        fn random_order(indices in prop::collection::vec(0..20usize, 1..80), sizes in prop::collection::vec(1..9000usize, 20)) {
            let slots: &mut Vec<Option<NonNull<c_void>>> = Box::leak(Box::new(Vec::new()));

            slots.resize_with(20, || None);
            for i in 0..20 {
                slots[i] = Some(allocate(sizes[i]));
            }

            for index in indices.iter().cloned() {
                if let Some(alloc) = slots[index].take() {
                    unsafe { free(Some(alloc)) };
                } else {
                    let new_alloc = allocate(sizes[index]);
                    prop_assert!(check_new_allocation(
                        &slots.iter().filter_map(|x| *x).collect::<Vec<_>>(),
                        new_alloc
                    ));
                    slots[index] = Some(new_alloc);
                }
            }

            for slot in slots.iter_mut() {
                if let Some(freed) = slot.take() {
                    unsafe { free(Some(freed)) };
                }
            }

            unsafe { Box::from_raw(slots as *mut _); }
        }

        // Stack-order allocate/free across both the bucketed and the
        // large path.
        #[test]
        fn lifo(push_pop in prop::collection::vec(prop::bool::ANY, 2..80), size in 1..200000usize) {
            let stack: &mut Vec<NonNull<c_void>> = Box::leak(Box::new(Vec::new()));

            for alloc in push_pop.iter().cloned() {
                if alloc {
                    let block = allocate(size);
                    prop_assert!(check_new_allocation(stack, block));
                    stack.push(block);
                } else if let Some(freed) = stack.pop() {
                    unsafe { free(Some(freed)) };
                }
            }

            while let Some(freed) = stack.pop() {
                unsafe { free(Some(freed)) };
            }

            unsafe { Box::from_raw(stack as *mut _); }
        }
    }

    // Concurrent allocate/free spread across several distinct size
    // classes, each driven by a couple of threads.
    #[test]
    fn concurrent_allocate_and_free() {
        let threads: Vec<_> = (0..(ARENA_NUM * 2))
            .map(|i| {
                std::thread::spawn(move || {
                    let size = 8 << (i % 10);
                    for _ in 0..200 {
                        let ptr = allocate(size);
                        unsafe {
                            std::ptr::write_bytes(ptr.as_ptr() as *mut u8, i as u8, size.min(64));
                            free(Some(ptr));
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().expect("worker thread should not panic");
        }
    }

    // More threads than arenas all contend for the *same* size class,
    // so the favourite-arena try-lock is guaranteed to fail for some
    // threads and force the advance-once-then-block fallback.
    #[test]
    fn concurrent_allocate_and_free_same_class() {
        const THREAD_COUNT: usize = ARENA_NUM + 1;
        let size = 64;

        let threads: Vec<_> = (0..THREAD_COUNT)
            .map(|i| {
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let ptr = allocate(size);
                        unsafe {
                            std::ptr::write_bytes(ptr.as_ptr() as *mut u8, i as u8, size);
                            free(Some(ptr));
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().expect("worker thread should not panic");
        }
    }
}
