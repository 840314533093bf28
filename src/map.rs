//! Thin wrappers over the raw OS primitives this allocator needs:
//! reserving address space, releasing it, and toggling a range's
//! physical backing with `madvise(MADV_DONTNEED)`.  Grounded directly
//! on `libc`, the way a userspace allocator written in Rust reaches
//! for these syscalls (rather than shimming through hand-written C,
//! the way the allocator this module replaces used to).
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::error;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        error::fatal_os("sysconf(_SC_PAGESIZE)", 0, error::last_errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Reserves an anonymous, private address-space region of `size`
/// bytes, readable and writable from the start.
///
/// `size` must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, errno::Errno> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "bad region size={} page_size={}",
        size,
        page_size()
    );

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(error::last_errno());
    }

    Ok(NonNull::new(ptr).expect("mmap returned a non-null pointer on success"))
}

/// Releases a region of `size` bytes starting at `base`, previously
/// obtained from `reserve_region`.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), errno::Errno> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(error::last_errno())
    }
}

/// Advises the kernel that the `size` bytes starting at `base` are no
/// longer needed: it may drop their physical backing, but the
/// address-space reservation remains valid and will demand-page
/// zeroed memory again on next touch.
pub fn advise_dont_need(base: NonNull<c_void>, size: usize) -> Result<(), errno::Errno> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (base.as_ptr() as usize % page_size()) == 0 && (size % page_size()) == 0,
        "bad range base={:p} size={} page_size={}",
        base.as_ptr(),
        size,
        page_size()
    );

    let ret = unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) };

    if ret == 0 {
        Ok(())
    } else {
        Err(error::last_errno())
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert_eq!(page_size(), 4096);
}

#[test]
fn smoke_test() {
    let size = 4 * page_size();
    let base = reserve_region(size).expect("reserve should succeed");

    advise_dont_need(base, size).expect("madvise should succeed");
    release_region(base, size).expect("release should succeed");
}
