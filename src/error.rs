//! Centralises the two kinds of failures this allocator can hit: the
//! operating system refusing a mapping request, and an internal
//! invariant (an encoded size, an arena flag) turning out to be
//! corrupt.  Both are fatal: there is no sensible way to keep serving
//! allocations once either happens, so we log and abort rather than
//! return an error a caller could ignore.
use errno::Errno;
use std::ffi::c_void;

/// Reports an operating-system failure and aborts the process.
///
/// `context` names the syscall that failed (e.g. "mmap", "madvise"),
/// `size` is the request that triggered it.
pub(crate) fn fatal_os(context: &str, size: usize, errno: Errno) -> ! {
    log::error!("gristmill: {} failed for size={}: {}", context, size, errno);
    std::process::abort()
}

/// Reports a corrupted arena flag or header and aborts the process.
///
/// This fires when `free`/`resize` are handed a pointer whose
/// one-byte prefix doesn't decode to either the large-allocation
/// sentinel or a valid arena index: the metadata preceding the
/// pointer has been overwritten or the pointer never came from this
/// allocator.
pub(crate) fn fatal_corruption(ptr: *const c_void, flag: u8) -> ! {
    log::error!("gristmill: corrupt allocation header at {:p}, flag={:#x}", ptr, flag);
    std::process::abort()
}

/// Logs a non-fatal failure to release memory back to the OS during
/// teardown.  We keep releasing the remaining arenas rather than bail
/// out early.
pub(crate) fn log_teardown_failure(context: &str, errno: Errno) {
    log::warn!("gristmill: {} failed during teardown: {}", context, errno);
}

pub(crate) fn last_errno() -> Errno {
    errno::errno()
}
