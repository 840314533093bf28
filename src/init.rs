//! Process-wide startup and teardown.  These are exposed as two
//! `extern "C"` hooks rather than wired up automatically (e.g. via a
//! `__attribute__((constructor))`-style mechanism): the embedding
//! program decides when the allocator warms up and tears down, the
//! same way the teacher's `slitter_class_register` leaves class
//! registration to its caller instead of a static initializer.
use crate::arena;
use crate::mapper::get_default_mapper;

/// Eagerly mills one chunk per (class, arena) pair.  Calling this
/// before the first allocation avoids paying the mapping cost for the
/// first request on every arena; skipping it is also fine; `allocate`
/// mills chunks lazily on demand either way.
pub fn process_init() {
    arena::prime_all(get_default_mapper());
}

/// Releases every chunk this allocator has ever mapped back to the
/// OS.  Meant to run once, at process shutdown, after every
/// outstanding allocation has already been freed by its owner.
pub fn process_fini() {
    arena::release_all(get_default_mapper());
}

/// # Safety
///
/// Must be called at most once, before any other `gristmill_*`
/// function, from a single thread.
#[no_mangle]
pub unsafe extern "C" fn gristmill_process_init() {
    process_init();
}

/// # Safety
///
/// Must be called at most once, after every allocation has been
/// freed and no other `gristmill_*` function is still running.
#[no_mangle]
pub unsafe extern "C" fn gristmill_process_fini() {
    process_fini();
}
