//! A `Mapper` is responsible for acquiring address space and backing
//! memory from the operating system.  `mill` is parameterised on a
//! `Mapper` so the chunk-carving logic stays testable without
//! touching real mappings.
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

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this mapper.  All calls
    /// into the mapper align addresses and sizes to that page size.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Reserves a range of address space at least `size` bytes long,
    /// readable and writable from the start.  `size` must already be
    /// a multiple of `page_size()`.
    #[requires(size > 0 && size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() != std::ptr::null_mut())]
    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, errno::Errno>;

    /// Releases a range that was previously obtained with a single
    /// call to `reserve`.
    #[requires(size % self.page_size() == 0)]
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), errno::Errno>;

    /// Advises the kernel that `[base, base + size)` no longer holds
    /// live data: the address range stays reserved, but its physical
    /// backing may be dropped.
    #[requires(size % self.page_size() == 0)]
    fn advise_dont_need(&self, base: NonNull<c_void>, size: usize) -> Result<(), errno::Errno>;
}

#[derive(Debug)]
pub(crate) struct DefaultMapper {}

impl DefaultMapper {
    pub(crate) const fn new() -> Self {
        Self {}
    }
}

#[contract_trait]
impl Mapper for DefaultMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, errno::Errno> {
        crate::map::reserve_region(size)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), errno::Errno> {
        crate::map::release_region(base, size)
    }

    fn advise_dont_need(&self, base: NonNull<c_void>, size: usize) -> Result<(), errno::Errno> {
        crate::map::advise_dont_need(base, size)
    }
}

/// Returns the process-wide default mapper.
pub fn get_default_mapper() -> &'static dyn Mapper {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: DefaultMapper = DefaultMapper::new();
    };

    &*DEFAULT_MAPPER
}
