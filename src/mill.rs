//! The page mapper: turns a size class into a freshly reserved chunk
//! of address space, with a live header and every page past the
//! header immediately madvised away so the chunk's huge virtual
//! reservation costs far less physical memory than its address-space
//! footprint suggests.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::mapper::Mapper;
use crate::page::PageHeader;
use crate::size_class::{self, ClassIndex};

/// A freshly mapped chunk, ready to have its header linked into an
/// arena's stack.
pub struct MilledChunk {
    pub header: NonNull<PageHeader>,
    pub chunk_bytes: usize,
}

/// Reserves and initialises a new chunk for `class`.
///
/// The chunk is `size_class::chunk_mapping_size(class)` bytes, backed
/// from the start (so the header pages are real memory), with
/// everything after `HEADER_PAGES_NEEDED` pages immediately advised
/// `MADV_DONTNEED`: the kernel can reclaim that physical memory right
/// away, and will fault fresh zeroed pages back in only as slots in
/// that region actually get touched.
pub fn reserve_chunk(mapper: &dyn Mapper, class: ClassIndex) -> Result<MilledChunk, errno::Errno> {
    let chunk_bytes = size_class::chunk_mapping_size(class);
    debug_assert_eq!(chunk_bytes % mapper.page_size(), 0);

    let base = mapper.reserve(chunk_bytes)?;

    let header_bytes = size_class::HEADER_PAGES_NEEDED * size_class::SMALL_PAGE;
    debug_assert!(header_bytes >= PageHeader::header_size());
    debug_assert!(chunk_bytes > header_bytes);

    let dontneed_base = unsafe { (base.as_ptr() as *mut u8).add(header_bytes) };
    mapper.advise_dont_need(
        NonNull::new(dontneed_base as *mut c_void).expect("offset pointer is non-null"),
        chunk_bytes - header_bytes,
    )?;

    let header = unsafe { PageHeader::init(base, class, None) };

    Ok(MilledChunk { header, chunk_bytes })
}

/// Releases a chunk previously returned by `reserve_chunk` (or linked
/// from one): the whole `chunk_bytes`-byte region starting at
/// `header` is returned to the OS.
///
/// # Safety
///
/// `header` must be the base address of a chunk obtained from
/// `reserve_chunk`, not yet released.
pub unsafe fn release_chunk(
    mapper: &dyn Mapper,
    header: NonNull<PageHeader>,
    chunk_bytes: usize,
) -> Result<(), errno::Errno> {
    mapper.release(NonNull::new_unchecked(header.as_ptr() as *mut c_void), chunk_bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::get_default_mapper;

    #[test]
    fn reserve_and_release_a_chunk() {
        let mapper = get_default_mapper();
        let class = 0;

        let chunk = reserve_chunk(mapper, class).expect("reserve should succeed");
        assert_eq!(chunk.chunk_bytes, size_class::chunk_mapping_size(class));

        unsafe {
            assert_eq!((*chunk.header.as_ptr()).class_size(), size_class::CLASS_SIZES[class]);
            release_chunk(mapper, chunk.header, chunk.chunk_bytes).expect("release should succeed");
        }
    }
}
