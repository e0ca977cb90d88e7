//! Debug object layout.
//!
//! ```text
//! base                 payload                     payload+size        block end
//!  | back_ptr | label | len | line | size | start | user bytes ... | END | pad | END |
//!  '-------------------- header --------------------'                 '-- last word --'
//! ```
//!
//! `start` holds `START_FLAG ^ payload`. The trailing `END_FLAG ^ payload`
//! canary sits immediately after the requested bytes (unaligned) and again
//! in the last word of the block. Freeing overwrites `size` with the true
//! block size, which can never be a valid requested size.

use std::mem::{offset_of, size_of};

use crate::heap::{GRANULE, Heap, WORD};
use crate::hidden::HiddenPointer;

/// Header prepended to every debug allocation.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct DebugHeader {
    pub(crate) back_ptr: HiddenPointer,
    pub(crate) label_ptr: usize,
    pub(crate) label_len: usize,
    pub(crate) line: usize,
    pub(crate) size: usize,
    pub(crate) start_flag: usize,
}

/// Bytes between an object's base and the pointer handed to the client.
pub const HEADER_SIZE: usize = size_of::<DebugHeader>();

/// Extra bytes requested from the heap for every debug allocation.
pub const DEBUG_BYTES: usize = HEADER_SIZE + 2 * WORD;

const _: () = assert!(HEADER_SIZE % GRANULE == 0);

pub(crate) const START_FLAG: usize = 0xFEDC_EDCB_FEDC_EDCBu64 as usize;
pub(crate) const END_FLAG: usize = 0xBCDE_CDEF_BCDE_CDEFu64 as usize;

/// Pattern written over the payload of freed objects that are retained.
pub const FREED_MEM_MARKER: usize = 0xEFBE_ADDE_DEAD_BEEFu64 as usize;

/// Where a debug allocation was requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSite {
    /// Source label, usually a file name
    pub label: &'static str,
    /// Line number
    pub line: u32,
}

impl AllocSite {
    /// Site used when the caller supplies none.
    pub const UNKNOWN: AllocSite = AllocSite::new("unknown", 0);

    /// Build a site from an explicit label and line.
    pub const fn new(label: &'static str, line: u32) -> Self {
        Self { label, line }
    }

    /// The calling source location.
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self::new(location.file(), location.line())
    }
}

/// Debug-info state of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugInfo {
    /// No recognizable debug header
    None,
    /// Live debug object
    Live,
    /// Debug object that was freed
    Freed,
}

#[inline]
pub(crate) fn payload_of(base: usize) -> usize {
    base + HEADER_SIZE
}

#[inline]
pub(crate) fn size_field_addr(base: usize) -> usize {
    base + offset_of!(DebugHeader, size)
}

/// Read the header at `base`.
///
/// # Safety
/// `base` must be a live heap object of at least `HEADER_SIZE` bytes.
#[inline]
pub(crate) unsafe fn read_header(base: usize) -> DebugHeader {
    unsafe { std::ptr::read(base as *const DebugHeader) }
}

/// # Safety
/// Same as [`read_header`].
#[inline]
pub(crate) unsafe fn header_mut<'a>(base: usize) -> &'a mut DebugHeader {
    unsafe { &mut *(base as *mut DebugHeader) }
}

#[inline]
unsafe fn read_word(addr: usize) -> usize {
    unsafe { std::ptr::read(addr as *const usize) }
}

/// Write the header and both end canaries into a fresh block. Returns the
/// payload address.
///
/// # Safety
/// `base` must be a live heap object of at least `size + DEBUG_BYTES` bytes
/// whose true size is `block_size`.
pub(crate) unsafe fn store_debug_info(
    base: usize,
    block_size: usize,
    size: usize,
    site: AllocSite,
) -> usize {
    let payload = payload_of(base);
    let end = END_FLAG ^ payload;
    unsafe {
        std::ptr::write(
            base as *mut DebugHeader,
            DebugHeader {
                back_ptr: HiddenPointer::NOT_MARKED,
                label_ptr: site.label.as_ptr() as usize,
                label_len: site.label.len(),
                line: site.line as usize,
                size,
                start_flag: START_FLAG ^ payload,
            },
        );
        std::ptr::write_unaligned((payload + size) as *mut usize, end);
        std::ptr::write((base + block_size - WORD) as *mut usize, end);
    }
    payload
}

/// Classify the object at `base`.
pub fn has_debug_info<H: Heap + ?Sized>(heap: &H, base: usize) -> DebugInfo {
    let Some(block_size) = heap.object_size(base) else {
        return DebugInfo::None;
    };
    if block_size < DEBUG_BYTES {
        return DebugInfo::None;
    }
    let payload = payload_of(base);
    // SAFETY: the block is live and larger than the header.
    let (header, last) = unsafe { (read_header(base), read_word(base + block_size - WORD)) };
    if header.start_flag != START_FLAG ^ payload && last != END_FLAG ^ payload {
        return DebugInfo::None;
    }
    if header.size == block_size {
        return DebugInfo::Freed;
    }
    DebugInfo::Live
}

/// Validate the header and canaries of the debug object at `base`.
///
/// Returns the first clobbered address, or `None` if the object is intact.
pub fn check_annotated_object<H: Heap + ?Sized>(heap: &H, base: usize) -> Option<usize> {
    let block_size = heap.object_size(base)?;
    if block_size < DEBUG_BYTES {
        return Some(size_field_addr(base));
    }
    let payload = payload_of(base);
    let end = END_FLAG ^ payload;

    // SAFETY: the block is live and at least DEBUG_BYTES long; the trailing
    // canary is only read once `size` has been checked against the block.
    unsafe {
        let header = read_header(base);
        if header.size.saturating_add(DEBUG_BYTES) > block_size {
            return Some(size_field_addr(base));
        }
        if header.start_flag != START_FLAG ^ payload {
            return Some(base + offset_of!(DebugHeader, start_flag));
        }
        let last = base + block_size - WORD;
        if read_word(last) != end {
            return Some(last);
        }
        let trailer = payload + header.size;
        if std::ptr::read_unaligned(trailer as *const usize) != end {
            return Some(first_mismatch(trailer, end));
        }
    }
    None
}

/// Address of the first byte of the word at `addr` that differs from
/// `expected`.
unsafe fn first_mismatch(addr: usize, expected: usize) -> usize {
    let actual = unsafe { std::ptr::read_unaligned(addr as *const usize) };
    let actual = actual.to_ne_bytes();
    let expected = expected.to_ne_bytes();
    let offset = actual
        .iter()
        .zip(expected.iter())
        .position(|(a, e)| a != e)
        .unwrap_or(0);
    addr + offset
}

/// Longest label read back from a header.
pub const MAX_LABEL_LEN: usize = 4096;

/// Label recorded in an intact header.
pub(crate) fn header_label(header: &DebugHeader) -> Option<&'static str> {
    if header.label_ptr == 0 || header.label_len > MAX_LABEL_LEN {
        return None;
    }
    // SAFETY: label_ptr and label_len come from a `&'static str` stored by
    // `store_debug_info`; callers only use headers that passed validation.
    let bytes =
        unsafe { std::slice::from_raw_parts(header.label_ptr as *const u8, header.label_len) };
    std::str::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_six_words() {
        assert_eq!(HEADER_SIZE, 6 * WORD);
        assert_eq!(DEBUG_BYTES, 8 * WORD);
    }

    #[test]
    fn test_caller_site_points_here() {
        let site = AllocSite::caller();
        assert!(site.label.ends_with("header.rs"));
        assert!(site.line > 0);
    }

    #[test]
    fn test_flags_differ() {
        assert_ne!(START_FLAG, END_FLAG);
        assert_ne!(FREED_MEM_MARKER, 0);
    }
}
