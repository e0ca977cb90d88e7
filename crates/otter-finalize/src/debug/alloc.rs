//! Debug allocation family.
//!
//! Every object gets a [`header`](super::header) recording where it was
//! allocated and canaries around the payload. Frees validate the canaries
//! and mark the header so that a second free is caught.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::check::{SmashedList, report_smashed};
use super::header::{
    self, AllocSite, DEBUG_BYTES, DebugInfo, FREED_MEM_MARKER, HEADER_SIZE, has_debug_info,
    header_mut, read_header,
};
use crate::config::FinalizeConfig;
use crate::error::{GcError, GcResult};
use crate::heap::{Heap, ObjectKind, WORD};

/// Debug allocator state: configuration, the smashed list and the global
/// error flag.
pub struct DebugAllocator {
    pub(crate) config: FinalizeConfig,
    pub(crate) smashed: Mutex<SmashedList>,
    pub(crate) have_errors: AtomicBool,
    debugging_started: AtomicBool,
}

impl DebugAllocator {
    /// Create a debug allocator.
    pub fn new(config: FinalizeConfig) -> Self {
        Self {
            config,
            smashed: Mutex::new(SmashedList::new()),
            have_errors: AtomicBool::new(false),
            debugging_started: AtomicBool::new(false),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &FinalizeConfig {
        &self.config
    }

    /// Whether any debug object has been allocated yet.
    pub fn debugging_started(&self) -> bool {
        self.debugging_started.load(Ordering::Relaxed)
    }

    /// Whether corruption or a double free was ever detected.
    pub fn have_errors(&self) -> bool {
        self.have_errors.load(Ordering::Relaxed)
    }

    /// Allocate `size` bytes with a debug header.
    pub fn debug_malloc<H: Heap + ?Sized>(&self, heap: &H, size: usize, site: AllocSite) -> Option<usize> {
        self.debug_alloc(heap, size, ObjectKind::Normal, site)
    }

    /// Allocate pointer-free memory with a debug header.
    pub fn debug_malloc_atomic<H: Heap + ?Sized>(
        &self,
        heap: &H,
        size: usize,
        site: AllocSite,
    ) -> Option<usize> {
        self.debug_alloc(heap, size, ObjectKind::Atomic, site)
    }

    /// Allocate uncollectable memory with a debug header.
    pub fn debug_malloc_uncollectable<H: Heap + ?Sized>(
        &self,
        heap: &H,
        size: usize,
        site: AllocSite,
    ) -> Option<usize> {
        self.debug_alloc(heap, size, ObjectKind::Uncollectable, site)
    }

    /// Allocate pointer-free uncollectable memory with a debug header.
    pub fn debug_malloc_atomic_uncollectable<H: Heap + ?Sized>(
        &self,
        heap: &H,
        size: usize,
        site: AllocSite,
    ) -> Option<usize> {
        self.debug_alloc(heap, size, ObjectKind::AtomicUncollectable, site)
    }

    /// General debug allocation. Returns the payload address, or `None` if
    /// the heap could not satisfy the request.
    pub fn debug_alloc<H: Heap + ?Sized>(
        &self,
        heap: &H,
        size: usize,
        kind: ObjectKind,
        site: AllocSite,
    ) -> Option<usize> {
        let base = size
            .checked_add(DEBUG_BYTES)
            .and_then(|total| heap.alloc(total, kind));
        let Some(base) = base else {
            tracing::error!(
                target: "otter::gc::debug",
                size,
                "debug_malloc({}) returning NULL ({}:{})",
                size,
                site.label,
                site.line
            );
            return None;
        };
        self.debugging_started.store(true, Ordering::Relaxed);

        let block_size = heap.object_size(base)?;
        // SAFETY: the heap just handed out a block of block_size bytes, at
        // least size + DEBUG_BYTES.
        Some(unsafe { header::store_debug_info(base, block_size, size, site) })
    }

    /// Free a debug object.
    ///
    /// Null is a no-op. Corrupted objects are reported and freed anyway; a
    /// second free of the same object is reported and ignored.
    pub fn debug_free<H: Heap + ?Sized>(&self, heap: &H, ptr: usize) -> GcResult<()> {
        if ptr == 0 {
            return Ok(());
        }
        let Some(base) = heap.base(ptr) else {
            tracing::error!(
                target: "otter::gc::debug",
                "Attempt to free invalid pointer {:#x}",
                ptr
            );
            return Err(GcError::InvalidPointer(ptr));
        };
        let block_size = heap.object_size(base).ok_or(GcError::InvalidPointer(ptr))?;
        let has_header = ptr - base == HEADER_SIZE;

        if !has_header {
            tracing::warn!(
                target: "otter::gc::debug",
                "debug_free called on pointer {:#x} w/o debugging info",
                ptr
            );
        } else {
            if let Some(clobbered) = header::check_annotated_object(heap, base) {
                self.have_errors.store(true, Ordering::Relaxed);
                // SAFETY: ptr - base == HEADER_SIZE, so the block holds a header.
                let recorded = unsafe { read_header(base) }.size;
                if recorded == block_size {
                    report_smashed(
                        heap,
                        "debug_free: found previously deallocated (?) object at",
                        base,
                        clobbered,
                    );
                    return Err(GcError::DoubleFree(ptr));
                }
                report_smashed(heap, "debug_free: found smashed location at", base, clobbered);
                self.add_smashed(clobbered);
            }
            // SAFETY: as above.
            unsafe { header_mut(base).size = block_size };
        }

        if !has_header || (self.config.find_leak && !self.config.findleak_delay_free) {
            heap.free(base);
            return Ok(());
        }
        if heap.kind(base).is_some_and(ObjectKind::is_uncollectable) {
            heap.free(base);
            return Ok(());
        }

        let words = (block_size - HEADER_SIZE) / WORD;
        for i in 0..words {
            // SAFETY: [ptr, base + block_size) lies inside the block.
            unsafe { std::ptr::write((ptr + i * WORD) as *mut usize, FREED_MEM_MARKER) };
        }
        Ok(())
    }

    /// Resize a debug object, keeping its kind.
    ///
    /// A null pointer allocates. Pointers without a debug header fall back to
    /// the heap's own realloc.
    pub fn debug_realloc<H: Heap + ?Sized>(
        &self,
        heap: &H,
        ptr: usize,
        size: usize,
        site: AllocSite,
    ) -> GcResult<usize> {
        if ptr == 0 {
            return self.debug_malloc(heap, size, site).ok_or(GcError::OutOfMemory);
        }
        let Some(base) = heap.base(ptr) else {
            tracing::error!(
                target: "otter::gc::debug",
                "Attempt to reallocate invalid pointer {:#x}",
                ptr
            );
            return Err(GcError::InvalidPointer(ptr));
        };
        if ptr - base != HEADER_SIZE {
            tracing::warn!(
                target: "otter::gc::debug",
                "debug_realloc called on pointer {:#x} w/o debugging info",
                ptr
            );
            return heap.realloc(base, size).ok_or(GcError::OutOfMemory);
        }
        match has_debug_info(heap, base) {
            DebugInfo::Live => {}
            DebugInfo::Freed => return Err(GcError::DoubleFree(ptr)),
            DebugInfo::None => return Err(GcError::MissingDebugInfo(ptr)),
        }

        let kind = heap.kind(base).ok_or(GcError::InvalidPointer(ptr))?;
        let block_size = heap.object_size(base).ok_or(GcError::InvalidPointer(ptr))?;
        let result = self
            .debug_alloc(heap, size, kind, site)
            .ok_or(GcError::OutOfMemory)?;

        // SAFETY: the old object is live with a valid header.
        let old_size = unsafe { read_header(base) }
            .size
            .min(block_size - DEBUG_BYTES);
        // SAFETY: both payloads are at least min(old_size, size) bytes and
        // belong to different blocks.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, result as *mut u8, old_size.min(size));
        }
        self.debug_free(heap, ptr)?;
        Ok(result)
    }

    /// Copy `s` into a NUL-terminated pointer-free debug object.
    pub fn debug_strdup<H: Heap + ?Sized>(&self, heap: &H, s: &str, site: AllocSite) -> Option<usize> {
        self.copy_c_string(heap, s.as_bytes(), site)
    }

    /// Like [`DebugAllocator::debug_strdup`], copying at most `n` bytes.
    pub fn debug_strndup<H: Heap + ?Sized>(
        &self,
        heap: &H,
        s: &str,
        n: usize,
        site: AllocSite,
    ) -> Option<usize> {
        let bytes = s.as_bytes();
        self.copy_c_string(heap, &bytes[..bytes.len().min(n)], site)
    }

    fn copy_c_string<H: Heap + ?Sized>(&self, heap: &H, bytes: &[u8], site: AllocSite) -> Option<usize> {
        let copy = self.debug_malloc_atomic(heap, bytes.len() + 1, site)?;
        // SAFETY: the payload holds bytes.len() + 1 bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), copy as *mut u8, bytes.len());
            std::ptr::write((copy + bytes.len()) as *mut u8, 0);
        }
        Some(copy)
    }
}

impl std::fmt::Debug for DebugAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugAllocator")
            .field("debugging_started", &self.debugging_started())
            .field("have_errors", &self.have_errors())
            .field("smashed", &self.smashed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::header::check_annotated_object;
    use crate::finalization::FinalizationRegistry;
    use crate::mark_sweep::MarkSweepHeap;
    use std::sync::Arc;

    fn setup(config: FinalizeConfig) -> (DebugAllocator, MarkSweepHeap) {
        let registry = Arc::new(FinalizationRegistry::new(config.clone()));
        (DebugAllocator::new(config), MarkSweepHeap::new(registry))
    }

    fn read_bytes(addr: usize, len: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(addr as *const u8, len).to_vec() }
    }

    #[test]
    fn test_header_records_site() {
        let (debug, heap) = setup(FinalizeConfig::default());
        let site = AllocSite::new("alloc.rs", 42);
        let p = debug.debug_malloc(&heap, 24, site).unwrap();
        let base = heap.base(p).unwrap();

        assert_eq!(p - base, HEADER_SIZE);
        assert_eq!(has_debug_info(&heap, base), DebugInfo::Live);
        let hdr = unsafe { read_header(base) };
        assert_eq!(hdr.size, 24);
        assert_eq!(hdr.line, 42);
        assert_eq!(header::header_label(&hdr), Some("alloc.rs"));
        assert!(debug.debugging_started());
    }

    #[test]
    fn test_free_marks_object_deallocated() {
        let (debug, heap) = setup(FinalizeConfig::default());
        let p = debug.debug_malloc(&heap, 32, AllocSite::caller()).unwrap();
        let base = heap.base(p).unwrap();

        debug.debug_free(&heap, p).unwrap();
        assert_eq!(has_debug_info(&heap, base), DebugInfo::Freed);
        let first = unsafe { std::ptr::read(p as *const usize) };
        assert_eq!(first, FREED_MEM_MARKER);
        assert!(!debug.have_errors());
    }

    #[test]
    fn test_free_of_null_and_foreign_pointers() {
        let (debug, heap) = setup(FinalizeConfig::default());
        assert_eq!(debug.debug_free(&heap, 0), Ok(()));
        let local = 0usize;
        let addr = &local as *const usize as usize;
        assert_eq!(debug.debug_free(&heap, addr), Err(GcError::InvalidPointer(addr)));
    }

    #[test]
    fn test_uncollectable_free_releases_block() {
        let (debug, heap) = setup(FinalizeConfig::default());
        let p = debug
            .debug_malloc_uncollectable(&heap, 16, AllocSite::caller())
            .unwrap();
        debug.debug_free(&heap, p).unwrap();
        assert_eq!(heap.base(p), None);
    }

    #[test]
    fn test_find_leak_free_releases_block() {
        let config = FinalizeConfig {
            find_leak: true,
            ..FinalizeConfig::default()
        };
        let (debug, heap) = setup(config);
        let p = debug.debug_malloc(&heap, 16, AllocSite::caller()).unwrap();
        debug.debug_free(&heap, p).unwrap();
        assert_eq!(heap.base(p), None);
    }

    #[test]
    fn test_smashed_free_is_reported_and_flagged() {
        let (debug, heap) = setup(FinalizeConfig::default());
        let p = debug.debug_malloc(&heap, 16, AllocSite::caller()).unwrap();
        let base = heap.base(p).unwrap();
        unsafe { std::ptr::write((base + WORD * 5) as *mut usize, 0) };

        assert!(check_annotated_object(&heap, base).is_some());
        assert_eq!(debug.debug_free(&heap, p), Ok(()));
        assert!(debug.have_errors());
        assert_eq!(debug.smashed_count(), 1);
    }

    #[test]
    fn test_overrun_free_queues_smashed_report() {
        let (debug, heap) = setup(FinalizeConfig::default());
        let p = debug.debug_malloc(&heap, 100, AllocSite::caller()).unwrap();
        unsafe { *((p + 100) as *mut u8) ^= 0xFF };

        assert_eq!(debug.debug_free(&heap, p), Ok(()));
        assert!(debug.have_errors());
        assert_eq!(debug.smashed_count(), 1);

        let reports = debug.print_all_smashed(&heap);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].clobbered, p + 100);
        assert_eq!(reports[0].object, p);
        assert_eq!(debug.smashed_count(), 0);
    }

    #[test]
    fn test_realloc_copies_and_frees() {
        let (debug, heap) = setup(FinalizeConfig::default());
        let p = debug.debug_malloc_atomic(&heap, 8, AllocSite::caller()).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(b"abcdefgh".as_ptr(), p as *mut u8, 8) };
        let old_base = heap.base(p).unwrap();

        let q = debug.debug_realloc(&heap, p, 64, AllocSite::caller()).unwrap();
        assert_ne!(p, q);
        assert_eq!(read_bytes(q, 8), b"abcdefgh");
        assert_eq!(heap.kind(heap.base(q).unwrap()), Some(ObjectKind::Atomic));
        assert_eq!(has_debug_info(&heap, old_base), DebugInfo::Freed);

        // The old object is gone from the client's point of view.
        assert_eq!(
            debug.debug_realloc(&heap, p, 8, AllocSite::caller()),
            Err(GcError::DoubleFree(p))
        );
    }

    #[test]
    fn test_realloc_null_allocates() {
        let (debug, heap) = setup(FinalizeConfig::default());
        let p = debug.debug_realloc(&heap, 0, 10, AllocSite::caller()).unwrap();
        assert_eq!(has_debug_info(&heap, heap.base(p).unwrap()), DebugInfo::Live);
    }

    #[test]
    fn test_strdup_and_strndup() {
        let (debug, heap) = setup(FinalizeConfig::default());
        let p = debug.debug_strdup(&heap, "hello", AllocSite::caller()).unwrap();
        assert_eq!(read_bytes(p, 6), b"hello\0");
        assert_eq!(heap.kind(heap.base(p).unwrap()), Some(ObjectKind::Atomic));

        let q = debug.debug_strndup(&heap, "hello", 3, AllocSite::caller()).unwrap();
        assert_eq!(read_bytes(q, 4), b"hel\0");
    }

    #[test]
    fn test_allocation_failure_returns_none() {
        let (debug, heap) = setup(FinalizeConfig::default());
        heap.set_alloc_limit(Some(64));
        assert!(debug.debug_malloc(&heap, 1024, AllocSite::caller()).is_none());
        assert!(debug.debug_malloc(&heap, usize::MAX, AllocSite::caller()).is_none());
    }
}
