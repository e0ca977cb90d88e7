//! Collaborator interface to the underlying mark-sweep heap.
//!
//! The finalization engine never owns heap memory. Everything it needs from
//! the collector (object lookup, mark bits, tracing, raw allocation) goes
//! through the [`Heap`] trait. [`crate::MarkSweepHeap`] is a small reference
//! implementation used by the tests.

/// Size of a machine word in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Allocation granule: every object size is a multiple of this.
pub const GRANULE: usize = 2 * WORD;

/// Object kinds understood by the underlying allocator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Collectable, scanned for pointers
    Normal = 0,
    /// Collectable, never scanned (pointer-free)
    Atomic = 1,
    /// Never collected, scanned for pointers
    Uncollectable = 2,
    /// Never collected, never scanned
    AtomicUncollectable = 3,
}

impl ObjectKind {
    /// Whether the marker scans objects of this kind for pointers.
    #[inline]
    pub fn contains_pointers(self) -> bool {
        matches!(self, ObjectKind::Normal | ObjectKind::Uncollectable)
    }

    /// Whether objects of this kind are only ever released explicitly.
    #[inline]
    pub fn is_uncollectable(self) -> bool {
        matches!(
            self,
            ObjectKind::Uncollectable | ObjectKind::AtomicUncollectable
        )
    }
}

/// A contiguous range of heap memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSection {
    /// First byte of the section
    pub start: usize,
    /// Length in bytes
    pub len: usize,
}

/// Capabilities the finalization engine requires from the base collector.
///
/// All addresses are plain `usize` values. Mark-bit and tracing operations
/// are only meaningful between the collector's mark phase and its sweep.
pub trait Heap {
    /// Base address of the object containing `addr`, if any.
    fn base(&self, addr: usize) -> Option<usize>;

    /// True (granule-rounded) size of the object at `base`.
    fn object_size(&self, base: usize) -> Option<usize>;

    /// Kind of the object at `base`.
    fn kind(&self, base: usize) -> Option<ObjectKind>;

    /// Whether the object at `base` is marked.
    fn is_marked(&self, base: usize) -> bool;

    /// Mark the object at `base` without tracing through it.
    fn set_mark_bit(&self, base: usize);

    /// Unmark the object at `base`.
    fn clear_mark_bit(&self, base: usize);

    /// Push the body of the object at `base` for tracing.
    ///
    /// Everything the body references gets marked once the mark stack is
    /// drained; the object's own mark bit is left alone.
    fn push_contents(&self, base: usize);

    /// Conservatively treat `word` as a possible pointer found at address
    /// `source`, marking and pushing the object it points into.
    fn push_candidate(&self, word: usize, source: usize);

    /// Conservatively scan every aligned word in `[start, end)`.
    ///
    /// # Safety
    /// The whole range must be readable memory.
    unsafe fn push_range(&self, start: usize, end: usize);

    /// Trace until the mark stack is empty.
    fn drain_mark_stack(&self);

    /// Allocate `size` bytes of the given kind. Returns the base address.
    fn alloc(&self, size: usize, kind: ObjectKind) -> Option<usize>;

    /// Release the object at `base` immediately.
    fn free(&self, base: usize);

    /// Resize the object at `base`, returning the new base.
    fn realloc(&self, base: usize, new_size: usize) -> Option<usize>;

    /// Number of completed collections.
    fn collection_count(&self) -> u64;

    /// Number of recent allocation failures.
    fn fail_count(&self) -> usize {
        0
    }

    /// Memory sections making up the heap.
    fn sections(&self) -> Vec<HeapSection>;

    /// Visit every allocated object as `(base, size, marked)`.
    fn for_each_object(&self, f: &mut dyn FnMut(usize, usize, bool));

    /// Force a full collection. Returns false if collection is disabled.
    fn collect(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_kinds() {
        assert!(ObjectKind::Normal.contains_pointers());
        assert!(!ObjectKind::Atomic.contains_pointers());
        assert!(ObjectKind::Uncollectable.contains_pointers());
        assert!(ObjectKind::Uncollectable.is_uncollectable());
        assert!(ObjectKind::AtomicUncollectable.is_uncollectable());
        assert!(!ObjectKind::Normal.is_uncollectable());
    }

    #[test]
    fn test_granule_is_word_multiple() {
        assert_eq!(GRANULE % WORD, 0);
    }
}
