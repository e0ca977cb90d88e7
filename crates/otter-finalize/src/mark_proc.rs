//! Mark procedures used when marking from finalizable objects.
//!
//! A mark procedure decides which objects count as reachable *from* a
//! finalizable object for ordering purposes. Everything it marks is
//! guaranteed not to be finalized before that object's finalizer runs.

use crate::heap::{Heap, WORD};

/// How marking proceeds from an unreachable finalizable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkProc {
    /// Trace the whole object body
    Normal,
    /// Trace the body, skipping pointers back into the object itself
    IgnoreSelf,
    /// Mark nothing; no ordering guarantees
    NullMark,
    /// Same marking as `Normal`, but the object is only finalized if no
    /// other finalizable object reaches it
    Unreachable,
}

impl MarkProc {
    /// Push everything reachable from the object at `base` onto the
    /// collector's mark stack. The object's own mark bit is not set.
    pub fn mark_through<H: Heap + ?Sized>(self, heap: &H, base: usize) {
        match self {
            MarkProc::Normal | MarkProc::Unreachable => heap.push_contents(base),
            MarkProc::IgnoreSelf => push_ignoring_self(heap, base),
            MarkProc::NullMark => {}
        }
    }

    /// Mark through the object at `base` and trace to completion.
    pub fn mark_from<H: Heap + ?Sized>(self, heap: &H, base: usize) {
        self.mark_through(heap, base);
        heap.drain_mark_stack();
    }
}

/// Conservatively scan the object's words, pushing only values that point
/// outside `[base, base + size)`.
fn push_ignoring_self<H: Heap + ?Sized>(heap: &H, base: usize) {
    let Some(size) = heap.object_size(base) else {
        return;
    };
    if size < WORD || !heap.kind(base).is_some_and(|k| k.contains_pointers()) {
        return;
    }

    let target_limit = base + size - 1;
    let scan_limit = base + size - WORD;
    let mut q = base;
    while q <= scan_limit {
        // SAFETY: [base, base + size) is a live heap object per `object_size`,
        // and q is word aligned within it.
        let r = unsafe { std::ptr::read(q as *const usize) };
        if r < base || r > target_limit {
            heap.push_candidate(r, q);
        }
        q += WORD;
    }
}
