//! Reference mark/sweep heap
//!
//! A small conservative, non-moving, stop-the-world heap implementing the
//! [`Heap`] collaborator interface. It exists so the finalization engine can
//! be exercised end to end; it is not meant as a production collector.
//!
//! ## Design
//!
//! - **Block per object**: every object is its own `std::alloc` block, sized
//!   in granules and zero-initialized
//! - **Address index**: a `BTreeMap` keyed by block start answers interior
//!   pointer lookups with one range query
//! - **Conservative marking**: roots and object bodies are scanned word by
//!   word; anything that points into a block keeps it alive
//! - **Collection cycle**: mark roots and finalizer structures, run the
//!   finalization pass, check debug objects, sweep, then run or announce
//!   finalizers

use std::alloc::Layout;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::debug::{self, DebugAllocator, ObjectDescription, SmashedReport};
use crate::finalization::FinalizationRegistry;
use crate::heap::{GRANULE, Heap, HeapSection, ObjectKind, WORD};

/// A single allocation.
struct Block {
    /// Granule-rounded size
    size: usize,
    kind: ObjectKind,
    layout: Layout,
}

struct HeapState {
    /// Blocks keyed by start address
    blocks: BTreeMap<usize, Block>,
    /// Bases of marked blocks
    marks: FxHashSet<usize>,
    /// Marked blocks whose bodies still need scanning
    mark_stack: Vec<usize>,
    total_bytes: usize,
    alloc_limit: Option<usize>,
    fail_count: usize,
}

impl HeapState {
    fn base_of(&self, addr: usize) -> Option<usize> {
        let (&start, block) = self.blocks.range(..=addr).next_back()?;
        (addr < start + block.size).then_some(start)
    }
}

/// Statistics from the reference heap
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    /// Total bytes currently allocated
    pub total_bytes: usize,
    /// Number of live allocations
    pub allocation_count: usize,
    /// Total number of collections performed
    pub collection_count: u64,
    /// Bytes reclaimed in last collection
    pub last_reclaimed: usize,
    /// Total pause time accumulated across all collections
    pub total_pause_time: Duration,
    /// Pause time of the last collection
    pub last_pause_time: Duration,
}

/// Reference heap driving a [`FinalizationRegistry`].
pub struct MarkSweepHeap {
    state: Mutex<HeapState>,
    /// Root words, scanned conservatively
    roots: Mutex<Vec<usize>>,
    registry: Arc<FinalizationRegistry>,
    debug: Option<Arc<DebugAllocator>>,
    collection_count: AtomicU64,
    last_reclaimed: AtomicUsize,
    total_pause_nanos: AtomicU64,
    last_pause_nanos: AtomicU64,
    disabled: AtomicBool,
    leaks: Mutex<Vec<ObjectDescription>>,
    smashed: Mutex<Vec<SmashedReport>>,
}

impl MarkSweepHeap {
    /// Create an empty heap whose collections run `registry`'s
    /// finalization pass.
    pub fn new(registry: Arc<FinalizationRegistry>) -> Self {
        Self {
            state: Mutex::new(HeapState {
                blocks: BTreeMap::new(),
                marks: FxHashSet::default(),
                mark_stack: Vec::new(),
                total_bytes: 0,
                alloc_limit: None,
                fail_count: 0,
            }),
            roots: Mutex::new(Vec::new()),
            registry,
            debug: None,
            collection_count: AtomicU64::new(0),
            last_reclaimed: AtomicUsize::new(0),
            total_pause_nanos: AtomicU64::new(0),
            last_pause_nanos: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            leaks: Mutex::new(Vec::new()),
            smashed: Mutex::new(Vec::new()),
        }
    }

    /// Check debug objects and report leaks through `debug` during
    /// collections.
    pub fn with_debug(mut self, debug: Arc<DebugAllocator>) -> Self {
        self.debug = Some(debug);
        self
    }

    /// The finalization registry this heap drives.
    pub fn registry(&self) -> &Arc<FinalizationRegistry> {
        &self.registry
    }

    /// Add a root word.
    pub fn add_root(&self, value: usize) {
        self.roots.lock().push(value);
    }

    /// Remove one occurrence of a root word. Returns false if absent.
    pub fn remove_root(&self, value: usize) -> bool {
        let mut roots = self.roots.lock();
        match roots.iter().position(|&r| r == value) {
            Some(pos) => {
                roots.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Disable or re-enable collection.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    /// Fail allocations that would push the heap over `limit` bytes.
    pub fn set_alloc_limit(&self, limit: Option<usize>) {
        self.state.lock().alloc_limit = limit;
    }

    /// Unmark every object.
    pub fn clear_marks(&self) {
        let mut state = self.state.lock();
        state.marks.clear();
        state.mark_stack.clear();
    }

    /// Get total allocated bytes
    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Get collection statistics
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total_bytes: self.total_bytes(),
            allocation_count: self.allocation_count(),
            collection_count: self.collection_count.load(Ordering::Relaxed),
            last_reclaimed: self.last_reclaimed.load(Ordering::Relaxed),
            total_pause_time: Duration::from_nanos(self.total_pause_nanos.load(Ordering::Relaxed)),
            last_pause_time: Duration::from_nanos(self.last_pause_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Leaks reported by collections in leak-finding mode since the last call.
    pub fn take_leaks(&self) -> Vec<ObjectDescription> {
        std::mem::take(&mut *self.leaks.lock())
    }

    /// Smashed objects reported by collections since the last call.
    pub fn take_smashed_reports(&self) -> Vec<SmashedReport> {
        std::mem::take(&mut *self.smashed.lock())
    }

    /// Perform a full mark/sweep collection. Returns reclaimed bytes.
    fn collect_now(&self) -> usize {
        let start = Instant::now();
        let initial_count = self.allocation_count();

        tracing::debug!(
            target: "otter::gc",
            roots = self.roots.lock().len(),
            heap_bytes = self.total_bytes(),
            objects = initial_count,
            "GC cycle starting"
        );

        // Phase 1: Reset marks
        self.clear_marks();

        // Phase 2: Mark from roots
        self.mark_roots();

        // Phase 3: Finalization
        self.registry.finalize(self);

        if let Some(debug) = &self.debug {
            debug.check_heap(self);
        }

        // Phase 4: Sweep unmarked objects
        let reclaimed = self.sweep();

        let elapsed = start.elapsed();
        let elapsed_nanos = elapsed.as_nanos() as u64;
        let collection_num = self.collection_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_reclaimed.store(reclaimed, Ordering::Relaxed);
        self.total_pause_nanos
            .fetch_add(elapsed_nanos, Ordering::Relaxed);
        self.last_pause_nanos.store(elapsed_nanos, Ordering::Relaxed);

        if let Some(debug) = &self.debug {
            let reports = debug.print_all_smashed(self);
            self.smashed.lock().extend(reports);
        }

        let final_count = self.allocation_count();
        tracing::info!(
            target: "otter::gc",
            collection = collection_num,
            reclaimed_bytes = reclaimed,
            pause_us = elapsed.as_micros() as u64,
            live_bytes = self.total_bytes(),
            live_objects = final_count,
            freed_objects = initial_count.saturating_sub(final_count),
            "GC cycle complete"
        );

        // Phase 5: Run or announce finalizers, with no locks held
        self.registry.notify_or_invoke_finalizers(self);

        reclaimed
    }

    fn mark_roots(&self) {
        // Uncollectable objects are always live.
        let uncollectable: Vec<usize> = {
            let state = self.state.lock();
            state
                .blocks
                .iter()
                .filter(|(_, block)| block.kind.is_uncollectable())
                .map(|(&base, _)| base)
                .collect()
        };
        for base in uncollectable {
            self.set_mark_bit(base);
            self.push_contents(base);
        }

        {
            let roots = self.roots.lock();
            let start = roots.as_ptr() as usize;
            // SAFETY: the root vector is locked and readable for its length.
            unsafe { self.push_range(start, start + roots.len() * WORD) };
            self.drain_mark_stack();
        }

        self.registry.push_finalizer_structures(self);
        self.drain_mark_stack();
    }

    /// Sweep phase: free all unmarked collectable objects
    fn sweep(&self) -> usize {
        let find_leak = self.registry.config().find_leak;
        let dead: Vec<(usize, usize)> = {
            let state = self.state.lock();
            state
                .blocks
                .iter()
                .filter(|(base, block)| {
                    !block.kind.is_uncollectable() && !state.marks.contains(*base)
                })
                .map(|(&base, block)| (base, block.size))
                .collect()
        };

        let mut reclaimed = 0;
        for (base, size) in dead {
            if find_leak {
                let leaked = match &self.debug {
                    Some(debug) => debug.check_leaked(self, base),
                    None => true,
                };
                if leaked {
                    if let Some(description) = debug::describe_object(self, base) {
                        tracing::warn!(
                            target: "otter::gc",
                            object = format_args!("{:#x}", description.address),
                            "Found leaked object: {}",
                            description
                        );
                        self.leaks.lock().push(description);
                    }
                }
                if self.is_marked(base) {
                    // Written after free; kept for this cycle.
                    continue;
                }
            }
            self.free(base);
            reclaimed += size;
        }
        reclaimed
    }
}

impl Heap for MarkSweepHeap {
    fn base(&self, addr: usize) -> Option<usize> {
        self.state.lock().base_of(addr)
    }

    fn object_size(&self, base: usize) -> Option<usize> {
        self.state.lock().blocks.get(&base).map(|b| b.size)
    }

    fn kind(&self, base: usize) -> Option<ObjectKind> {
        self.state.lock().blocks.get(&base).map(|b| b.kind)
    }

    fn is_marked(&self, base: usize) -> bool {
        self.state.lock().marks.contains(&base)
    }

    fn set_mark_bit(&self, base: usize) {
        self.state.lock().marks.insert(base);
    }

    fn clear_mark_bit(&self, base: usize) {
        self.state.lock().marks.remove(&base);
    }

    fn push_contents(&self, base: usize) {
        let mut state = self.state.lock();
        if state.blocks.contains_key(&base) {
            state.mark_stack.push(base);
        }
    }

    fn push_candidate(&self, word: usize, source: usize) {
        let newly_marked = {
            let mut state = self.state.lock();
            match state.base_of(word) {
                Some(base) if state.marks.insert(base) => {
                    state.mark_stack.push(base);
                    Some(base)
                }
                _ => None,
            }
        };
        if let Some(base) = newly_marked {
            if self.registry.config().keep_back_ptrs {
                debug::store_back_pointer(self, source, base);
            }
        }
    }

    unsafe fn push_range(&self, start: usize, end: usize) {
        let mut q = start.next_multiple_of(WORD);
        while q + WORD <= end {
            // SAFETY: caller guarantees [start, end) is readable.
            let word = unsafe { std::ptr::read(q as *const usize) };
            self.push_candidate(word, q);
            q += WORD;
        }
    }

    fn drain_mark_stack(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                let Some(base) = state.mark_stack.pop() else {
                    break;
                };
                state.blocks.get(&base).map(|b| (base, b.size, b.kind))
            };
            if let Some((base, size, kind)) = next {
                if kind.contains_pointers() {
                    // SAFETY: the block is live for the whole mark phase.
                    unsafe { self.push_range(base, base + size) };
                }
            }
        }
    }

    fn alloc(&self, size: usize, kind: ObjectKind) -> Option<usize> {
        let mut state = self.state.lock();
        let rounded = size.max(1).checked_next_multiple_of(GRANULE);
        let layout = rounded.and_then(|r| Layout::from_size_align(r, GRANULE).ok());
        let Some(layout) = layout else {
            state.fail_count += 1;
            return None;
        };
        if let Some(limit) = state.alloc_limit {
            if state.total_bytes.saturating_add(layout.size()) > limit {
                state.fail_count += 1;
                return None;
            }
        }

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            state.fail_count += 1;
            return None;
        }
        let base = ptr as usize;
        state.blocks.insert(
            base,
            Block {
                size: layout.size(),
                kind,
                layout,
            },
        );
        state.total_bytes += layout.size();
        state.fail_count = 0;
        Some(base)
    }

    fn free(&self, base: usize) {
        let mut state = self.state.lock();
        let Some(block) = state.blocks.remove(&base) else {
            return;
        };
        state.marks.remove(&base);
        state.total_bytes -= block.size;
        // SAFETY: base was allocated with exactly this layout.
        unsafe { std::alloc::dealloc(base as *mut u8, block.layout) };
    }

    fn realloc(&self, base: usize, new_size: usize) -> Option<usize> {
        let (old_size, kind) = {
            let state = self.state.lock();
            let block = state.blocks.get(&base)?;
            (block.size, block.kind)
        };
        if new_size <= old_size && new_size.checked_next_multiple_of(GRANULE) == Some(old_size) {
            return Some(base);
        }
        let new_base = self.alloc(new_size, kind)?;
        // SAFETY: both blocks are live and at least min(old, new) bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                base as *const u8,
                new_base as *mut u8,
                old_size.min(new_size),
            );
        }
        self.free(base);
        Some(new_base)
    }

    fn collection_count(&self) -> u64 {
        self.collection_count.load(Ordering::Relaxed)
    }

    fn fail_count(&self) -> usize {
        self.state.lock().fail_count
    }

    fn sections(&self) -> Vec<HeapSection> {
        self.state
            .lock()
            .blocks
            .iter()
            .map(|(&start, block)| HeapSection {
                start,
                len: block.size,
            })
            .collect()
    }

    fn for_each_object(&self, f: &mut dyn FnMut(usize, usize, bool)) {
        let objects: Vec<(usize, usize, bool)> = {
            let state = self.state.lock();
            state
                .blocks
                .iter()
                .map(|(&base, block)| (base, block.size, state.marks.contains(&base)))
                .collect()
        };
        for (base, size, marked) in objects {
            f(base, size, marked);
        }
    }

    fn collect(&self) -> bool {
        if self.disabled.load(Ordering::Relaxed) {
            return false;
        }
        self.collect_now();
        true
    }
}

impl Drop for MarkSweepHeap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (base, block) in std::mem::take(&mut state.blocks) {
            // SAFETY: every block was allocated with its recorded layout.
            unsafe { std::alloc::dealloc(base as *mut u8, block.layout) };
        }
        state.total_bytes = 0;
    }
}

impl std::fmt::Debug for MarkSweepHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkSweepHeap")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FinalizeConfig;

    fn heap() -> MarkSweepHeap {
        MarkSweepHeap::new(Arc::new(FinalizationRegistry::new(FinalizeConfig::default())))
    }

    fn write_word(addr: usize, value: usize) {
        unsafe { std::ptr::write(addr as *mut usize, value) };
    }

    #[test]
    fn test_alloc_rounds_to_granule() {
        let heap = heap();
        let p = heap.alloc(1, ObjectKind::Normal).unwrap();
        assert_eq!(heap.object_size(p), Some(GRANULE));
        assert_eq!(p % GRANULE, 0);
        assert_eq!(heap.total_bytes(), GRANULE);
    }

    #[test]
    fn test_interior_pointers_resolve_to_base() {
        let heap = heap();
        let p = heap.alloc(64, ObjectKind::Normal).unwrap();
        assert_eq!(heap.base(p), Some(p));
        assert_eq!(heap.base(p + 63), Some(p));
        assert_ne!(heap.base(p + 64), Some(p));
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let heap = heap();
        let live = heap.alloc(32, ObjectKind::Normal).unwrap();
        let dead = heap.alloc(32, ObjectKind::Normal).unwrap();
        heap.add_root(live);

        assert!(heap.collect());
        assert_eq!(heap.base(live), Some(live));
        assert_eq!(heap.base(dead), None);
        assert_eq!(heap.stats().collection_count, 1);
        assert_eq!(heap.stats().last_reclaimed, 32);
    }

    #[test]
    fn test_collect_traces_through_objects() {
        let heap = heap();
        let a = heap.alloc(16, ObjectKind::Normal).unwrap();
        let b = heap.alloc(16, ObjectKind::Normal).unwrap();
        let c = heap.alloc(16, ObjectKind::Atomic).unwrap();
        let d = heap.alloc(16, ObjectKind::Normal).unwrap();
        write_word(a, b + 8);
        write_word(b, c);
        // Atomic objects are not scanned.
        write_word(c, d);
        heap.add_root(a);

        heap.collect();
        assert!(heap.base(b).is_some());
        assert!(heap.base(c).is_some());
        assert!(heap.base(d).is_none());
    }

    #[test]
    fn test_uncollectable_survives_and_is_scanned() {
        let heap = heap();
        let u = heap.alloc(16, ObjectKind::Uncollectable).unwrap();
        let child = heap.alloc(16, ObjectKind::Normal).unwrap();
        write_word(u, child);

        heap.collect();
        assert!(heap.base(u).is_some());
        assert!(heap.base(child).is_some());
    }

    #[test]
    fn test_disabled_collection() {
        let heap = heap();
        heap.set_disabled(true);
        assert!(!heap.collect());
        assert_eq!(heap.collection_count(), 0);
    }

    #[test]
    fn test_alloc_limit_counts_failures() {
        let heap = heap();
        heap.set_alloc_limit(Some(64));
        assert!(heap.alloc(32, ObjectKind::Normal).is_some());
        assert!(heap.alloc(64, ObjectKind::Normal).is_none());
        assert_eq!(heap.fail_count(), 1);
        assert!(heap.alloc(16, ObjectKind::Normal).is_some());
        assert_eq!(heap.fail_count(), 0);
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let heap = heap();
        let p = heap.alloc(16, ObjectKind::Normal).unwrap();
        write_word(p, 0xABCD);
        let q = heap.realloc(p, 256).unwrap();
        assert_eq!(unsafe { std::ptr::read(q as *const usize) }, 0xABCD);
        assert_eq!(heap.object_size(q), Some(256));
        assert_eq!(heap.realloc(q, 250), Some(q));
    }

    #[test]
    fn test_sections_cover_objects() {
        let heap = heap();
        let p = heap.alloc(48, ObjectKind::Normal).unwrap();
        let sections = heap.sections();
        assert_eq!(sections, vec![HeapSection { start: p, len: 48 }]);
    }
}
