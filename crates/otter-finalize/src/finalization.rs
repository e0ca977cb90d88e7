//! Finalizable-object registry and the per-collection finalization pass.
//!
//! The registry owns both hash tables (disappearing links and finalizable
//! objects) and the run queue of objects whose finalizers are ready to run.
//! All of it sits behind a single lock. [`FinalizationRegistry::finalize`]
//! holds that lock for its whole pass; invocation (see `invoke.rs`) only
//! holds it while popping entries.
//!
//! ## Ordering
//!
//! An object is finalized only once nothing but its own finalizer reaches
//! it. Everything reachable from a pending finalizable object is marked
//! before the ready set is computed, so if A references B, B's finalizer
//! cannot run before A's.

use std::io;

use parking_lot::{Mutex, MutexGuard};

use crate::config::FinalizeConfig;
use crate::debug::backtrace;
use crate::disappearing_link::DisappearingLink;
use crate::error::{GcError, GcResult};
use crate::hash_table::{ChainEntry, ChainLink, HashTable};
use crate::heap::Heap;
use crate::mark_proc::MarkProc;

/// Client finalizer: called with the object address and its client data.
pub type FinalizerFn = fn(usize, usize);

/// Opaque word handed back to a finalizer.
pub type ClientData = usize;

/// A registered finalizer keyed by its (hidden) object base.
pub struct FinalizableObject {
    chain: ChainLink,
    pub(crate) finalizer: FinalizerFn,
    pub(crate) client_data: ClientData,
    pub(crate) object_size: usize,
    pub(crate) mark_proc: MarkProc,
}

impl FinalizableObject {
    fn new(
        base: usize,
        finalizer: FinalizerFn,
        client_data: ClientData,
        object_size: usize,
        mark_proc: MarkProc,
    ) -> Self {
        Self {
            chain: ChainLink::new(base),
            finalizer,
            client_data,
            object_size,
            mark_proc,
        }
    }

    /// Object base address.
    #[inline]
    pub fn base(&self) -> usize {
        self.chain.key()
    }

    /// Mark procedure used for ordering.
    #[inline]
    pub fn mark_proc(&self) -> MarkProc {
        self.mark_proc
    }

    pub(crate) fn into_ready(self) -> ReadyFinalizer {
        ReadyFinalizer {
            base: self.chain.key(),
            finalizer: self.finalizer,
            client_data: self.client_data,
            object_size: self.object_size,
            mark_proc: self.mark_proc,
        }
    }
}

impl ChainEntry for FinalizableObject {
    fn link(&self) -> &ChainLink {
        &self.chain
    }

    fn link_mut(&mut self) -> &mut ChainLink {
        &mut self.chain
    }
}

impl std::fmt::Debug for FinalizableObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizableObject")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("object_size", &self.object_size)
            .field("mark_proc", &self.mark_proc)
            .finish()
    }
}

/// An entry on the run queue. Its base is no longer hidden: the queue is
/// pushed as a root so the object stays alive until its finalizer ran.
#[derive(Debug)]
pub struct ReadyFinalizer {
    pub(crate) base: usize,
    pub(crate) finalizer: FinalizerFn,
    pub(crate) client_data: ClientData,
    pub(crate) object_size: usize,
    pub(crate) mark_proc: MarkProc,
}

impl ReadyFinalizer {
    fn into_registered(self) -> FinalizableObject {
        FinalizableObject::new(
            self.base,
            self.finalizer,
            self.client_data,
            self.object_size,
            self.mark_proc,
        )
    }
}

/// Counters describing the registry and its last finalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizationStats {
    /// Registered finalizable objects
    pub finalizer_entries: usize,
    /// Registered disappearing links
    pub link_entries: usize,
    /// Finalizers waiting to run
    pub ready: usize,
    /// Links cleared or dropped by the last pass
    pub links_cleared: usize,
    /// Bytes (objects plus entries) queued by the last pass
    pub bytes_finalized: usize,
}

pub(crate) struct RegistryState {
    pub(crate) links: HashTable<DisappearingLink>,
    pub(crate) finalizers: HashTable<FinalizableObject>,
    /// Run queue, popped from the back
    pub(crate) ready: Vec<ReadyFinalizer>,
    /// Entries whose finalizer is executing; innermost last
    pub(crate) running: Vec<ReadyFinalizer>,
    pub(crate) need_unreachable_finalization: bool,
    pub(crate) old_link_count: usize,
    pub(crate) bytes_finalized: usize,
    pub(crate) nested: u8,
    pub(crate) skipped: u32,
    pub(crate) notifier: Option<fn()>,
    pub(crate) last_finalizer_notification: u64,
    pub(crate) last_back_trace_gc_no: u64,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            links: HashTable::new(),
            finalizers: HashTable::new(),
            ready: Vec::new(),
            running: Vec::new(),
            need_unreachable_finalization: false,
            old_link_count: 0,
            bytes_finalized: 0,
            nested: 0,
            skipped: 0,
            notifier: None,
            last_finalizer_notification: 0,
            // The first collection never produces backtraces.
            last_back_trace_gc_no: 1,
        }
    }
}

/// Owner of the disappearing-link and finalizer tables.
pub struct FinalizationRegistry {
    pub(crate) config: FinalizeConfig,
    pub(crate) state: Mutex<RegistryState>,
}

impl FinalizationRegistry {
    /// Create an empty registry.
    pub fn new(config: FinalizeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::new()),
        }
    }

    /// Configuration the registry was created with.
    pub fn config(&self) -> &FinalizeConfig {
        &self.config
    }

    /// Grow `table` if it is over its load limit. Failure to grow only costs
    /// longer chains.
    pub(crate) fn grow_if_needed<E: ChainEntry>(&self, table: &mut HashTable<E>, name: &str) {
        if !table.needs_growth() {
            return;
        }
        let grew = table.grow();
        if self.config.print_stats {
            if grew {
                tracing::debug!(
                    target: "otter::gc::finalize",
                    table = name,
                    buckets = table.bucket_count(),
                    "grew {} table to {} entries",
                    name,
                    table.bucket_count()
                );
            } else {
                tracing::debug!(
                    target: "otter::gc::finalize",
                    table = name,
                    "could not grow {} table",
                    name
                );
            }
        }
    }

    /// Release the lock, give the out-of-memory hook a chance to free
    /// memory, and reacquire. Returns whether a retry is worthwhile.
    pub(crate) fn run_oom_hook(&self, guard: &mut MutexGuard<'_, RegistryState>, bytes: usize) -> bool {
        let Some(hook) = self.config.oom_hook else {
            return false;
        };
        MutexGuard::unlocked(guard, || hook(bytes))
    }

    /// Register `finalizer` on `obj` with ordinary ordering.
    ///
    /// Returns the previously registered finalizer and client data, if any.
    pub fn register_finalizer<H: Heap + ?Sized>(
        &self,
        heap: &H,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        self.register_finalizer_with(heap, obj, finalizer, client_data, MarkProc::Normal)
    }

    /// Register a finalizer that ignores pointers from the object to itself
    /// when establishing ordering.
    pub fn register_finalizer_ignore_self<H: Heap + ?Sized>(
        &self,
        heap: &H,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        self.register_finalizer_with(heap, obj, finalizer, client_data, MarkProc::IgnoreSelf)
    }

    /// Register a finalizer with no ordering guarantees.
    pub fn register_finalizer_no_order<H: Heap + ?Sized>(
        &self,
        heap: &H,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        self.register_finalizer_with(heap, obj, finalizer, client_data, MarkProc::NullMark)
    }

    /// Register a finalizer that only runs once no other finalizable object
    /// reaches `obj`. Requires Java-style finalization.
    pub fn register_finalizer_unreachable<H: Heap + ?Sized>(
        &self,
        heap: &H,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        debug_assert!(
            self.config.java_finalization,
            "unreachable finalizers require Java-style finalization"
        );
        self.register_finalizer_with(heap, obj, finalizer, client_data, MarkProc::Unreachable)
    }

    /// General finalizer registration.
    ///
    /// A `None` finalizer removes any existing registration. Registering on
    /// an object that already has a finalizer replaces it. In both cases the
    /// previous pair is returned. Addresses the heap does not know are not
    /// registered, since they are never collected.
    pub fn register_finalizer_with<H: Heap + ?Sized>(
        &self,
        heap: &H,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
        mark_proc: MarkProc,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        let mut state = self.state.lock();
        if mark_proc == MarkProc::Unreachable {
            state.need_unreachable_finalization = true;
        }
        if finalizer.is_some() {
            self.grow_if_needed(&mut state.finalizers, "fo");
        }

        let mut retried = false;
        loop {
            if let Some(idx) = state.finalizers.find(obj) {
                let previous = {
                    let entry = state.finalizers.get(idx);
                    (entry.finalizer, entry.client_data)
                };
                match finalizer {
                    None => {
                        state.finalizers.remove(obj);
                    }
                    Some(f) => {
                        let entry = state.finalizers.get_mut(idx);
                        entry.finalizer = f;
                        entry.client_data = client_data;
                        entry.mark_proc = mark_proc;
                    }
                }
                return Ok(Some(previous));
            }

            let Some(f) = finalizer else {
                return Ok(None);
            };
            let Some(object_size) = heap.object_size(obj) else {
                // Not a heap object; it will never be collected.
                return Ok(None);
            };

            if state.finalizers.try_reserve_entry().is_ok() {
                let entry = FinalizableObject::new(obj, f, client_data, object_size, mark_proc);
                if state.finalizers.try_insert(entry).is_ok() {
                    return Ok(None);
                }
            }

            if retried
                || !self.run_oom_hook(&mut state, std::mem::size_of::<FinalizableObject>())
            {
                return Err(GcError::OutOfMemory);
            }
            // The table may have changed while unlocked; look again.
            retried = true;
        }
    }

    /// Run the finalization pass. Called by the collector after marking
    /// from roots and before sweeping.
    pub fn finalize<H: Heap + ?Sized>(&self, heap: &H) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let java = self.config.java_finalization;

        state.old_link_count = state.links.len();

        // Clear links whose targets are unreachable.
        crate::disappearing_link::clear_unreachable_links(&mut state.links, heap);

        // Mark everything reachable from unreachable finalizable objects.
        for fo in state.finalizers.iter() {
            let base = fo.base();
            if heap.is_marked(base) {
                continue;
            }
            if self.config.keep_back_ptrs {
                backtrace::marked_for_finalization(heap, base);
            }
            fo.mark_proc.mark_from(heap, base);
            if heap.is_marked(base) {
                tracing::warn!(
                    target: "otter::gc::finalize",
                    object = format_args!("{:#x}", base),
                    "finalization cycle involving {:#x}",
                    base
                );
            }
        }

        // Queue everything that is still unmarked.
        let queued_from = state.ready.len();
        let mut bytes_finalized = 0;
        {
            let RegistryState {
                finalizers, ready, ..
            } = &mut *state;
            finalizers.extract_if(
                |fo| !heap.is_marked(fo.base()),
                |fo| {
                    if !java {
                        heap.set_mark_bit(fo.base());
                    }
                    bytes_finalized += fo.object_size + std::mem::size_of::<FinalizableObject>();
                    ready.push(fo.into_ready());
                },
            );
        }

        if java {
            // "No order" objects still need their referents kept alive.
            for r in &state.ready {
                if heap.is_marked(r.base) {
                    continue;
                }
                if r.mark_proc == MarkProc::NullMark {
                    MarkProc::Normal.mark_from(heap, r.base);
                }
                if r.mark_proc != MarkProc::Unreachable {
                    heap.set_mark_bit(r.base);
                }
            }

            if state.need_unreachable_finalization {
                let resurrected = self.resurrect_reachable(state, heap, queued_from);
                bytes_finalized = bytes_finalized.saturating_sub(resurrected);
            }
        }
        state.bytes_finalized = bytes_finalized;

        // Drop links whose own storage is unreachable.
        crate::disappearing_link::drop_dangling_links(&mut state.links, heap);

        if heap.fail_count() > 0 {
            // Recent allocation failures: let finalizers run again.
            state.nested = 0;
        }

        if self.config.print_stats {
            tracing::debug!(
                target: "otter::gc::finalize",
                ready = state.ready.len(),
                links_cleared = state.old_link_count.saturating_sub(state.links.len()),
                bytes_finalized = state.bytes_finalized,
                "finalization pass complete"
            );
        }
    }

    /// Move `Unreachable` objects queued by this pass (from `queued_from` on)
    /// that ended up marked back into the live table. Unmarked ones are
    /// marked so they survive until their finalizer ran. Entries left over
    /// from earlier passes are rooted by the queue and stay queued. Returns
    /// the bytes taken back out of the pass total.
    fn resurrect_reachable<H: Heap + ?Sized>(
        &self,
        state: &mut RegistryState,
        heap: &H,
        queued_from: usize,
    ) -> usize {
        let mut bytes = 0;
        let mut i = queued_from;
        while i < state.ready.len() {
            let entry = &state.ready[i];
            if entry.mark_proc != MarkProc::Unreachable {
                i += 1;
                continue;
            }
            if !heap.is_marked(entry.base) {
                heap.set_mark_bit(entry.base);
                i += 1;
                continue;
            }

            let resurrected = state.ready.remove(i);
            let base = resurrected.base;
            let size = resurrected.object_size;
            self.grow_if_needed(&mut state.finalizers, "fo");
            match state.finalizers.try_insert(resurrected.into_registered()) {
                Ok(_) => {
                    bytes += size + std::mem::size_of::<FinalizableObject>();
                    tracing::debug!(
                        target: "otter::gc::finalize",
                        object = format_args!("{:#x}", base),
                        "finalizable object reachable from another finalizer; not finalized"
                    );
                }
                Err(fo) => {
                    // No room to reinsert: finalize it after all.
                    tracing::warn!(
                        target: "otter::gc::finalize",
                        object = format_args!("{:#x}", base),
                        "could not return resurrected object to the finalizer table"
                    );
                    state.ready.insert(i, fo.into_ready());
                    i += 1;
                }
            }
        }
        bytes
    }

    /// Push everything the registry keeps alive: client data of every
    /// registration, and every queued or currently running object with its
    /// client data.
    ///
    /// Registry entries live outside the collected heap, so the collector
    /// must call this while marking roots, before [`FinalizationRegistry::finalize`].
    pub fn push_finalizer_structures<H: Heap + ?Sized>(&self, heap: &H) {
        let state = self.state.lock();
        for fo in state.finalizers.iter() {
            heap.push_candidate(fo.client_data, std::ptr::addr_of!(fo.client_data) as usize);
        }
        for r in state.ready.iter().chain(&state.running) {
            heap.push_candidate(r.base, std::ptr::addr_of!(r.base) as usize);
            heap.push_candidate(r.client_data, std::ptr::addr_of!(r.client_data) as usize);
        }
    }

    /// Snapshot of registry counters.
    pub fn stats(&self) -> FinalizationStats {
        let state = self.state.lock();
        FinalizationStats {
            finalizer_entries: state.finalizers.len(),
            link_entries: state.links.len(),
            ready: state.ready.len(),
            links_cleared: state.old_link_count.saturating_sub(state.links.len()),
            bytes_finalized: state.bytes_finalized,
        }
    }

    /// Log the registry counters.
    pub fn print_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            target: "otter::gc::finalize",
            finalizers = stats.finalizer_entries,
            links = stats.link_entries,
            ready = stats.ready,
            links_cleared = stats.links_cleared,
            bytes_finalized = stats.bytes_finalized,
            "{} finalization table entries; {} disappearing links alive; {} objects are eligible for immediate finalization",
            stats.finalizer_entries,
            stats.link_entries,
            stats.ready
        );
    }

    /// Write every registered link and finalizable object to `out`.
    pub fn dump(&self, out: &mut impl io::Write) -> io::Result<()> {
        let state = self.state.lock();
        writeln!(out, "Disappearing links:")?;
        for dl in state.links.iter() {
            writeln!(out, "Object: {:#x}, Link: {:#x}", dl.object(), dl.link())?;
        }
        writeln!(out, "Finalizers:")?;
        for fo in state.finalizers.iter() {
            writeln!(out, "Finalizable object: {:#x}", fo.base())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FinalizationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizationRegistry")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
