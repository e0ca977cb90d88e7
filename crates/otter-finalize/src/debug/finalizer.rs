//! Finalizers on debug objects.
//!
//! Registrations go on the object base (the header), so the registry's
//! ordering logic sees the whole block. The client finalizer and its data
//! are stored in a small collectable closure object whose address becomes
//! the registration's client data. Tracing that object keeps the client's
//! data alive; a trampoline adds the header offset back before calling the
//! client.

use super::alloc::DebugAllocator;
use super::header::HEADER_SIZE;
use crate::error::{GcError, GcResult};
use crate::finalization::{ClientData, FinalizationRegistry, FinalizerFn};
use crate::heap::{Heap, ObjectKind};
use crate::mark_proc::MarkProc;

#[repr(C)]
#[derive(Clone, Copy)]
struct DebugClosure {
    finalizer: FinalizerFn,
    client_data: ClientData,
}

impl DebugClosure {
    /// Store the closure in a new scanned heap object.
    fn alloc<H: Heap + ?Sized>(self, heap: &H) -> GcResult<usize> {
        let addr = heap
            .alloc(std::mem::size_of::<DebugClosure>(), ObjectKind::Normal)
            .ok_or(GcError::OutOfMemory)?;
        // SAFETY: the heap just handed out at least this many bytes.
        unsafe { std::ptr::write(addr as *mut DebugClosure, self) };
        Ok(addr)
    }

    /// # Safety
    /// `addr` must come from [`DebugClosure::alloc`] and still be live.
    unsafe fn read(addr: usize) -> DebugClosure {
        unsafe { std::ptr::read(addr as *const DebugClosure) }
    }
}

fn debug_invoke_finalizer(base: usize, data: usize) {
    // SAFETY: only registered together with a closure object, which the
    // run queue keeps alive until this call returns.
    let closure = unsafe { DebugClosure::read(data) };
    (closure.finalizer)(base + HEADER_SIZE, closure.client_data);
}

fn is_debug_trampoline(f: FinalizerFn) -> bool {
    std::ptr::fn_addr_eq(f, debug_invoke_finalizer as FinalizerFn)
}

impl DebugAllocator {
    /// Register a finalizer on a debug object with ordinary ordering.
    pub fn debug_register_finalizer<H: Heap + ?Sized>(
        &self,
        heap: &H,
        registry: &FinalizationRegistry,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        self.debug_register_finalizer_with(heap, registry, obj, finalizer, client_data, MarkProc::Normal)
    }

    /// Register a finalizer on a debug object with no ordering guarantees.
    pub fn debug_register_finalizer_no_order<H: Heap + ?Sized>(
        &self,
        heap: &H,
        registry: &FinalizationRegistry,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        self.debug_register_finalizer_with(heap, registry, obj, finalizer, client_data, MarkProc::NullMark)
    }

    /// Register a finalizer on a debug object that ignores self pointers.
    pub fn debug_register_finalizer_ignore_self<H: Heap + ?Sized>(
        &self,
        heap: &H,
        registry: &FinalizationRegistry,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        self.debug_register_finalizer_with(
            heap,
            registry,
            obj,
            finalizer,
            client_data,
            MarkProc::IgnoreSelf,
        )
    }

    /// Register an unreachable-only finalizer on a debug object.
    pub fn debug_register_finalizer_unreachable<H: Heap + ?Sized>(
        &self,
        heap: &H,
        registry: &FinalizationRegistry,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        debug_assert!(
            registry.config().java_finalization,
            "unreachable finalizers require Java-style finalization"
        );
        self.debug_register_finalizer_with(
            heap,
            registry,
            obj,
            finalizer,
            client_data,
            MarkProc::Unreachable,
        )
    }

    fn debug_register_finalizer_with<H: Heap + ?Sized>(
        &self,
        heap: &H,
        registry: &FinalizationRegistry,
        obj: usize,
        finalizer: Option<FinalizerFn>,
        client_data: ClientData,
        mark_proc: MarkProc,
    ) -> GcResult<Option<(FinalizerFn, ClientData)>> {
        let Some(base) = heap.base(obj) else {
            // Never collected, so the finalizer would never run.
            return Ok(None);
        };
        if obj - base != HEADER_SIZE {
            tracing::warn!(
                target: "otter::gc::debug",
                "debug_register_finalizer called with non-base-pointer {:#x}",
                obj
            );
        }

        let previous = match finalizer {
            None => registry.register_finalizer_with(heap, base, None, 0, mark_proc)?,
            Some(f) => {
                let closure = DebugClosure {
                    finalizer: f,
                    client_data,
                }
                .alloc(heap)?;
                // An unregistered closure is simply garbage.
                registry.register_finalizer_with(
                    heap,
                    base,
                    Some(debug_invoke_finalizer),
                    closure,
                    mark_proc,
                )?
            }
        };

        Ok(previous.map(|(f, data)| {
            if is_debug_trampoline(f) {
                // SAFETY: the replaced registration kept this closure alive
                // until now.
                let closure = unsafe { DebugClosure::read(data) };
                (closure.finalizer, closure.client_data)
            } else {
                tracing::warn!(
                    target: "otter::gc::debug",
                    "Debuggable object at {:#x} had a non-debug finalizer",
                    obj
                );
                (f, data)
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FinalizeConfig;
    use crate::debug::header::AllocSite;
    use crate::heap::ObjectKind;
    use crate::mark_sweep::MarkSweepHeap;
    use std::cell::RefCell;
    use std::sync::Arc;

    thread_local! {
        static SEEN: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    }

    fn record(obj: usize, data: usize) {
        SEEN.with(|seen| seen.borrow_mut().push((obj, data)));
    }

    fn other(_obj: usize, _data: usize) {}

    fn setup() -> (Arc<FinalizationRegistry>, DebugAllocator, MarkSweepHeap) {
        let config = FinalizeConfig::default();
        let registry = Arc::new(FinalizationRegistry::new(config.clone()));
        let heap = MarkSweepHeap::new(Arc::clone(&registry));
        (registry, DebugAllocator::new(config), heap)
    }

    #[test]
    fn test_trampoline_passes_client_pointer() {
        let (registry, debug, heap) = setup();
        let p = debug.debug_malloc(&heap, 16, AllocSite::caller()).unwrap();
        let prev = debug
            .debug_register_finalizer(&heap, &registry, p, Some(record), 99)
            .unwrap();
        assert!(prev.is_none());

        assert!(heap.collect());
        assert_eq!(SEEN.with(|seen| seen.borrow().clone()), vec![(p, 99)]);
    }

    #[test]
    fn test_previous_closure_is_unwrapped() {
        let (registry, debug, heap) = setup();
        let p = debug.debug_malloc(&heap, 16, AllocSite::caller()).unwrap();
        debug
            .debug_register_finalizer(&heap, &registry, p, Some(record), 1)
            .unwrap();
        let (prev_fn, prev_data) = debug
            .debug_register_finalizer_no_order(&heap, &registry, p, Some(other), 2)
            .unwrap()
            .unwrap();
        assert!(std::ptr::fn_addr_eq(prev_fn, record as FinalizerFn));
        assert_eq!(prev_data, 1);

        let (prev_fn, prev_data) = debug
            .debug_register_finalizer(&heap, &registry, p, None, 0)
            .unwrap()
            .unwrap();
        assert!(std::ptr::fn_addr_eq(prev_fn, other as FinalizerFn));
        assert_eq!(prev_data, 2);
        assert_eq!(registry.stats().finalizer_entries, 0);
    }

    #[test]
    fn test_client_data_survives_until_finalizer_runs() {
        let config = FinalizeConfig {
            finalize_on_demand: true,
            ..FinalizeConfig::default()
        };
        let registry = Arc::new(FinalizationRegistry::new(config.clone()));
        let heap = MarkSweepHeap::new(Arc::clone(&registry));
        let debug = DebugAllocator::new(config);
        let p = debug.debug_malloc(&heap, 16, AllocSite::caller()).unwrap();
        let data = heap.alloc(16, ObjectKind::Normal).unwrap();
        debug
            .debug_register_finalizer(&heap, &registry, p, Some(record), data)
            .unwrap();

        assert!(heap.collect());
        assert!(heap.base(data).is_some());
        // Still referenced from the run queue.
        assert!(heap.collect());
        assert!(heap.base(data).is_some());

        assert_eq!(registry.invoke_finalizers(), 1);
        assert_eq!(SEEN.with(|seen| seen.borrow().clone()), vec![(p, data)]);
    }

    #[test]
    fn test_closure_allocation_failure_is_reported() {
        let (registry, debug, heap) = setup();
        let p = debug.debug_malloc(&heap, 16, AllocSite::caller()).unwrap();
        heap.set_alloc_limit(Some(heap.total_bytes()));
        let result = debug.debug_register_finalizer(&heap, &registry, p, Some(record), 0);
        assert_eq!(result.err(), Some(GcError::OutOfMemory));
        assert_eq!(registry.stats().finalizer_entries, 0);
    }

    #[test]
    fn test_non_heap_object_is_not_registered() {
        let (registry, debug, heap) = setup();
        let local = 0usize;
        let addr = &local as *const usize as usize;
        let prev = debug
            .debug_register_finalizer(&heap, &registry, addr, Some(record), 0)
            .unwrap();
        assert!(prev.is_none());
        assert_eq!(registry.stats().finalizer_entries, 0);
    }
}
