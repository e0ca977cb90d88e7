//! Running queued finalizers.
//!
//! Finalizers are client code: they may allocate, register finalizers or
//! trigger another collection. The registry lock is therefore only held
//! while popping the next entry, never while a callback runs.

use parking_lot::MutexGuard;

use crate::debug::backtrace;
use crate::finalization::{FinalizableObject, FinalizationRegistry, RegistryState};
use crate::heap::Heap;
use crate::mark_proc::MarkProc;

impl RegistryState {
    /// Nesting throttle for implicit invocation.
    ///
    /// Returns false when this call should be skipped. At nesting level `n`
    /// only every `2^n`-th opportunity runs finalizers.
    fn enter_finalizer_nesting(&mut self) -> bool {
        let level = self.nested;
        if level > 0 {
            self.skipped += 1;
            if u64::from(self.skipped) < 1u64 << level.min(63) {
                return false;
            }
            self.skipped = 0;
        }
        self.nested = level.saturating_add(1);
        true
    }
}

impl FinalizationRegistry {
    /// Whether any finalizer is waiting to run.
    pub fn should_invoke_finalizers(&self) -> bool {
        !self.state.lock().ready.is_empty()
    }

    /// Run every queued finalizer. Returns how many ran.
    ///
    /// Must be called without holding the registry lock. An entry stays in
    /// the running set, and so stays rooted, until its callback returns.
    pub fn invoke_finalizers(&self) -> usize {
        let mut count = 0;
        loop {
            let (finalizer, base, client_data) = {
                let mut state = self.state.lock();
                let Some(entry) = state.ready.pop() else {
                    break;
                };
                let call = (entry.finalizer, entry.base, entry.client_data);
                state.running.push(entry);
                call
            };
            finalizer(base, client_data);

            let mut state = self.state.lock();
            if let Some(pos) = state.running.iter().rposition(|r| r.base == base) {
                state.running.remove(pos);
            }
            count += 1;
        }
        count
    }

    /// Post-collection hook: run finalizers now or tell the client they are
    /// ready.
    ///
    /// With on-demand finalization the notifier fires at most once per
    /// collection. Otherwise the queue is drained here, unless nested
    /// invocation is being throttled.
    pub fn notify_or_invoke_finalizers<H: Heap + ?Sized>(&self, heap: &H) {
        let gc_no = heap.collection_count();
        let mut state = self.state.lock();

        if self.config.keep_back_ptrs
            && self.config.backtraces > 0
            && gc_no > state.last_back_trace_gc_no
        {
            // Block other callers while the lock is released.
            state.last_back_trace_gc_no = u64::MAX;
            for _ in 0..self.config.backtraces {
                MutexGuard::unlocked(&mut state, || {
                    backtrace::generate_random_backtrace_no_gc(heap);
                });
            }
            state.last_back_trace_gc_no = gc_no;
        }

        if state.ready.is_empty() {
            return;
        }

        if !self.config.finalize_on_demand {
            let run = state.enter_finalizer_nesting();
            drop(state);
            if run {
                self.invoke_finalizers();
                self.state.lock().nested = 0;
            }
            return;
        }

        let notifier = if state.last_finalizer_notification != gc_no {
            state.last_finalizer_notification = gc_no;
            state.notifier
        } else {
            None
        };
        drop(state);
        if let Some(notify) = notifier {
            notify();
        }
    }

    /// Install (or remove) the finalizer-ready notifier.
    pub fn set_finalizer_notifier(&self, notifier: Option<fn()>) {
        self.state.lock().notifier = notifier;
    }

    /// Currently installed notifier.
    pub fn finalizer_notifier(&self) -> Option<fn()> {
        self.state.lock().notifier
    }

    /// Run every registered finalizer regardless of reachability, repeating
    /// until the table stays empty. Intended for shutdown.
    pub fn finalize_all<H: Heap + ?Sized>(&self, heap: &H) {
        let mut state = self.state.lock();
        while !state.finalizers.is_empty() {
            let RegistryState {
                finalizers,
                ready,
                bytes_finalized,
                ..
            } = &mut *state;
            *bytes_finalized = 0;
            finalizers.extract_if(
                |_| true,
                |fo| {
                    let base = fo.base();
                    MarkProc::Normal.mark_from(heap, base);
                    heap.set_mark_bit(base);
                    *bytes_finalized += fo.object_size + std::mem::size_of::<FinalizableObject>();
                    ready.push(fo.into_ready());
                },
            );
            MutexGuard::unlocked(&mut state, || {
                self.invoke_finalizers();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FinalizeConfig;
    use crate::heap::ObjectKind;
    use crate::mark_sweep::MarkSweepHeap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn count(_obj: usize, data: usize) {
        // SAFETY: tests pass the address of a live AtomicUsize.
        let counter = unsafe { &*(data as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn ignore(_obj: usize, _data: usize) {}

    fn setup(config: FinalizeConfig) -> (Arc<FinalizationRegistry>, MarkSweepHeap) {
        let registry = Arc::new(FinalizationRegistry::new(config));
        let heap = MarkSweepHeap::new(Arc::clone(&registry));
        (registry, heap)
    }

    #[test]
    fn test_nesting_throttle_skips_exponentially() {
        let registry = FinalizationRegistry::new(FinalizeConfig::default());
        let mut state = registry.state.lock();

        assert!(state.enter_finalizer_nesting());
        assert_eq!(state.nested, 1);

        // Level 1: every second opportunity.
        assert!(!state.enter_finalizer_nesting());
        assert!(state.enter_finalizer_nesting());
        assert_eq!(state.nested, 2);

        // Level 2: every fourth.
        assert!(!state.enter_finalizer_nesting());
        assert!(!state.enter_finalizer_nesting());
        assert!(!state.enter_finalizer_nesting());
        assert!(state.enter_finalizer_nesting());
        assert_eq!(state.nested, 3);
    }

    #[test]
    fn test_invoke_drains_queue() {
        let (registry, heap) = setup(FinalizeConfig::default());
        let counter = AtomicUsize::new(0);
        let data = &counter as *const AtomicUsize as usize;
        for _ in 0..3 {
            let obj = heap.alloc(16, ObjectKind::Normal).unwrap();
            registry.register_finalizer(&heap, obj, Some(count), data).unwrap();
        }

        heap.clear_marks();
        registry.finalize(&heap);
        assert!(registry.should_invoke_finalizers());

        assert_eq!(registry.invoke_finalizers(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!registry.should_invoke_finalizers());
        assert_eq!(registry.invoke_finalizers(), 0);
    }

    #[test]
    fn test_finalize_all_runs_reachable_objects() {
        let (registry, heap) = setup(FinalizeConfig::default());
        let counter = AtomicUsize::new(0);
        let data = &counter as *const AtomicUsize as usize;
        let obj = heap.alloc(16, ObjectKind::Normal).unwrap();
        heap.add_root(obj);
        registry.register_finalizer(&heap, obj, Some(count), data).unwrap();

        registry.finalize_all(&heap);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().finalizer_entries, 0);
        assert_eq!(
            registry.stats().bytes_finalized,
            16 + std::mem::size_of::<FinalizableObject>()
        );
        heap.remove_root(obj);
    }

    #[test]
    fn test_running_entry_is_pushed_as_root() {
        let (registry, heap) = setup(FinalizeConfig::default());
        let obj = heap.alloc(16, ObjectKind::Normal).unwrap();
        registry.register_finalizer(&heap, obj, Some(ignore), 0).unwrap();
        heap.clear_marks();
        registry.finalize(&heap);

        // Simulate a callback in flight.
        {
            let mut state = registry.state.lock();
            let entry = state.ready.pop().unwrap();
            state.running.push(entry);
        }
        heap.clear_marks();
        registry.push_finalizer_structures(&heap);
        heap.drain_mark_stack();
        assert!(heap.is_marked(obj));

        registry.state.lock().running.clear();
        heap.clear_marks();
        registry.push_finalizer_structures(&heap);
        assert!(!heap.is_marked(obj));
    }

    #[test]
    fn test_notifier_fires_once_per_collection() {
        static NOTIFIED: AtomicUsize = AtomicUsize::new(0);
        fn notify() {
            NOTIFIED.fetch_add(1, Ordering::SeqCst);
        }

        let config = FinalizeConfig {
            finalize_on_demand: true,
            ..FinalizeConfig::default()
        };
        let (registry, heap) = setup(config);
        registry.set_finalizer_notifier(Some(notify));
        assert!(registry.finalizer_notifier().is_some());

        let obj = heap.alloc(16, ObjectKind::Normal).unwrap();
        registry.register_finalizer(&heap, obj, Some(ignore), 0).unwrap();

        assert!(heap.collect());
        assert_eq!(NOTIFIED.load(Ordering::SeqCst), 1);

        // Same collection number: no second notification.
        registry.notify_or_invoke_finalizers(&heap);
        registry.notify_or_invoke_finalizers(&heap);
        assert_eq!(NOTIFIED.load(Ordering::SeqCst), 1);

        // On-demand mode leaves the queue to the client.
        assert!(registry.should_invoke_finalizers());
        assert_eq!(registry.invoke_finalizers(), 1);
    }
}
