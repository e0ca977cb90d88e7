//! Heap checking and smashed-object reporting.
//!
//! Corruption is never fatal. Clobbered addresses are collected in a small
//! saturating list and reported in one batch after the collection.

use std::fmt;
use std::sync::atomic::Ordering;

use super::alloc::DebugAllocator;
use super::header::{
    self, DEBUG_BYTES, DebugInfo, FREED_MEM_MARKER, HEADER_SIZE, has_debug_info, payload_of,
    read_header,
};
use crate::heap::{Heap, ObjectKind, WORD};

/// Capacity of the smashed-object list.
pub const MAX_SMASHED: usize = 20;

/// Fixed-capacity list of clobbered addresses. On overflow the first
/// `MAX_SMASHED - 1` entries are kept and the last slot holds the most
/// recent address.
#[derive(Debug)]
pub(crate) struct SmashedList {
    entries: [usize; MAX_SMASHED],
    len: usize,
}

impl SmashedList {
    pub(crate) const fn new() -> Self {
        Self {
            entries: [0; MAX_SMASHED],
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, addr: usize) {
        if self.len < MAX_SMASHED {
            self.entries[self.len] = addr;
            self.len += 1;
        } else {
            self.entries[MAX_SMASHED - 1] = addr;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn drain(&mut self) -> Vec<usize> {
        let taken = self.entries[..self.len].to_vec();
        self.entries = [0; MAX_SMASHED];
        self.len = 0;
        taken
    }
}

/// Human-readable description of a heap object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescription {
    /// Client-visible address (past the debug header, if any)
    pub address: usize,
    /// Allocation label, for debug objects
    pub label: Option<&'static str>,
    /// Allocation line, for debug objects
    pub line: usize,
    /// Requested size for debug objects, block size otherwise
    pub size: usize,
    /// Object kind
    pub kind: Option<ObjectKind>,
}

impl fmt::Display for ObjectDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => write!(f, "{:#x} ({}:{}, sz={}", self.address, label, self.line, self.size)?,
            None => write!(f, "{:#x} (appr. sz={}", self.address, self.size)?,
        }
        match self.kind {
            Some(kind) => write!(f, ", {:?})", kind),
            None => write!(f, ")"),
        }
    }
}

/// One entry of a smashed-object report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmashedReport {
    /// Clobbered address
    pub clobbered: usize,
    /// Client-visible address of the object containing it
    pub object: usize,
    /// Allocation label, unless the header itself was smashed
    pub label: Option<&'static str>,
    /// Allocation line
    pub line: usize,
    /// Recorded (or, for smashed headers, approximate) size
    pub size: usize,
}

/// Describe the object containing `addr`.
pub fn describe_object<H: Heap + ?Sized>(heap: &H, addr: usize) -> Option<ObjectDescription> {
    let base = heap.base(addr)?;
    let block_size = heap.object_size(base)?;
    let kind = heap.kind(base);
    let description = match has_debug_info(heap, base) {
        DebugInfo::None => ObjectDescription {
            address: base,
            label: None,
            line: 0,
            size: block_size,
            kind,
        },
        DebugInfo::Live | DebugInfo::Freed => {
            // SAFETY: has_debug_info checked the block holds a header.
            let hdr = unsafe { read_header(base) };
            ObjectDescription {
                address: payload_of(base),
                label: header::header_label(&hdr),
                line: hdr.line,
                size: hdr.size,
                kind,
            }
        }
    };
    Some(description)
}

/// Build and log the report for a clobbered address.
pub(crate) fn report_smashed<H: Heap + ?Sized>(
    heap: &H,
    msg: &str,
    base: usize,
    clobbered: usize,
) -> SmashedReport {
    let block_size = heap.object_size(base).unwrap_or(0);
    let object = payload_of(base);
    // The label is only trusted when the size field is intact and agrees
    // with the block.
    let intact = (block_size >= DEBUG_BYTES && clobbered > header::size_field_addr(base))
        .then(|| {
            // SAFETY: base is a live heap object of at least DEBUG_BYTES.
            unsafe { read_header(base) }
        })
        .filter(|hdr| hdr.label_ptr != 0 && hdr.size.saturating_add(DEBUG_BYTES) <= block_size);

    let report = match intact {
        Some(hdr) => SmashedReport {
            clobbered,
            object,
            label: header::header_label(&hdr),
            line: hdr.line,
            size: hdr.size,
        },
        None => SmashedReport {
            clobbered,
            object,
            label: None,
            line: 0,
            size: block_size.saturating_sub(DEBUG_BYTES),
        },
    };

    tracing::error!(
        target: "otter::gc::debug",
        clobbered = format_args!("{:#x}", clobbered),
        object = format_args!("{:#x}", object),
        "{} {:#x} in or near object at {:#x} ({}:{}, sz={})",
        msg,
        clobbered,
        object,
        report.label.unwrap_or("<smashed>"),
        report.line,
        report.size
    );
    report
}

impl DebugAllocator {
    pub(crate) fn add_smashed(&self, addr: usize) {
        self.smashed.lock().push(addr);
        self.have_errors.store(true, Ordering::Relaxed);
    }

    /// Number of clobbered addresses waiting to be reported.
    pub fn smashed_count(&self) -> usize {
        self.smashed.lock().len()
    }

    /// Check every marked debug object. Clobbered addresses are queued for
    /// [`DebugAllocator::print_all_smashed`].
    ///
    /// Must run after marking, before sweeping.
    pub fn check_heap<H: Heap + ?Sized>(&self, heap: &H) {
        if !self.debugging_started() {
            return;
        }
        let mut objects = Vec::new();
        heap.for_each_object(&mut |base, _size, marked| {
            if marked {
                objects.push(base);
            }
        });
        for base in objects {
            if has_debug_info(heap, base) != DebugInfo::Live {
                continue;
            }
            if let Some(clobbered) = header::check_annotated_object(heap, base) {
                self.add_smashed(clobbered);
            }
        }
    }

    /// Log and clear the smashed list.
    pub fn print_all_smashed<H: Heap + ?Sized>(&self, heap: &H) -> Vec<SmashedReport> {
        let smashed = self.smashed.lock().drain();
        if smashed.is_empty() {
            return Vec::new();
        }
        tracing::error!(
            target: "otter::gc::debug",
            count = smashed.len(),
            "found smashed heap objects"
        );
        smashed
            .into_iter()
            .filter_map(|clobbered| {
                let Some(base) = heap.base(clobbered) else {
                    tracing::error!(
                        target: "otter::gc::debug",
                        "smashed location {:#x} is no longer in the heap",
                        clobbered
                    );
                    return None;
                };
                Some(report_smashed(heap, "", base, clobbered))
            })
            .collect()
    }

    /// Decide whether the unmarked object at `base` is a leak.
    ///
    /// Objects that were never freed through the debug allocator are leaks.
    /// Freed objects are validated instead: if anything overwrote the freed
    /// marker, the object is re-marked and the location recorded.
    pub fn check_leaked<H: Heap + ?Sized>(&self, heap: &H, base: usize) -> bool {
        if has_debug_info(heap, base) != DebugInfo::Freed {
            return true;
        }
        let Some(block_size) = heap.object_size(base) else {
            return false;
        };
        let payload = payload_of(base);
        let words = (block_size - HEADER_SIZE) / WORD;
        for i in 0..words {
            let addr = payload + i * WORD;
            // SAFETY: [payload, base + block_size) lies inside the block.
            let value = unsafe { std::ptr::read(addr as *const usize) };
            if value != FREED_MEM_MARKER {
                // Written after free: keep it for this cycle.
                heap.set_mark_bit(base);
                self.add_smashed(addr);
                break;
            }
        }
        false
    }

    /// Describe the object containing `addr` and log it.
    pub fn print_object<H: Heap + ?Sized>(&self, heap: &H, addr: usize) -> Option<ObjectDescription> {
        let description = describe_object(heap, addr)?;
        tracing::info!(target: "otter::gc::debug", "{}", description);
        Some(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FinalizeConfig;
    use crate::debug::header::{AllocSite, header_mut};
    use crate::finalization::FinalizationRegistry;
    use crate::mark_sweep::MarkSweepHeap;
    use std::sync::Arc;

    #[test]
    fn test_smashed_list_saturates() {
        let mut list = SmashedList::new();
        for i in 0..(MAX_SMASHED + 5) {
            list.push(0x1000 + i);
        }
        assert_eq!(list.len(), MAX_SMASHED);
        let entries = list.drain();
        assert_eq!(entries.len(), MAX_SMASHED);
        assert_eq!(entries[0], 0x1000);
        assert_eq!(entries[MAX_SMASHED - 2], 0x1000 + MAX_SMASHED - 2);
        assert_eq!(entries[MAX_SMASHED - 1], 0x1000 + MAX_SMASHED + 4);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_description_display() {
        let description = ObjectDescription {
            address: 0x40,
            label: Some("main.rs"),
            line: 12,
            size: 100,
            kind: Some(ObjectKind::Normal),
        };
        assert_eq!(description.to_string(), "0x40 (main.rs:12, sz=100, Normal)");
    }

    #[test]
    fn test_report_ignores_label_of_inconsistent_header() {
        let config = FinalizeConfig::default();
        let heap = MarkSweepHeap::new(Arc::new(FinalizationRegistry::new(config.clone())));
        let debug = DebugAllocator::new(config);
        let p = debug
            .debug_malloc(&heap, 32, AllocSite::new("check.rs", 7))
            .unwrap();
        let base = heap.base(p).unwrap();
        let block_size = heap.object_size(base).unwrap();
        let canary = p + 32;

        let report = report_smashed(&heap, "", base, canary);
        assert_eq!(report.label, Some("check.rs"));
        assert_eq!(report.line, 7);

        let label_len = unsafe { header_mut(base).label_len };
        unsafe { header_mut(base).label_len = usize::MAX / 2 };
        assert_eq!(report_smashed(&heap, "", base, canary).label, None);
        unsafe { header_mut(base).label_len = label_len };

        unsafe { header_mut(base).size = block_size };
        let report = report_smashed(&heap, "", base, canary);
        assert_eq!(report.label, None);
        assert_eq!(report.size, block_size - DEBUG_BYTES);
        unsafe { header_mut(base).size = 32 };
    }
}
