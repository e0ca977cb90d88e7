//! Back pointers and random backtraces.
//!
//! When back pointers are kept, the marker records in each debug header the
//! address it first reached the object from. Following those records from a
//! random live object explains why it was retained.

use rand::Rng;

use super::check::{ObjectDescription, describe_object};
use super::header::{DebugInfo, HEADER_SIZE, has_debug_info, header_mut, read_header};
use crate::heap::Heap;
use crate::hidden::HiddenPointer;

/// Random attempts before giving up on finding a marked object.
const MAX_ADDRESS_ATTEMPTS: usize = 10_000;

/// Longest referrer chain followed by [`print_backtrace`].
const MAX_BACKTRACE_DEPTH: usize = 10_000;

/// What a debug header's back pointer says about an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Not a debug object
    NoDebugInfo,
    /// Never reached during marking
    Unreferenced,
    /// First reached while marking from a finalizable object
    FinalizerReferenced,
    /// Reached from a root slot at this address
    FromRoot(usize),
    /// Reached from a heap object (client-visible base) at this offset
    FromHeap {
        /// Referring object
        base: usize,
        /// Offset of the referring word
        offset: usize,
    },
}

/// One level of a backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceLevel {
    /// Offset of the pointer inside the referring object
    pub offset: usize,
    /// The referring object
    pub object: Option<ObjectDescription>,
}

/// Why a backtrace stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktraceEnd {
    /// Reached a root at this address
    Root(usize),
    /// Reached the finalizer tables
    Finalizer,
    /// No referrer recorded
    Unreferenced,
    /// Hit an object without debug info
    NoDebugInfo,
    /// Gave up after too many levels
    TooDeep,
}

/// Referrer chain for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    /// Address the trace started from
    pub address: usize,
    /// Object containing `address`
    pub object: Option<ObjectDescription>,
    /// Referrers, nearest first
    pub levels: Vec<BacktraceLevel>,
    /// How the chain ended
    pub end: BacktraceEnd,
}

/// Record `source` as the referrer of the debug object at `dest`.
pub fn store_back_pointer<H: Heap + ?Sized>(heap: &H, source: usize, dest: usize) {
    write_back_pointer(heap, dest, HiddenPointer::hide(source));
}

/// Record that `dest` was first reached from the finalizer tables.
pub fn marked_for_finalization<H: Heap + ?Sized>(heap: &H, dest: usize) {
    write_back_pointer(heap, dest, HiddenPointer::MARKED_FOR_FINALIZATION);
}

fn write_back_pointer<H: Heap + ?Sized>(heap: &H, dest: usize, value: HiddenPointer) {
    if has_debug_info(heap, dest) == DebugInfo::Live {
        // SAFETY: dest is a live debug object.
        unsafe { header_mut(dest).back_ptr = value };
    }
}

/// Interpret the back pointer of the object containing `dest`.
pub fn back_ptr_info<H: Heap + ?Sized>(heap: &H, dest: usize) -> RefKind {
    let Some(base) = heap.base(dest) else {
        return RefKind::NoDebugInfo;
    };
    if has_debug_info(heap, base) != DebugInfo::Live {
        return RefKind::NoDebugInfo;
    }
    // SAFETY: base is a live debug object.
    let back_ptr = unsafe { read_header(base) }.back_ptr;
    if back_ptr == HiddenPointer::MARKED_FOR_FINALIZATION {
        return RefKind::FinalizerReferenced;
    }
    if back_ptr == HiddenPointer::NOT_MARKED {
        return RefKind::Unreferenced;
    }

    let source = back_ptr.reveal();
    match heap.base(source) {
        None => RefKind::FromRoot(source),
        Some(mut source_base) => {
            if has_debug_info(heap, source_base) == DebugInfo::Live {
                source_base += HEADER_SIZE;
            }
            RefKind::FromHeap {
                base: source_base,
                offset: source.saturating_sub(source_base),
            }
        }
    }
}

/// A uniformly chosen address inside the heap's sections. It need not lie
/// inside an object.
pub fn generate_random_heap_address<H: Heap + ?Sized>(heap: &H) -> Option<usize> {
    let sections = heap.sections();
    let total: usize = sections.iter().map(|s| s.len).sum();
    if total == 0 {
        return None;
    }
    let mut offset = rand::rng().random_range(0..total);
    for section in &sections {
        if offset < section.len {
            return Some(section.start + offset);
        }
        offset -= section.len;
    }
    None
}

/// A random address inside a marked heap object.
pub fn generate_random_valid_address<H: Heap + ?Sized>(heap: &H) -> Option<usize> {
    (0..MAX_ADDRESS_ATTEMPTS).find_map(|_| {
        let addr = generate_random_heap_address(heap)?;
        let base = heap.base(addr)?;
        heap.is_marked(base).then_some(addr)
    })
}

/// Follow back pointers from `addr`, logging each level.
pub fn print_backtrace<H: Heap + ?Sized>(heap: &H, addr: usize) -> Backtrace {
    let object = describe_object(heap, addr);
    if let Some(description) = &object {
        tracing::info!(target: "otter::gc::debug", "{}", description);
    }

    let mut levels = Vec::new();
    let mut current = addr;
    let end = loop {
        if levels.len() >= MAX_BACKTRACE_DEPTH {
            break BacktraceEnd::TooDeep;
        }
        match back_ptr_info(heap, current) {
            RefKind::Unreferenced => {
                tracing::info!(target: "otter::gc::debug", "Reference could not be found");
                break BacktraceEnd::Unreferenced;
            }
            RefKind::NoDebugInfo => {
                tracing::info!(
                    target: "otter::gc::debug",
                    "No debug info in object: Can't find reference"
                );
                break BacktraceEnd::NoDebugInfo;
            }
            RefKind::FromRoot(root) => {
                tracing::info!(
                    target: "otter::gc::debug",
                    "Reachable via {} levels of pointers from root at {:#x}",
                    levels.len(),
                    root
                );
                break BacktraceEnd::Root(root);
            }
            RefKind::FinalizerReferenced => {
                tracing::info!(
                    target: "otter::gc::debug",
                    "Reachable via {} levels of pointers from list of finalizable objects",
                    levels.len()
                );
                break BacktraceEnd::Finalizer;
            }
            RefKind::FromHeap { base, offset } => {
                let referrer = describe_object(heap, base);
                tracing::info!(
                    target: "otter::gc::debug",
                    "Reachable via {} levels of pointers from offset {} in object: {}",
                    levels.len(),
                    offset,
                    referrer
                        .as_ref()
                        .map_or_else(|| format!("{:#x}", base), ToString::to_string)
                );
                levels.push(BacktraceLevel {
                    offset,
                    object: referrer,
                });
                current = base;
            }
        }
    };

    Backtrace {
        address: addr,
        object,
        levels,
        end,
    }
}

/// Backtrace from a random live address, without collecting first.
pub fn generate_random_backtrace_no_gc<H: Heap + ?Sized>(heap: &H) -> Option<Backtrace> {
    let addr = generate_random_valid_address(heap)?;
    tracing::info!(target: "otter::gc::debug", "Chosen address {:#x} in object", addr);
    Some(print_backtrace(heap, addr))
}

/// Collect, then print a backtrace from a random live address.
///
/// Returns `None` if collection is disabled or the heap has no live objects.
pub fn generate_random_backtrace<H: Heap + ?Sized>(heap: &H) -> Option<Backtrace> {
    if !heap.collect() {
        tracing::error!(
            target: "otter::gc::debug",
            "Cannot generate a backtrace: garbage collection is disabled"
        );
        return None;
    }
    generate_random_backtrace_no_gc(heap)
}
