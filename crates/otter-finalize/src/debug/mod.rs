//! Debug allocation layer: headers with allocation sites and canaries,
//! smashed-object detection, leak checks and back-pointer backtraces.

pub mod alloc;
pub mod backtrace;
pub mod check;
pub mod finalizer;
pub mod header;

pub use alloc::DebugAllocator;
pub use backtrace::{
    Backtrace, BacktraceEnd, BacktraceLevel, RefKind, back_ptr_info,
    generate_random_backtrace, generate_random_backtrace_no_gc, generate_random_heap_address,
    generate_random_valid_address, marked_for_finalization, print_backtrace, store_back_pointer,
};
pub use check::{MAX_SMASHED, ObjectDescription, SmashedReport, describe_object};
pub use header::{
    AllocSite, DEBUG_BYTES, DebugInfo, FREED_MEM_MARKER, HEADER_SIZE, check_annotated_object,
    has_debug_info,
};
