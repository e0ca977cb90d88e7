//! # Otter Finalize
//!
//! Finalization and weak-reference support for a conservative, non-moving
//! mark-sweep collector.
//!
//! ## Design
//!
//! - **Disappearing links**: word-sized cells cleared when their target dies
//! - **Finalizers**: run in topological order, with per-object marking rules
//!   for self-cycles, unordered finalization and unreachable-only resurrection
//! - **Debug allocation**: headers recording allocation sites, trailing
//!   canaries, leak reports and back-pointer backtraces
//! - **Reference heap**: [`MarkSweepHeap`] drives the whole cycle

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod debug;
pub mod disappearing_link;
pub mod error;
pub mod finalization;
pub mod hash_table;
pub mod heap;
pub mod hidden;
mod invoke;
pub mod mark_proc;
pub mod mark_sweep;

pub use config::{FinalizeConfig, OomHook};
pub use debug::{AllocSite, DebugAllocator};
pub use disappearing_link::{DisappearingLink, LinkStatus};
pub use error::{GcError, GcResult};
pub use finalization::{
    ClientData, FinalizableObject, FinalizationRegistry, FinalizationStats, FinalizerFn,
    ReadyFinalizer,
};
pub use heap::{GRANULE, Heap, HeapSection, ObjectKind, WORD};
pub use hidden::HiddenPointer;
pub use mark_proc::MarkProc;
pub use mark_sweep::{HeapStats, MarkSweepHeap};
