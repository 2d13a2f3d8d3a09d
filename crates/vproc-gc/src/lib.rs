//! Per-vproc generational garbage collection for a work-stealing runtime.
//!
//! Each virtual processor (vproc) owns an aligned heap with a nursery at
//! the top and an old-object area at the bottom. Mutator code allocates by
//! bumping a cursor and returns to the runtime through a small set of
//! [`RequestCode`]s when the nursery is full, when it is preempted, when it
//! sleeps or when it finishes. A minor collection copies every live nursery
//! object into the old area with a Cheney scan and hands off to a
//! [`MajorCollector`] when the old area runs low.
//!
//! # Quick Start
//!
//! ```
//! use vproc_gc::{minor_gc, Field, InPlaceMajorCollector, Runtime, RuntimeConfig, Value};
//!
//! let mut runtime = Runtime::new(RuntimeConfig::default()).unwrap();
//! let mut vp = runtime.take_vproc(0).unwrap();
//!
//! let leaf = vp.heap_mut().alloc_mixed(&[Field::Word(42)]).unwrap();
//! let pair = vp.heap_mut().alloc_mixed(&[Field::Ptr(leaf), Field::Ptr(Value::NIL)]).unwrap();
//! vp.regs.landing_pad = pair;
//!
//! let metrics = minor_gc(&mut vp, &mut InPlaceMajorCollector::default());
//! assert_eq!(metrics.local_ptrs, 2);
//!
//! let pair = vp.regs.landing_pad;
//! let leaf = vp.heap().load(pair, 0).unwrap();
//! assert_eq!(vp.heap().load(leaf, 0).unwrap().raw(), 42);
//! ```
//!
//! # Object layout
//!
//! Every object is preceded by a one-word [`Header`]. Mixed objects carry a
//! bit mask saying which fields are pointers; vectors hold only values; raw
//! objects hold only bytes. A collected nursery object's header is replaced
//! by a forwarding pointer to its copy.
//!
//! # Threads
//!
//! A [`VProc`] is owned by exactly one thread. Other threads reach it
//! through a [`VProcHandle`], which can preempt it, wake it or request a
//! global collection.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod apply;
pub mod chunk;
pub mod deque;
mod error;
pub mod gc;
pub mod header;

/// Heap layout and allocation.
///
/// Public so mutator code can allocate and inspect objects directly.
pub mod heap;

mod metrics;
mod runtime;
mod tracing;
mod value;
mod vproc;

pub use apply::{Frame, LoopExit, Mutator, MutatorStubs, RequestCode};
pub use chunk::{ChunkDirectory, ChunkStatus};
pub use deque::{Deque, DequeRef, DequeRole, DequeStore, WorkGroup};
pub use error::{ConfigError, HeaderError, RuntimeError};
pub use gc::{
    check_minor_gc, minor_gc, report_diagnostics, HeapDiagnostic, InPlaceMajorCollector,
    MajorCollector, MajorGcRequest, RootSet, RootSlot,
};
pub use header::{Header, HeaderCell};
pub use heap::{Field, HeapConfig, VProcHeap};
pub use metrics::{
    global_metrics, CollectionType, GlobalMetrics, MinorGcMetrics, PhaseTimer, VProcStats,
};
pub use runtime::{Runtime, RuntimeConfig};
pub use value::{CodeAddr, Value};
pub use vproc::{Registers, VProc, VProcHandle};
