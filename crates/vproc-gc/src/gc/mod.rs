//! Garbage collection.
//!
//! - [`minor`]: the per-vproc copying collector
//! - [`major`]: the hand-off to the global collector
//! - [`check`]: post-collection consistency checks
//! - [`roots`]: root slot bookkeeping

pub mod check;
pub mod major;
pub mod minor;
pub mod roots;

pub use check::{check_minor_gc, report_diagnostics, DiagnosticKind, HeapDiagnostic, Location};
pub use major::{InPlaceMajorCollector, MajorCollector, MajorGcRequest};
pub use minor::minor_gc;
pub use roots::{RootSet, RootSlot};
