//! Post-collection heap consistency checks.
//!
//! After a minor collection every pointer reachable from the roots or from
//! old space should lead into this vproc's old space or into to-space.
//! [`check_minor_gc`] walks both and reports anything else. It never
//! aborts; the findings are data for the caller (or, with the `heap-check`
//! feature, printed after every collection).

use std::fmt;

use crate::chunk::{ChunkDirectory, ChunkStatus};
use crate::gc::roots::RootSet;
use crate::header::Header;
use crate::heap::{VProcHeap, WORD_SIZE};
use crate::tracing::internal as trace;
use crate::value::Value;
use crate::vproc::VProc;

/// What is wrong with a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Points into global from-space.
    FromSpace,
    /// Points into another vproc's local heap.
    Remote {
        /// The other vproc.
        owner: u32,
    },
    /// Points into this vproc's heap but above old space.
    OutOfBounds,
    /// Points into free memory.
    FreeSpace,
    /// A non-pointer field of a Mixed object holds something that looks
    /// like a managed address.
    PossiblePointer(ChunkStatus),
    /// A header in old space did not decode; the walk stopped there.
    BadHeader(u64),
}

/// Where a suspicious word was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Root slot `n` of the collection.
    Root(usize),
    /// Field `field` of the Mixed object at `object`.
    MixedField {
        /// Data address of the object.
        object: usize,
        /// Field index.
        field: usize,
    },
    /// Element `index` of the Vector at `object`.
    VectorElement {
        /// Data address of the object.
        object: usize,
        /// Element index.
        index: usize,
    },
    /// The forwarding header at this address.
    Forward(usize),
    /// The header word at this address.
    Header(usize),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root(i) => write!(f, "root[{i}]"),
            Self::MixedField { object, field } => write!(f, "mixed object {object:#x}+{field}"),
            Self::VectorElement { object, index } => write!(f, "vector {object:#x}[{index}]"),
            Self::Forward(addr) => write!(f, "forward pointer at {addr:#x}"),
            Self::Header(addr) => write!(f, "header at {addr:#x}"),
        }
    }
}

/// One finding of the consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapDiagnostic {
    /// The kind of problem.
    pub kind: DiagnosticKind,
    /// The offending word.
    pub value: Value,
    /// Where it was found.
    pub location: Location,
}

impl fmt::Display for HeapDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.value.raw();
        match self.kind {
            DiagnosticKind::FromSpace => {
                write!(f, "unexpected from-space pointer {v:#x} in {}", self.location)
            }
            DiagnosticKind::Remote { owner } => write!(
                f,
                "unexpected pointer {v:#x} into vproc {owner} in {}",
                self.location
            ),
            DiagnosticKind::OutOfBounds => {
                write!(f, "local pointer {v:#x} in {} is out of bounds", self.location)
            }
            DiagnosticKind::FreeSpace => {
                write!(f, "unexpected free-space pointer {v:#x} in {}", self.location)
            }
            DiagnosticKind::PossiblePointer(status) => {
                write!(f, "possible {status:?} pointer {v:#x} in {}", self.location)
            }
            DiagnosticKind::BadHeader(word) => {
                write!(f, "malformed header {word:#x} at {}", self.location)
            }
        }
    }
}

struct Checker<'a> {
    heap: &'a VProcHeap,
    chunks: &'a ChunkDirectory,
    owner: u32,
    diags: Vec<HeapDiagnostic>,
}

impl Checker<'_> {
    fn push(&mut self, kind: DiagnosticKind, value: Value, location: Location) {
        self.diags.push(HeapDiagnostic {
            kind,
            value,
            location,
        });
    }

    fn check_local_ptr(&mut self, v: Value, location: Location) {
        if !v.is_ptr() {
            return;
        }
        match self.chunks.classify(v.addr()) {
            ChunkStatus::ToSpace | ChunkStatus::Unmapped => {}
            ChunkStatus::FromSpace => self.push(DiagnosticKind::FromSpace, v, location),
            ChunkStatus::Free => self.push(DiagnosticKind::FreeSpace, v, location),
            ChunkStatus::VProc(owner) if owner != self.owner => {
                self.push(DiagnosticKind::Remote { owner }, v, location);
            }
            ChunkStatus::VProc(_) => {
                let base = self.heap.base();
                if v.addr().wrapping_sub(base) > self.heap.old_top() - base {
                    self.push(DiagnosticKind::OutOfBounds, v, location);
                }
            }
        }
    }

    fn check_possible_ptr(&mut self, v: Value, location: Location) {
        if !v.is_ptr() {
            return;
        }
        match self.chunks.classify(v.addr()) {
            ChunkStatus::Unmapped => {}
            status => self.push(DiagnosticKind::PossiblePointer(status), v, location),
        }
    }

    fn walk_old_space(&mut self) {
        let top = self.heap.old_top();
        let mut p = self.heap.base();
        while p < top {
            let word = self.heap.read_word(p);
            let header_addr = p;
            p += WORD_SIZE;
            match Header::decode(word) {
                Ok(Header::Mixed { mask, len }) => {
                    for field in 0..len {
                        let v = Value::from_raw(self.heap.read_word(p + field * WORD_SIZE));
                        let location = Location::MixedField { object: p, field };
                        if mask & (1 << field) != 0 {
                            self.check_local_ptr(v, location);
                        } else {
                            self.check_possible_ptr(v, location);
                        }
                    }
                    p += len * WORD_SIZE;
                }
                Ok(Header::Vector { len }) => {
                    for index in 0..len {
                        let v = Value::from_raw(self.heap.read_word(p + index * WORD_SIZE));
                        self.check_local_ptr(v, Location::VectorElement { object: p, index });
                    }
                    p += len * WORD_SIZE;
                }
                Ok(raw @ Header::Raw { .. }) => {
                    p += raw.size_words().unwrap_or(0) * WORD_SIZE;
                }
                Ok(Header::Forward(target)) => {
                    let location = Location::Forward(header_addr);
                    self.check_local_ptr(Value::from_addr(target), location);
                    match self.forwarded_size(target) {
                        Some(words) => p += words * WORD_SIZE,
                        None => {
                            self.push(DiagnosticKind::BadHeader(word), Value::from_raw(word), location);
                            return;
                        }
                    }
                }
                Err(_) => {
                    self.push(
                        DiagnosticKind::BadHeader(word),
                        Value::from_raw(word),
                        Location::Header(header_addr),
                    );
                    return;
                }
            }
        }
    }

    /// Size of the copy a forwarding header points at, if it is readable.
    fn forwarded_size(&self, target: usize) -> Option<usize> {
        let header_addr = target.checked_sub(WORD_SIZE)?;
        if !self.heap.contains(header_addr) {
            return None;
        }
        Header::decode(self.heap.read_word(header_addr))
            .ok()?
            .size_words()
    }
}

/// Checks the roots and the old space of `vp` after a minor collection.
#[must_use]
pub fn check_minor_gc(vp: &VProc, roots: &RootSet) -> Vec<HeapDiagnostic> {
    check_heap(vp.heap(), vp.chunks(), vp.id(), roots)
}

pub(crate) fn check_heap(
    heap: &VProcHeap,
    chunks: &ChunkDirectory,
    vproc: usize,
    roots: &RootSet,
) -> Vec<HeapDiagnostic> {
    let mut checker = Checker {
        heap,
        chunks,
        owner: u32::try_from(vproc).unwrap_or(u32::MAX),
        diags: Vec::new(),
    };
    for (i, slot) in roots.iter().enumerate() {
        checker.check_local_ptr(slot.get(), Location::Root(i));
    }
    checker.walk_old_space();
    checker.diags
}

/// Writes each diagnostic to stderr (and to `tracing` when enabled).
pub fn report_diagnostics(diags: &[HeapDiagnostic]) {
    for diag in diags {
        eprintln!("heap check: {diag}");
        trace::log_diagnostic(diag);
    }
}
