//! Error types and the fatal-error path.

use std::fmt;
use std::io;

/// A header word or header construction that violates the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Low bits `110`, which no shape uses.
    InvalidTag(u64),
    /// A Mixed object longer than its pointer mask.
    MixedTooWide {
        /// Requested length in words.
        len: usize,
    },
    /// Mask bits set at or above the object length.
    MaskOutOfRange {
        /// Offending mask.
        mask: u64,
        /// Object length in words.
        len: usize,
    },
    /// A length that does not fit in the header.
    LengthOverflow(u64),
    /// A forwarding target that is not word aligned.
    MisalignedForward(usize),
    /// A forwarding target too large to shift into a header word.
    ForwardOutOfRange(usize),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTag(word) => write!(f, "invalid header word {word:#x}"),
            Self::MixedTooWide { len } => {
                write!(f, "mixed object of {len} words exceeds the pointer mask")
            }
            Self::MaskOutOfRange { mask, len } => {
                write!(f, "pointer mask {mask:#b} has bits beyond length {len}")
            }
            Self::LengthOverflow(len) => write!(f, "length {len} does not fit in a header"),
            Self::MisalignedForward(addr) => write!(f, "unaligned forwarding target {addr:#x}"),
            Self::ForwardOutOfRange(addr) => {
                write!(f, "forwarding target {addr:#x} does not fit in a header")
            }
        }
    }
}

impl std::error::Error for HeaderError {}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The vproc heap size is below the chunk granule or above the address space.
    HeapSizeOutOfRange(u32),
    /// The nursery bound is smaller than the minimum nursery.
    NurseryTooSmall(usize),
    /// The major GC threshold leaves no room for a nursery.
    ThresholdOutOfRange(usize),
    /// Zero vprocs, or more than the chunk directory can name.
    VProcCount(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeapSizeOutOfRange(log2) => write!(f, "vproc heap size 2^{log2} out of range"),
            Self::NurseryTooSmall(sz) => write!(f, "maximum nursery size {sz} is too small"),
            Self::ThresholdOutOfRange(sz) => write!(f, "major GC threshold {sz} out of range"),
            Self::VProcCount(n) => write!(f, "invalid number of vprocs: {n}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors surfaced by runtime construction and the execution loop.
#[derive(Debug)]
pub enum RuntimeError {
    /// Invalid configuration.
    Config(ConfigError),
    /// Reserving heap memory failed.
    Io(io::Error),
    /// Mutator code raised an exception nobody handled.
    UncaughtException {
        /// The vproc that was running it.
        vproc: usize,
    },
    /// Mutator code asked for something the loop cannot do.
    Protocol(&'static str),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Io(err) => write!(f, "heap reservation failed: {err}"),
            Self::UncaughtException { vproc } => write!(f, "uncaught exception on vproc {vproc}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for RuntimeError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<io::Error> for RuntimeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Reports a fatal runtime condition and terminates the process.
pub fn die(msg: &str) -> ! {
    crate::tracing::internal::log_fatal(msg);
    eprintln!("vproc-gc: fatal error: {msg}");
    std::process::exit(1)
}
