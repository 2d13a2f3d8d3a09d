//! Object header codec.
//!
//! Every heap object is preceded by one 64-bit header word. The low bits
//! select one of four shapes:
//!
//! | low bits | shape   | payload                                              |
//! |----------|---------|------------------------------------------------------|
//! | `xx1`    | Mixed   | bits 1..7 length in words, bits 7..63 pointer mask  |
//! | `010`    | Raw     | bits 3.. length in bytes                             |
//! | `100`    | Vector  | bits 3.. length in words, every word may be a pointer|
//! | `000`    | Forward | the whole word is `target << 3`                      |
//!
//! `110` is not a header; [`Header::decode`] reports it as an error.

use std::fmt;
use std::ptr::NonNull;

use crate::error::HeaderError;
use crate::heap::WORD_SIZE;

const TAG_MASK: u64 = 0b111;
const RAW_TAG: u64 = 0b010;
const VECTOR_TAG: u64 = 0b100;
const FORWARD_TAG: u64 = 0b000;
const LEN_SHIFT: u32 = 3;

const MIXED_LEN_SHIFT: u32 = 1;
const MIXED_LEN_BITS: u32 = 6;
const MIXED_MASK_SHIFT: u32 = 7;

/// Widest Mixed object the pointer mask can describe.
pub const MAX_MIXED_LEN: usize = 56;

/// Largest Raw byte count or Vector element count a header can carry.
pub const MAX_LEN: u64 = (1 << (64 - LEN_SHIFT)) - 1;

/// A decoded object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// A record whose field `i` may hold a pointer iff bit `i` of `mask` is set.
    Mixed {
        /// Pointer mask, one bit per field.
        mask: u64,
        /// Length in words.
        len: usize,
    },
    /// An array of words, each of which may be a pointer.
    Vector {
        /// Element count.
        len: usize,
    },
    /// Opaque bytes the collector never scans.
    Raw {
        /// Payload length in bytes.
        len_bytes: usize,
    },
    /// The object was copied; `0` is the copy's first data word.
    Forward(usize),
}

impl Header {
    /// Builds a Mixed header, rejecting lengths the mask cannot cover and
    /// mask bits at or above the length.
    pub const fn mixed(mask: u64, len: usize) -> Result<Self, HeaderError> {
        if len > MAX_MIXED_LEN {
            return Err(HeaderError::MixedTooWide { len });
        }
        if mask >> len != 0 {
            return Err(HeaderError::MaskOutOfRange { mask, len });
        }
        Ok(Self::Mixed { mask, len })
    }

    /// Builds a Vector header.
    pub const fn vector(len: usize) -> Result<Self, HeaderError> {
        if len as u64 > MAX_LEN {
            return Err(HeaderError::LengthOverflow(len as u64));
        }
        Ok(Self::Vector { len })
    }

    /// Builds a Raw header for `len_bytes` bytes of payload.
    pub const fn raw(len_bytes: usize) -> Result<Self, HeaderError> {
        if len_bytes as u64 > MAX_LEN {
            return Err(HeaderError::LengthOverflow(len_bytes as u64));
        }
        Ok(Self::Raw { len_bytes })
    }

    /// Builds a Forward header pointing at `target`.
    pub const fn forward(target: usize) -> Result<Self, HeaderError> {
        if target % WORD_SIZE != 0 {
            return Err(HeaderError::MisalignedForward(target));
        }
        if (target as u64) > MAX_LEN {
            return Err(HeaderError::ForwardOutOfRange(target));
        }
        Ok(Self::Forward(target))
    }

    /// Decodes a header word.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(word: u64) -> Result<Self, HeaderError> {
        if is_mixed_word(word) {
            let len = ((word >> MIXED_LEN_SHIFT) & ((1 << MIXED_LEN_BITS) - 1)) as usize;
            let mask = word >> MIXED_MASK_SHIFT;
            return Self::mixed(mask, len);
        }
        match word & TAG_MASK {
            FORWARD_TAG => Ok(Self::Forward((word >> LEN_SHIFT) as usize)),
            RAW_TAG => Ok(Self::Raw {
                len_bytes: (word >> LEN_SHIFT) as usize,
            }),
            VECTOR_TAG => Ok(Self::Vector {
                len: (word >> LEN_SHIFT) as usize,
            }),
            _ => Err(HeaderError::InvalidTag(word)),
        }
    }

    /// Encodes the header into its word.
    #[must_use]
    pub const fn encode(self) -> u64 {
        match self {
            Self::Mixed { mask, len } => {
                (mask << MIXED_MASK_SHIFT) | ((len as u64) << MIXED_LEN_SHIFT) | 1
            }
            Self::Vector { len } => ((len as u64) << LEN_SHIFT) | VECTOR_TAG,
            Self::Raw { len_bytes } => ((len_bytes as u64) << LEN_SHIFT) | RAW_TAG,
            Self::Forward(target) => (target as u64) << LEN_SHIFT,
        }
    }

    /// Payload size in words, or `None` for a forwarding header.
    #[must_use]
    pub const fn size_words(self) -> Option<usize> {
        match self {
            Self::Mixed { len, .. } | Self::Vector { len } => Some(len),
            Self::Raw { len_bytes } => Some(len_bytes.div_ceil(WORD_SIZE)),
            Self::Forward(_) => None,
        }
    }

    /// The pointer mask of a Mixed header.
    #[must_use]
    pub const fn mixed_mask(self) -> Option<u64> {
        match self {
            Self::Mixed { mask, .. } => Some(mask),
            _ => None,
        }
    }

    /// The copy's address if this header has been forwarded.
    #[must_use]
    pub const fn forward_target(self) -> Option<usize> {
        match self {
            Self::Forward(target) => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mixed { mask, len } => write!(f, "mixed[{len}; mask={mask:#b}]"),
            Self::Vector { len } => write!(f, "vector[{len}]"),
            Self::Raw { len_bytes } => write!(f, "raw[{len_bytes}B]"),
            Self::Forward(target) => write!(f, "forward->{target:#x}"),
        }
    }
}

/// `true` for a Mixed header word.
#[inline]
#[must_use]
pub const fn is_mixed_word(word: u64) -> bool {
    word & 1 == 1
}

/// `true` for a Forward header word.
#[inline]
#[must_use]
pub const fn is_forward_word(word: u64) -> bool {
    word & TAG_MASK == FORWARD_TAG
}

/// `true` for a Vector header word.
#[inline]
#[must_use]
pub const fn is_vector_word(word: u64) -> bool {
    word & TAG_MASK == VECTOR_TAG
}

/// `true` for a Raw header word.
#[inline]
#[must_use]
pub const fn is_raw_word(word: u64) -> bool {
    word & TAG_MASK == RAW_TAG
}

/// The header word of one heap object.
///
/// This is the only place the collector rewrites a header, and the only
/// rewrite it performs is the shape-to-Forward transition.
#[derive(Debug, Clone, Copy)]
pub struct HeaderCell {
    word: NonNull<u64>,
}

impl HeaderCell {
    /// Returns the header cell of the object whose first data word is at `data`.
    ///
    /// # Safety
    ///
    /// `data - WORD_SIZE` must be a valid, aligned header word for as long as
    /// the cell is used, and no other reference may alias it meanwhile.
    #[inline]
    #[must_use]
    pub unsafe fn of_object(data: usize) -> Self {
        // SAFETY: caller guarantees the header word exists, so it is non-null.
        let word = unsafe { NonNull::new_unchecked((data - WORD_SIZE) as *mut u64) };
        Self { word }
    }

    /// Address of the header word itself.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.word.as_ptr() as usize
    }

    /// Reads the raw word.
    #[inline]
    #[must_use]
    pub fn load(self) -> u64 {
        // SAFETY: validity is the constructor's contract.
        unsafe { self.word.as_ptr().read() }
    }

    /// Decodes the current header.
    pub fn decode(self) -> Result<Header, HeaderError> {
        Header::decode(self.load())
    }

    /// Overwrites the header.
    #[inline]
    pub fn store(self, header: Header) {
        // SAFETY: validity is the constructor's contract.
        unsafe { self.word.as_ptr().write(header.encode()) }
    }

    /// `true` once the object has been copied.
    #[inline]
    #[must_use]
    pub fn is_forwarded(self) -> bool {
        is_forward_word(self.load())
    }

    /// Records that the object now lives at `target`.
    ///
    /// A header is forwarded at most once.
    #[inline]
    pub fn forward_to(self, target: usize) {
        debug_assert!(!self.is_forwarded(), "header at {:#x} forwarded twice", self.addr());
        debug_assert!(target % WORD_SIZE == 0);
        // SAFETY: validity is the constructor's contract.
        unsafe { self.word.as_ptr().write((target as u64) << LEN_SHIFT) }
    }
}
