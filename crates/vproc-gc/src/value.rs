//! Tagged machine words.
//!
//! A [`Value`] is either an immediate (low two bits non-zero; the runtime's
//! integers and well-known constants are odd) or a word-aligned pointer to
//! the first data word of a heap object.

use std::fmt;

/// One 64-bit tagged word as seen by mutator code and the collector.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// The unit value.
    pub const UNIT: Self = Self(1);
    /// The empty list.
    pub const NIL: Self = Self(1);
    /// Boolean false.
    pub const FALSE: Self = Self(1);
    /// Boolean true.
    pub const TRUE: Self = Self(3);

    /// Wraps a raw word without interpretation.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Tags an integer as an immediate: `(n << 1) | 1`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_int(n: i64) -> Self {
        Self(((n << 1) | 1) as u64)
    }

    /// Untags an odd immediate; `None` for even words.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_int(self) -> Option<i64> {
        if self.0 & 1 == 1 {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    /// Converts a Rust boolean.
    #[inline]
    #[must_use]
    pub const fn from_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    /// Builds a pointer value from an object's data address.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        debug_assert!(addr & 7 == 0, "object pointers are word aligned");
        Self(addr as u64)
    }

    /// Builds a pointer value from a raw pointer.
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::from_addr(ptr as usize)
    }

    /// A word is a (potential) pointer when its low two bits are clear.
    #[inline]
    #[must_use]
    pub const fn is_ptr(self) -> bool {
        self.0 & 3 == 0
    }

    /// The word read as an address.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn addr(self) -> usize {
        self.0 as usize
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::UNIT
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ptr() {
            write!(f, "Ptr({:#x})", self.0)
        } else if let Some(n) = self.as_int() {
            write!(f, "Imm({n})")
        } else {
            write!(f, "Word({:#x})", self.0)
        }
    }
}

/// Address of a piece of generated code.
///
/// Code addresses are stored in non-pointer fields of Mixed objects, so the
/// collector never follows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeAddr(pub u64);

impl CodeAddr {
    /// The word stored in an object field.
    #[inline]
    #[must_use]
    pub const fn as_value(self) -> Value {
        Value(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_tagging() {
        for n in [-5_i64, -1, 0, 1, 42, i64::MAX >> 1] {
            let v = Value::from_int(n);
            assert!(!v.is_ptr());
            assert_eq!(v.as_int(), Some(n));
        }
    }

    #[test]
    fn test_constants_are_immediates() {
        for v in [Value::UNIT, Value::NIL, Value::TRUE, Value::FALSE] {
            assert!(!v.is_ptr());
        }
        assert_eq!(Value::from_bool(true), Value::TRUE);
        assert_eq!(Value::from_bool(false), Value::FALSE);
        assert_ne!(Value::TRUE, Value::FALSE);
    }

    #[test]
    fn test_pointer_classification() {
        let v = Value::from_addr(0x1000);
        assert!(v.is_ptr());
        assert_eq!(v.addr(), 0x1000);
        assert_eq!(v.as_int(), None);
        // Low bits `10` are neither an int nor a pointer.
        assert!(!Value::from_raw(0x1002).is_ptr());
    }
}
