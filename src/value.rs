//! Tagged 64-bit object references.
//!
//! ```text
//! ...xxxxxxx1  fixnum, 63-bit signed payload
//! ...iiiii010  heap object index
//! ...iiiii100  symbol id
//! ...iiiii110  class or module id
//! 0, 8, 16, 24 false, true, nil, the "unspecified" sentinel
//! ```
//!
//! Fixnum tagging is order preserving, so native code compares tagged
//! fixnums directly.

use std::fmt;

use crate::runtime::class::ClassId;
use crate::runtime::symbol::Symbol;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(pub u64);

const TAG_MASK: u64 = 0b111;
const HEAP_TAG: u64 = 0b010;
const SYMBOL_TAG: u64 = 0b100;
const CLASS_TAG: u64 = 0b110;

impl Value {
    pub const FALSE: Value = Value(0);
    pub const TRUE: Value = Value(8);
    pub const NIL: Value = Value(16);
    /// Marks an optional parameter the caller did not supply.
    pub const UNDEF: Value = Value(24);

    pub const FIXNUM_MIN: i64 = -(1 << 62);
    pub const FIXNUM_MAX: i64 = (1 << 62) - 1;

    #[inline]
    pub fn fixnum(n: i64) -> Option<Value> {
        (Self::FIXNUM_MIN..=Self::FIXNUM_MAX)
            .contains(&n)
            .then(|| Value(((n as u64) << 1) | 1))
    }

    /// Small constants known to be in range.
    #[inline]
    pub const fn int(n: i32) -> Value {
        Value((((n as i64) as u64) << 1) | 1)
    }

    #[inline]
    pub fn is_fixnum(self) -> bool {
        self.0 & 1 == 1
    }

    #[inline]
    pub fn as_fixnum(self) -> Option<i64> {
        self.is_fixnum().then_some((self.0 as i64) >> 1)
    }

    #[inline]
    pub fn bool(b: bool) -> Value {
        if b { Value::TRUE } else { Value::FALSE }
    }

    /// Everything except `false` and `nil` is true.
    #[inline]
    pub fn is_truthy(self) -> bool {
        self != Value::FALSE && self != Value::NIL
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self == Value::NIL
    }

    #[inline]
    pub fn is_undef(self) -> bool {
        self == Value::UNDEF
    }

    pub fn heap(index: u32) -> Value {
        Value(((index as u64) << 3) | HEAP_TAG)
    }

    pub fn as_heap(self) -> Option<u32> {
        (self.0 & TAG_MASK == HEAP_TAG).then_some((self.0 >> 3) as u32)
    }

    pub fn symbol(sym: Symbol) -> Value {
        Value(((sym.0 as u64) << 3) | SYMBOL_TAG)
    }

    pub fn as_symbol(self) -> Option<Symbol> {
        (self.0 & TAG_MASK == SYMBOL_TAG).then_some(Symbol((self.0 >> 3) as u32))
    }

    pub fn class(id: ClassId) -> Value {
        Value(((id.0 as u64) << 3) | CLASS_TAG)
    }

    pub fn as_class(self) -> Option<ClassId> {
        (self.0 & TAG_MASK == CLASS_TAG).then_some(ClassId((self.0 >> 3) as u32))
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::FALSE => write!(f, "false"),
            Value::TRUE => write!(f, "true"),
            Value::NIL => write!(f, "nil"),
            Value::UNDEF => write!(f, "undef"),
            v => {
                if let Some(n) = v.as_fixnum() {
                    write!(f, "{n}")
                } else if let Some(i) = v.as_heap() {
                    write!(f, "heap#{i}")
                } else if let Some(s) = v.as_symbol() {
                    write!(f, "sym#{}", s.0)
                } else if let Some(c) = v.as_class() {
                    write!(f, "class#{}", c.0)
                } else {
                    write!(f, "Value({:#x})", v.0)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnum_round_trip_at_boundaries() {
        for n in [0, 1, -1, Value::FIXNUM_MAX, Value::FIXNUM_MIN] {
            assert_eq!(Value::fixnum(n).unwrap().as_fixnum(), Some(n));
        }
        assert!(Value::fixnum(Value::FIXNUM_MAX + 1).is_none());
        assert!(Value::fixnum(Value::FIXNUM_MIN - 1).is_none());
    }

    #[test]
    fn tagging_preserves_order() {
        let a = Value::fixnum(-5).unwrap();
        let b = Value::fixnum(3).unwrap();
        assert!((a.0 as i64) < (b.0 as i64));
    }

    #[test]
    fn specials_are_not_fixnums() {
        for v in [Value::FALSE, Value::TRUE, Value::NIL, Value::UNDEF] {
            assert!(!v.is_fixnum());
            assert!(v.as_heap().is_none() && v.as_symbol().is_none() && v.as_class().is_none());
        }
    }

    #[test]
    fn truthiness() {
        assert!(!Value::FALSE.is_truthy());
        assert!(!Value::NIL.is_truthy());
        assert!(Value::TRUE.is_truthy());
        assert!(Value::int(0).is_truthy());
    }

    #[test]
    fn pointer_tags_are_distinct() {
        let h = Value::heap(7);
        let s = Value::symbol(Symbol(7));
        let c = Value::class(ClassId(7));
        assert_eq!(h.as_heap(), Some(7));
        assert_eq!(s.as_symbol(), Some(Symbol(7)));
        assert_eq!(c.as_class(), Some(ClassId(7)));
        assert!(h.as_symbol().is_none() && s.as_class().is_none() && c.as_heap().is_none());
    }
}
