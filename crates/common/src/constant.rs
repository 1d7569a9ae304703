//! Literal values that appear inside symbolic expressions.
//!
//! A [`Constant`] is what a `ldc.*`, `ldstr` or `ldnull` produces, what
//! constant folding computes, and what host functions consume and return.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::types::{FieldId, MethodId, Primitive, TypeId};

/// Target of a `ldtoken` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberToken {
    Type(TypeId),
    Field(FieldId),
    Method(MethodId),
}

/// A typed literal.
#[derive(Debug, Clone)]
pub enum Constant {
    /// The null reference.
    Null,
    Bool(bool),
    Char(u16),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(Arc<str>),
    Token(MemberToken),
}

// Floats compare by bit pattern so that constants can serve as hash keys
// inside expression nodes. NaN equals NaN with the same payload.
impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Null, Constant::Null) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Char(a), Constant::Char(b)) => a == b,
            (Constant::I8(a), Constant::I8(b)) => a == b,
            (Constant::U8(a), Constant::U8(b)) => a == b,
            (Constant::I16(a), Constant::I16(b)) => a == b,
            (Constant::U16(a), Constant::U16(b)) => a == b,
            (Constant::I32(a), Constant::I32(b)) => a == b,
            (Constant::U32(a), Constant::U32(b)) => a == b,
            (Constant::I64(a), Constant::I64(b)) => a == b,
            (Constant::U64(a), Constant::U64(b)) => a == b,
            (Constant::F32(a), Constant::F32(b)) => a.to_bits() == b.to_bits(),
            (Constant::F64(a), Constant::F64(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Token(a), Constant::Token(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Constant::Null => {}
            Constant::Bool(v) => v.hash(state),
            Constant::Char(v) => v.hash(state),
            Constant::I8(v) => v.hash(state),
            Constant::U8(v) => v.hash(state),
            Constant::I16(v) => v.hash(state),
            Constant::U16(v) => v.hash(state),
            Constant::I32(v) => v.hash(state),
            Constant::U32(v) => v.hash(state),
            Constant::I64(v) => v.hash(state),
            Constant::U64(v) => v.hash(state),
            Constant::F32(v) => v.to_bits().hash(state),
            Constant::F64(v) => v.to_bits().hash(state),
            Constant::Str(v) => v.hash(state),
            Constant::Token(v) => v.hash(state),
        }
    }
}

impl Constant {
    pub fn str(s: &str) -> Constant {
        Constant::Str(Arc::from(s))
    }

    /// Intrinsic type of the literal. `null` reports `object`.
    pub fn type_id(&self) -> TypeId {
        match self {
            Constant::Null => TypeId::OBJECT,
            Constant::Str(_) => TypeId::STRING,
            Constant::Token(_) => TypeId::RUNTIME_HANDLE,
            other => other.primitive().map_or(TypeId::OBJECT, Primitive::type_id),
        }
    }

    pub fn primitive(&self) -> Option<Primitive> {
        Some(match self {
            Constant::Bool(_) => Primitive::Bool,
            Constant::Char(_) => Primitive::Char,
            Constant::I8(_) => Primitive::I8,
            Constant::U8(_) => Primitive::U8,
            Constant::I16(_) => Primitive::I16,
            Constant::U16(_) => Primitive::U16,
            Constant::I32(_) => Primitive::I32,
            Constant::U32(_) => Primitive::U32,
            Constant::I64(_) => Primitive::I64,
            Constant::U64(_) => Primitive::U64,
            Constant::F32(_) => Primitive::F32,
            Constant::F64(_) => Primitive::F64,
            _ => return None,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Constant::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Constant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload sign-extended (or zero-extended for unsigned kinds)
    /// to 64 bits. Booleans read as 0/1.
    pub fn as_i64(&self) -> Option<i64> {
        Some(match *self {
            Constant::Bool(b) => b as i64,
            Constant::Char(v) => v as i64,
            Constant::I8(v) => v as i64,
            Constant::U8(v) => v as i64,
            Constant::I16(v) => v as i64,
            Constant::U16(v) => v as i64,
            Constant::I32(v) => v as i64,
            Constant::U32(v) => v as i64,
            Constant::I64(v) => v,
            Constant::U64(v) => v as i64,
            _ => return None,
        })
    }

    /// Integer payload reinterpreted as unsigned at its own width.
    pub fn as_u64(&self) -> Option<u64> {
        Some(match *self {
            Constant::Bool(b) => b as u64,
            Constant::Char(v) => v as u64,
            Constant::I8(v) => v as u8 as u64,
            Constant::U8(v) => v as u64,
            Constant::I16(v) => v as u16 as u64,
            Constant::U16(v) => v as u64,
            Constant::I32(v) => v as u32 as u64,
            Constant::U32(v) => v as u64,
            Constant::I64(v) => v as u64,
            Constant::U64(v) => v,
            _ => return None,
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Constant::F32(v) => Some(v as f64),
            Constant::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Builds a constant of `prim` from a 64-bit integer, truncating
    /// (wrapping) to the target width.
    pub fn from_i64(prim: Primitive, v: i64) -> Constant {
        match prim {
            Primitive::Bool => Constant::Bool(v != 0),
            Primitive::Char => Constant::Char(v as u16),
            Primitive::I8 => Constant::I8(v as i8),
            Primitive::U8 => Constant::U8(v as u8),
            Primitive::I16 => Constant::I16(v as i16),
            Primitive::U16 => Constant::U16(v as u16),
            Primitive::I32 => Constant::I32(v as i32),
            Primitive::U32 => Constant::U32(v as u32),
            Primitive::I64 | Primitive::NativeInt => Constant::I64(v),
            Primitive::U64 => Constant::U64(v as u64),
            Primitive::F32 => Constant::F32(v as f32),
            Primitive::F64 => Constant::F64(v as f64),
        }
    }

    pub fn from_f64(prim: Primitive, v: f64) -> Constant {
        match prim {
            Primitive::F32 => Constant::F32(v as f32),
            Primitive::F64 => Constant::F64(v),
            other => Constant::from_i64(other, v as i64),
        }
    }

    /// Zero value of a primitive.
    pub fn zero(prim: Primitive) -> Constant {
        Constant::from_i64(prim, 0)
    }

    /// Converts to another primitive. With `checked`, values that do not fit
    /// the target range yield `None` (the caller leaves the conversion
    /// symbolic); otherwise the value wraps.
    pub fn convert(&self, target: Primitive, checked: bool) -> Option<Constant> {
        if target == Primitive::NativeInt {
            return None;
        }
        if let Some(f) = self.as_f64() {
            if target.is_float() {
                return Some(Constant::from_f64(target, f));
            }
            if checked && !(f.is_finite() && fits_float(f, target)) {
                return None;
            }
            return Some(Constant::from_f64(target, f));
        }
        let src = self.primitive()?;
        let signed = src.is_signed();
        if target.is_float() {
            let v = if signed {
                self.as_i64()? as f64
            } else {
                self.as_u64()? as f64
            };
            return Some(Constant::from_f64(target, v));
        }
        if checked {
            let fits = if signed {
                fits_signed(self.as_i64()?, target)
            } else {
                fits_unsigned(self.as_u64()?, target)
            };
            if !fits {
                return None;
            }
        }
        Some(Constant::from_i64(target, self.as_i64()?))
    }
}

fn range_of(target: Primitive) -> (i128, i128) {
    match target {
        Primitive::Bool => (0, 1),
        Primitive::I8 => (i8::MIN as i128, i8::MAX as i128),
        Primitive::U8 => (0, u8::MAX as i128),
        Primitive::I16 => (i16::MIN as i128, i16::MAX as i128),
        Primitive::U16 | Primitive::Char => (0, u16::MAX as i128),
        Primitive::I32 => (i32::MIN as i128, i32::MAX as i128),
        Primitive::U32 => (0, u32::MAX as i128),
        Primitive::I64 | Primitive::NativeInt => (i64::MIN as i128, i64::MAX as i128),
        Primitive::U64 => (0, u64::MAX as i128),
        Primitive::F32 | Primitive::F64 => (i128::MIN, i128::MAX),
    }
}

fn fits_signed(v: i64, target: Primitive) -> bool {
    let (lo, hi) = range_of(target);
    (lo..=hi).contains(&(v as i128))
}

fn fits_unsigned(v: u64, target: Primitive) -> bool {
    let (lo, hi) = range_of(target);
    (lo..=hi).contains(&(v as i128))
}

fn fits_float(v: f64, target: Primitive) -> bool {
    let (lo, hi) = range_of(target);
    let t = v.trunc();
    t >= lo as f64 && t <= hi as f64
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Bool(v) => write!(f, "{v}"),
            Constant::Char(v) => match char::from_u32(*v as u32) {
                Some(c) => write!(f, "'{}'", c.escape_default()),
                None => write!(f, "'\\u{{{v:x}}}'"),
            },
            Constant::I8(v) => write!(f, "{v}"),
            Constant::U8(v) => write!(f, "{v}"),
            Constant::I16(v) => write!(f, "{v}"),
            Constant::U16(v) => write!(f, "{v}"),
            Constant::I32(v) => write!(f, "{v}"),
            Constant::U32(v) => write!(f, "{v}u"),
            Constant::I64(v) => write!(f, "{v}L"),
            Constant::U64(v) => write!(f, "{v}UL"),
            Constant::F32(v) => write!(f, "{v}f"),
            Constant::F64(v) => write!(f, "{v:?}"),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Token(t) => write!(f, "token({t:?})"),
        }
    }
}
