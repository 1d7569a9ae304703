//! Handles into the metadata arena and the primitive type catalogue.
//!
//! Type, field and method identities are small copyable indices. The core
//! types occupy fixed slots so that expression constructors can name them
//! without consulting the metadata (see [`TypeId::BOOL`] and friends).

use std::fmt;

const BY_REF_BIT: u32 = 1 << 31;

/// Identity of a type in a [`Metadata`](crate::Metadata) arena.
///
/// The high bit marks a managed reference (`T&`) to the underlying type, so
/// by-ref types never need their own arena entry.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    pub const VOID: TypeId = TypeId(0);
    pub const OBJECT: TypeId = TypeId(1);
    pub const BOOL: TypeId = TypeId(2);
    pub const CHAR: TypeId = TypeId(3);
    pub const I8: TypeId = TypeId(4);
    pub const U8: TypeId = TypeId(5);
    pub const I16: TypeId = TypeId(6);
    pub const U16: TypeId = TypeId(7);
    pub const I32: TypeId = TypeId(8);
    pub const U32: TypeId = TypeId(9);
    pub const I64: TypeId = TypeId(10);
    pub const U64: TypeId = TypeId(11);
    pub const F32: TypeId = TypeId(12);
    pub const F64: TypeId = TypeId(13);
    pub const STRING: TypeId = TypeId(14);
    pub const NATIVE_INT: TypeId = TypeId(15);
    pub const VALUE_TYPE: TypeId = TypeId(16);
    pub const ENUM: TypeId = TypeId(17);
    pub const DELEGATE: TypeId = TypeId(18);
    pub const ARRAY: TypeId = TypeId(19);
    pub const RUNTIME_HANDLE: TypeId = TypeId(20);

    /// Number of fixed slots reserved for the core types above.
    pub const RESERVED: u32 = 21;

    pub(crate) fn from_index(index: usize) -> TypeId {
        TypeId(index as u32)
    }

    /// Arena index of the underlying (non-reference) type.
    pub fn index(self) -> usize {
        (self.0 & !BY_REF_BIT) as usize
    }

    /// The managed reference type `self&`.
    pub fn by_ref(self) -> TypeId {
        TypeId(self.0 | BY_REF_BIT)
    }

    pub fn is_by_ref(self) -> bool {
        self.0 & BY_REF_BIT != 0
    }

    /// Strips a managed reference; identity for non-reference types.
    pub fn dereferenced(self) -> TypeId {
        TypeId(self.0 & !BY_REF_BIT)
    }

    pub fn primitive(self) -> Option<Primitive> {
        if self.is_by_ref() {
            return None;
        }
        Primitive::ALL.iter().copied().find(|p| p.type_id() == self)
    }

    pub fn is_primitive(self) -> bool {
        self.primitive().is_some()
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_by_ref() {
            write!(f, "TypeId({})&", self.index())
        } else {
            write!(f, "TypeId({})", self.index())
        }
    }
}

/// Identity of a field in a [`Metadata`](crate::Metadata) arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub(crate) u32);

impl FieldId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity of a method or constructor in a [`Metadata`](crate::Metadata) arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub(crate) u32);

impl MethodId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Built-in scalar types with literal representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    NativeInt,
}

impl Primitive {
    pub const ALL: [Primitive; 13] = [
        Primitive::Bool,
        Primitive::Char,
        Primitive::I8,
        Primitive::U8,
        Primitive::I16,
        Primitive::U16,
        Primitive::I32,
        Primitive::U32,
        Primitive::I64,
        Primitive::U64,
        Primitive::F32,
        Primitive::F64,
        Primitive::NativeInt,
    ];

    pub fn type_id(self) -> TypeId {
        match self {
            Primitive::Bool => TypeId::BOOL,
            Primitive::Char => TypeId::CHAR,
            Primitive::I8 => TypeId::I8,
            Primitive::U8 => TypeId::U8,
            Primitive::I16 => TypeId::I16,
            Primitive::U16 => TypeId::U16,
            Primitive::I32 => TypeId::I32,
            Primitive::U32 => TypeId::U32,
            Primitive::I64 => TypeId::I64,
            Primitive::U64 => TypeId::U64,
            Primitive::F32 => TypeId::F32,
            Primitive::F64 => TypeId::F64,
            Primitive::NativeInt => TypeId::NATIVE_INT,
        }
    }

    /// Assembly-level spelling (`i32`, `bool`, ...).
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::Char => "char",
            Primitive::I8 => "i8",
            Primitive::U8 => "u8",
            Primitive::I16 => "i16",
            Primitive::U16 => "u16",
            Primitive::I32 => "i32",
            Primitive::U32 => "u32",
            Primitive::I64 => "i64",
            Primitive::U64 => "u64",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
            Primitive::NativeInt => "nint",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Primitive::Char
                | Primitive::I8
                | Primitive::U8
                | Primitive::I16
                | Primitive::U16
                | Primitive::I32
                | Primitive::U32
                | Primitive::I64
                | Primitive::U64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::F32 | Primitive::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64 | Primitive::NativeInt
        ) || self.is_float()
    }

    /// The same-width integer of the opposite signedness.
    pub fn flip_sign(self) -> Option<Primitive> {
        match self {
            Primitive::I8 => Some(Primitive::U8),
            Primitive::U8 => Some(Primitive::I8),
            Primitive::I16 => Some(Primitive::U16),
            Primitive::U16 => Some(Primitive::I16),
            Primitive::I32 => Some(Primitive::U32),
            Primitive::U32 => Some(Primitive::I32),
            Primitive::I64 => Some(Primitive::U64),
            Primitive::U64 => Some(Primitive::I64),
            Primitive::Char => Some(Primitive::I16),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Primitive::Bool | Primitive::I8 | Primitive::U8 => 8,
            Primitive::Char | Primitive::I16 | Primitive::U16 => 16,
            Primitive::I32 | Primitive::U32 | Primitive::F32 => 32,
            Primitive::I64 | Primitive::U64 | Primitive::F64 | Primitive::NativeInt => 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_ref_roundtrip() {
        let t = TypeId::I32.by_ref();
        assert!(t.is_by_ref());
        assert_eq!(t.dereferenced(), TypeId::I32);
        assert_eq!(t.index(), TypeId::I32.index());
        assert_ne!(t, TypeId::I32);
    }

    #[test]
    fn primitive_lookup() {
        assert_eq!(TypeId::I64.primitive(), Some(Primitive::I64));
        assert_eq!(TypeId::STRING.primitive(), None);
        assert_eq!(TypeId::I64.by_ref().primitive(), None);
        for p in Primitive::ALL {
            assert_eq!(p.type_id().primitive(), Some(p));
        }
    }

    #[test]
    fn sign_flip_is_involutive() {
        for p in [Primitive::I8, Primitive::U16, Primitive::I32, Primitive::U64] {
            assert_eq!(p.flip_sign().and_then(Primitive::flip_sign), Some(p));
        }
    }

    #[test]
    fn signedness() {
        assert!(Primitive::I32.is_signed());
        assert!(!Primitive::U32.is_signed());
        assert!(Primitive::F64.is_signed());
        assert!(!Primitive::Bool.is_integer());
    }
}
