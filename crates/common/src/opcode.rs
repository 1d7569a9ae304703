//! Opcode definitions for the symil instruction set.
//!
//! The set mirrors the common-language stack machine: every long form is
//! represented once (short encodings such as `br.s` or `ldarg.0` are folded
//! into their canonical opcode by the assembler). Each opcode declares the
//! [`OperandKind`] it expects, which body builders validate.

use std::fmt;

/// Shape of the inline operand an opcode takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    None,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    /// A single branch target.
    Label,
    /// A jump table (`switch`).
    Labels,
    /// Argument or local slot index.
    Index,
    Type,
    Field,
    Method,
    /// `ldtoken` target: a type, field or method.
    Token,
}

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $variant:ident = $mnemonic:literal, $operand:ident; )*) => {
        /// Identifies the operation to perform.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $( $(#[$doc])* $variant, )*
        }

        /// Every opcode, in declaration order.
        pub const ALL_OPCODES: &[Opcode] = &[ $( Opcode::$variant, )* ];

        impl Opcode {
            /// Canonical assembly mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $mnemonic, )*
                }
            }

            pub fn operand_kind(self) -> OperandKind {
                match self {
                    $( Opcode::$variant => OperandKind::$operand, )*
                }
            }
        }
    };
}

opcodes! {
    Nop = "nop", None;
    Break = "break", None;

    // Arguments and locals
    /// Push argument `n` (argument 0 is `this` for instance methods).
    Ldarg = "ldarg", Index;
    /// Push the address of argument `n`.
    Ldarga = "ldarga", Index;
    Starg = "starg", Index;
    Ldloc = "ldloc", Index;
    Ldloca = "ldloca", Index;
    Stloc = "stloc", Index;

    // Constants
    Ldnull = "ldnull", None;
    LdcI4 = "ldc.i4", Int32;
    LdcI8 = "ldc.i8", Int64;
    LdcR4 = "ldc.r4", Float32;
    LdcR8 = "ldc.r8", Float64;
    Ldstr = "ldstr", String;
    Ldtoken = "ldtoken", Token;

    // Stack
    Dup = "dup", None;
    Pop = "pop", None;

    // Calls
    Jmp = "jmp", Method;
    Call = "call", Method;
    Callvirt = "callvirt", Method;
    Calli = "calli", None;
    /// Allocate an object and run the given constructor on it.
    Newobj = "newobj", Method;
    Ldftn = "ldftn", Method;
    Ldvirtftn = "ldvirtftn", Method;
    Ret = "ret", None;

    // Control flow
    Br = "br", Label;
    Brfalse = "brfalse", Label;
    Brtrue = "brtrue", Label;
    Beq = "beq", Label;
    Bge = "bge", Label;
    Bgt = "bgt", Label;
    Ble = "ble", Label;
    Blt = "blt", Label;
    BneUn = "bne.un", Label;
    BgeUn = "bge.un", Label;
    BgtUn = "bgt.un", Label;
    BleUn = "ble.un", Label;
    BltUn = "blt.un", Label;
    /// Jump table indexed by the popped value; falls through when out of range.
    Switch = "switch", Labels;
    /// Exit a protected region.
    Leave = "leave", Label;
    Endfinally = "endfinally", None;
    Endfilter = "endfilter", None;
    Throw = "throw", None;
    Rethrow = "rethrow", None;

    // Arithmetic
    Add = "add", None;
    Sub = "sub", None;
    Mul = "mul", None;
    Div = "div", None;
    DivUn = "div.un", None;
    Rem = "rem", None;
    RemUn = "rem.un", None;
    AddOvf = "add.ovf", None;
    AddOvfUn = "add.ovf.un", None;
    SubOvf = "sub.ovf", None;
    SubOvfUn = "sub.ovf.un", None;
    MulOvf = "mul.ovf", None;
    MulOvfUn = "mul.ovf.un", None;
    Neg = "neg", None;
    Ckfinite = "ckfinite", None;

    // Bitwise
    And = "and", None;
    Or = "or", None;
    Xor = "xor", None;
    Not = "not", None;
    Shl = "shl", None;
    Shr = "shr", None;
    ShrUn = "shr.un", None;

    // Comparison
    Ceq = "ceq", None;
    Cgt = "cgt", None;
    /// Unsigned greater-than; `obj cgt.un null` is the non-null test idiom.
    CgtUn = "cgt.un", None;
    Clt = "clt", None;
    CltUn = "clt.un", None;

    // Conversion
    ConvI1 = "conv.i1", None;
    ConvI2 = "conv.i2", None;
    ConvI4 = "conv.i4", None;
    ConvI8 = "conv.i8", None;
    ConvU1 = "conv.u1", None;
    ConvU2 = "conv.u2", None;
    ConvU4 = "conv.u4", None;
    ConvU8 = "conv.u8", None;
    ConvR4 = "conv.r4", None;
    ConvR8 = "conv.r8", None;
    ConvRUn = "conv.r.un", None;
    ConvI = "conv.i", None;
    ConvU = "conv.u", None;
    ConvOvfI1 = "conv.ovf.i1", None;
    ConvOvfI2 = "conv.ovf.i2", None;
    ConvOvfI4 = "conv.ovf.i4", None;
    ConvOvfI8 = "conv.ovf.i8", None;
    ConvOvfU1 = "conv.ovf.u1", None;
    ConvOvfU2 = "conv.ovf.u2", None;
    ConvOvfU4 = "conv.ovf.u4", None;
    ConvOvfU8 = "conv.ovf.u8", None;
    ConvOvfI1Un = "conv.ovf.i1.un", None;
    ConvOvfI2Un = "conv.ovf.i2.un", None;
    ConvOvfI4Un = "conv.ovf.i4.un", None;
    ConvOvfI8Un = "conv.ovf.i8.un", None;
    ConvOvfU1Un = "conv.ovf.u1.un", None;
    ConvOvfU2Un = "conv.ovf.u2.un", None;
    ConvOvfU4Un = "conv.ovf.u4.un", None;
    ConvOvfU8Un = "conv.ovf.u8.un", None;
    ConvOvfI = "conv.ovf.i", None;
    ConvOvfU = "conv.ovf.u", None;
    ConvOvfIUn = "conv.ovf.i.un", None;
    ConvOvfUUn = "conv.ovf.u.un", None;

    // Objects and fields
    Ldfld = "ldfld", Field;
    Ldflda = "ldflda", Field;
    Stfld = "stfld", Field;
    Ldsfld = "ldsfld", Field;
    Ldsflda = "ldsflda", Field;
    Stsfld = "stsfld", Field;
    Box = "box", Type;
    Unbox = "unbox", Type;
    UnboxAny = "unbox.any", Type;
    Castclass = "castclass", Type;
    Isinst = "isinst", Type;
    /// Zero-initialize the value type at the popped address.
    Initobj = "initobj", Type;
    Ldobj = "ldobj", Type;
    Stobj = "stobj", Type;
    Cpobj = "cpobj", Type;
    Ldind = "ldind", Type;
    Stind = "stind", Type;
    Sizeof = "sizeof", Type;

    // Arrays
    Newarr = "newarr", Type;
    Ldlen = "ldlen", None;
    Ldelem = "ldelem", Type;
    Ldelema = "ldelema", Type;
    Stelem = "stelem", Type;

    // Raw memory and typed references
    Localloc = "localloc", None;
    Cpblk = "cpblk", None;
    Initblk = "initblk", None;
    Arglist = "arglist", None;
    Mkrefany = "mkrefany", Type;
    Refanyval = "refanyval", Type;
    Refanytype = "refanytype", None;

    // Prefixes
    /// Constrains the receiver type of the following `callvirt`.
    Constrained = "constrained.", Type;
    Volatile = "volatile.", None;
    Unaligned = "unaligned.", Int32;
    Tail = "tail.", None;
    Readonly = "readonly.", None;
}

impl Opcode {
    /// Looks up an opcode by its canonical mnemonic (case-insensitive).
    pub fn from_mnemonic(s: &str) -> Option<Opcode> {
        ALL_OPCODES
            .iter()
            .copied()
            .find(|op| op.mnemonic().eq_ignore_ascii_case(s))
    }

    /// Unconditional control transfers after which the next instruction is
    /// only reachable through a label.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            Opcode::Br
                | Opcode::Leave
                | Opcode::Ret
                | Opcode::Throw
                | Opcode::Rethrow
                | Opcode::Jmp
                | Opcode::Endfinally
                | Opcode::Endfilter
        )
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            Opcode::Brfalse
                | Opcode::Brtrue
                | Opcode::Beq
                | Opcode::Bge
                | Opcode::Bgt
                | Opcode::Ble
                | Opcode::Blt
                | Opcode::BneUn
                | Opcode::BgeUn
                | Opcode::BgtUn
                | Opcode::BleUn
                | Opcode::BltUn
        )
    }

    pub fn is_prefix(self) -> bool {
        matches!(
            self,
            Opcode::Constrained
                | Opcode::Volatile
                | Opcode::Unaligned
                | Opcode::Tail
                | Opcode::Readonly
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn mnemonics_are_unique() {
        let mut seen = HashSet::new();
        for &opcode in ALL_OPCODES {
            assert!(
                seen.insert(opcode.mnemonic()),
                "duplicate mnemonic {}",
                opcode.mnemonic()
            );
        }
    }

    #[test]
    fn mnemonic_roundtrip() {
        for &opcode in ALL_OPCODES {
            assert_eq!(
                Opcode::from_mnemonic(opcode.mnemonic()),
                Some(opcode),
                "roundtrip failed for {opcode:?}"
            );
        }
    }

    #[test]
    fn mnemonic_lookup_ignores_case() {
        assert_eq!(Opcode::from_mnemonic("LDC.I4"), Some(Opcode::LdcI4));
        assert_eq!(Opcode::from_mnemonic("Constrained."), Some(Opcode::Constrained));
        assert_eq!(Opcode::from_mnemonic("frobnicate"), None);
    }

    #[test]
    fn operand_kinds() {
        assert_eq!(Opcode::Ldstr.operand_kind(), OperandKind::String);
        assert_eq!(Opcode::Switch.operand_kind(), OperandKind::Labels);
        assert_eq!(Opcode::Newobj.operand_kind(), OperandKind::Method);
        assert_eq!(Opcode::Add.operand_kind(), OperandKind::None);
        for &opcode in ALL_OPCODES {
            if opcode.is_conditional_branch() {
                assert_eq!(opcode.operand_kind(), OperandKind::Label, "{opcode:?}");
            }
        }
    }

    #[test]
    fn prefixes_are_not_branches() {
        for &opcode in ALL_OPCODES {
            if opcode.is_prefix() {
                assert!(!opcode.is_conditional_branch());
                assert!(!opcode.ends_block());
            }
        }
    }
}
