//! symil common types and the metadata model.
//!
//! This crate provides the foundational data structures shared by the
//! engine, the assembler and the CLI:
//!
//! - [`TypeId`], [`FieldId`], [`MethodId`]: handles into the metadata arena
//! - [`Constant`]: typed literals
//! - [`Opcode`] and [`Instruction`]: the stack-machine instruction set
//! - [`MethodBody`]: typed locals plus an instruction stream
//! - [`Metadata`]: types, fields, methods, interface maps and generic
//!   instantiations, with the core library preinstalled ([`CoreLib`])
//! - [`BodySource`]: the decoder interface the engine reads bodies through

pub mod body;
pub mod constant;
pub mod corlib;
pub mod error;
pub mod host;
pub mod instruction;
pub mod metadata;
pub mod opcode;
pub mod types;

pub use body::{BodyBuilder, MethodBody};
pub use constant::{Constant, MemberToken};
pub use corlib::{CoreLib, DictionaryMethods};
pub use error::{HostError, MetadataError};
pub use instruction::{Instruction, LabelId, Operand, Region};
pub use metadata::{
    BodySource, FieldDef, HostFn, Metadata, MetadataBuilder, MethodDef, MethodImpl, MethodSig,
    Param, TypeDef, TypeKind,
};
pub use opcode::{Opcode, OperandKind};
pub use types::{FieldId, MethodId, Primitive, TypeId};
