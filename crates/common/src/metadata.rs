//! The metadata model: types, fields and methods in one arena.
//!
//! [`MetadataBuilder`] collects definitions (the core library is installed
//! first), instantiates generic types on demand and, in
//! [`finish`](MetadataBuilder::finish), links overrides and interface maps
//! and derives bodies for generic instantiations. The resulting
//! [`Metadata`] is read-only and shared between threads.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::body::MethodBody;
use crate::constant::{Constant, MemberToken};
use crate::corlib::{self, CoreLib};
use crate::error::{HostError, MetadataError};
use crate::instruction::{Instruction, Operand};
use crate::opcode::Opcode;
use crate::types::{FieldId, MethodId, Primitive, TypeId};

/// Host implementation of a pure method, evaluated on constant arguments.
pub type HostFn = fn(&[Constant]) -> Result<Constant, HostError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Primitive(Primitive),
    Class,
    Struct,
    Interface,
    /// Enumeration over an integral underlying type.
    Enum(Primitive),
    Delegate,
    /// Single-dimensional array of the element type.
    Array(TypeId),
    /// The n-th type parameter of the generic definition being instantiated.
    GenericParam(u16),
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub fields: Vec<FieldId>,
    pub methods: Vec<MethodId>,
    /// Interface method -> implementing method on this type or a base.
    pub interface_impls: FxHashMap<MethodId, MethodId>,
    pub sealed: bool,
    pub is_abstract: bool,
    /// Every method of the type is side-effect free.
    pub pure: bool,
    pub generic_param_count: u16,
    pub generic_definition: Option<TypeId>,
    pub generic_args: Vec<TypeId>,
}

impl TypeDef {
    fn new(name: &str, kind: TypeKind, base: Option<TypeId>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            base,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            interface_impls: FxHashMap::default(),
            sealed: false,
            is_abstract: false,
            pure: false,
            generic_param_count: 0,
            generic_definition: None,
            generic_args: Vec::new(),
        }
    }

    pub fn is_interface(&self) -> bool {
        self.kind == TypeKind::Interface
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub declaring: TypeId,
    pub ty: TypeId,
    pub is_static: bool,
    /// Compile-time constant value of a literal (`const`) field.
    pub literal: Option<Constant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: TypeId,
}

impl Param {
    pub fn new(name: &str, ty: TypeId) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

#[derive(Clone)]
pub enum MethodImpl {
    Il(Arc<MethodBody>),
    Host(HostFn),
    /// Implemented outside managed code; calls are opaque boundaries.
    Native,
    /// Supplied by the runtime (delegate constructors and `Invoke`).
    Runtime,
    Abstract,
}

impl fmt::Debug for MethodImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodImpl::Il(body) => write!(f, "Il({} instructions)", body.len()),
            MethodImpl::Host(_) => write!(f, "Host"),
            MethodImpl::Native => write!(f, "Native"),
            MethodImpl::Runtime => write!(f, "Runtime"),
            MethodImpl::Abstract => write!(f, "Abstract"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub declaring: TypeId,
    pub params: Vec<Param>,
    pub ret: TypeId,
    pub is_static: bool,
    pub is_virtual: bool,
    pub is_final: bool,
    pub is_newslot: bool,
    pub is_ctor: bool,
    pub pure: bool,
    /// The base-class slot this method overrides.
    pub overrides: Option<MethodId>,
    /// For members of a generic instantiation, the open member.
    pub generic_definition: Option<MethodId>,
    pub implementation: MethodImpl,
}

impl MethodDef {
    /// Whether a call site may dispatch to a different body at run time.
    pub fn is_overridable(&self) -> bool {
        self.is_virtual && !self.is_final
    }
}

/// Signature and flags used to declare a method.
#[derive(Debug, Clone)]
pub struct MethodSig {
    name: String,
    params: Vec<Param>,
    ret: TypeId,
    is_static: bool,
    is_virtual: bool,
    is_final: bool,
    is_newslot: bool,
    is_ctor: bool,
    pure: bool,
    overrides: Option<MethodId>,
    implementation: MethodImpl,
}

impl MethodSig {
    pub fn new(name: &str, params: Vec<Param>, ret: TypeId) -> Self {
        Self {
            name: name.to_string(),
            params,
            ret,
            is_static: false,
            is_virtual: false,
            is_final: false,
            is_newslot: false,
            is_ctor: false,
            pure: false,
            overrides: None,
            implementation: MethodImpl::Abstract,
        }
    }

    /// An instance constructor (`.ctor`).
    pub fn ctor(params: Vec<Param>) -> Self {
        let mut sig = Self::new(".ctor", params, TypeId::VOID);
        sig.is_ctor = true;
        sig
    }

    pub fn as_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn as_virtual(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn as_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn as_newslot(mut self) -> Self {
        self.is_newslot = true;
        self
    }

    pub fn as_pure(mut self) -> Self {
        self.pure = true;
        self
    }

    pub fn overriding(mut self, base: MethodId) -> Self {
        self.is_virtual = true;
        self.overrides = Some(base);
        self
    }

    pub fn with_impl(mut self, implementation: MethodImpl) -> Self {
        self.implementation = implementation;
        self
    }

    pub fn il(self, body: MethodBody) -> Self {
        self.with_impl(MethodImpl::Il(Arc::new(body)))
    }

    pub fn host(self, f: HostFn) -> Self {
        self.with_impl(MethodImpl::Host(f))
    }
}

/// Decoder interface: yields the instruction stream of a method.
pub trait BodySource: Send + Sync {
    fn body(&self, method: MethodId) -> Option<Arc<MethodBody>>;
}

/// Read-only metadata arena.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    types: Vec<TypeDef>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    by_name: FxHashMap<String, TypeId>,
    instantiations: FxHashMap<(TypeId, Vec<TypeId>), TypeId>,
    arrays: FxHashMap<TypeId, TypeId>,
    generic_params: Vec<TypeId>,
    corlib: CoreLib,
}

impl BodySource for Metadata {
    fn body(&self, method: MethodId) -> Option<Arc<MethodBody>> {
        match &self.method(method).implementation {
            MethodImpl::Il(body) => Some(Arc::clone(body)),
            _ => None,
        }
    }
}

impl Metadata {
    pub fn corlib(&self) -> &CoreLib {
        &self.corlib
    }

    pub fn ty(&self, id: TypeId) -> &TypeDef {
        &self.types[id.index()]
    }

    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.index()]
    }

    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.index()]
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        (0..self.types.len()).map(TypeId::from_index)
    }

    /// Display name, with `&` for managed references.
    pub fn type_name(&self, id: TypeId) -> String {
        let name = &self.ty(id).name;
        if id.is_by_ref() {
            format!("{name}&")
        } else {
            name.clone()
        }
    }

    /// `Type::Name` rendering of a method.
    pub fn method_name(&self, id: MethodId) -> String {
        let m = self.method(id);
        format!("{}::{}", self.type_name(m.declaring), m.name)
    }

    pub fn field_name(&self, id: FieldId) -> String {
        let f = self.field(id);
        format!("{}::{}", self.type_name(f.declaring), f.name)
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        if let Some(p) = Primitive::ALL.iter().find(|p| p.name() == name) {
            return Some(p.type_id());
        }
        self.by_name.get(name).copied()
    }

    /// Existing instantiation of a generic definition.
    pub fn instantiation(&self, def: TypeId, args: &[TypeId]) -> Option<TypeId> {
        self.instantiations.get(&(def, args.to_vec())).copied()
    }

    /// Existing array type over `elem`.
    pub fn array_of(&self, elem: TypeId) -> Option<TypeId> {
        self.arrays.get(&elem).copied()
    }

    pub fn element_type(&self, array: TypeId) -> Option<TypeId> {
        match self.ty(array.dereferenced()).kind {
            TypeKind::Array(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn is_interface(&self, id: TypeId) -> bool {
        !id.is_by_ref() && self.ty(id).is_interface()
    }

    pub fn is_delegate(&self, id: TypeId) -> bool {
        !id.is_by_ref() && self.ty(id).kind == TypeKind::Delegate
    }

    pub fn is_value_type(&self, id: TypeId) -> bool {
        !id.is_by_ref()
            && matches!(
                self.ty(id).kind,
                TypeKind::Primitive(_) | TypeKind::Struct | TypeKind::Enum(_)
            )
    }

    /// Whether the type admits no subtypes, so a value of static type `id`
    /// has exactly that run-time type.
    pub fn is_sealed(&self, id: TypeId) -> bool {
        let t = self.ty(id);
        t.sealed || self.is_value_type(id) || matches!(t.kind, TypeKind::Array(_))
    }

    /// Base chain starting at `id` itself.
    pub fn ancestors(&self, id: TypeId) -> impl Iterator<Item = TypeId> + '_ {
        std::iter::successors(Some(id.dereferenced()), move |t| self.ty(*t).base)
    }

    /// Every interface implemented by the type, its bases and inherited
    /// interfaces, without duplicates.
    pub fn all_interfaces(&self, id: TypeId) -> Vec<TypeId> {
        let mut out: Vec<TypeId> = Vec::new();
        let mut work: Vec<TypeId> = self
            .ancestors(id)
            .flat_map(|t| self.ty(t).interfaces.iter().copied())
            .collect();
        if self.is_interface(id) {
            work.push(id);
        }
        while let Some(i) = work.pop() {
            if out.contains(&i) {
                continue;
            }
            out.push(i);
            work.extend(self.ty(i).interfaces.iter().copied());
        }
        out.retain(|i| *i != id);
        out
    }

    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        if from == to {
            return true;
        }
        if from.is_by_ref() || to.is_by_ref() {
            return false;
        }
        if to == TypeId::OBJECT {
            return true;
        }
        if let (TypeKind::Array(a), TypeKind::Array(b)) = (&self.ty(from).kind, &self.ty(to).kind)
        {
            return !self.is_value_type(*a) && self.is_assignable(*a, *b);
        }
        if self.ancestors(from).any(|t| t == to) {
            return true;
        }
        self.is_interface(to) && self.all_interfaces(from).contains(&to)
    }

    /// Instance fields of the type and all its bases, base-most first.
    pub fn instance_fields(&self, id: TypeId) -> Vec<FieldId> {
        let chain: Vec<TypeId> = self.ancestors(id).collect();
        chain
            .iter()
            .rev()
            .flat_map(|t| self.ty(*t).fields.iter().copied())
            .filter(|f| !self.field(*f).is_static)
            .collect()
    }

    pub fn find_field(&self, ty: TypeId, name: &str) -> Result<FieldId, MetadataError> {
        self.ancestors(ty)
            .flat_map(|t| self.ty(t).fields.iter().copied())
            .find(|f| self.field(*f).name == name)
            .ok_or_else(|| MetadataError::UnknownMember(format!("{}::{name}", self.type_name(ty))))
    }

    /// Finds a method by name on the type or its nearest base declaring that
    /// name. With `params`, only exact signature matches qualify.
    pub fn find_method(
        &self,
        ty: TypeId,
        name: &str,
        params: Option<&[TypeId]>,
    ) -> Result<MethodId, MetadataError> {
        let mut chain: Vec<TypeId> = self.ancestors(ty).collect();
        if self.is_interface(ty) {
            chain.extend(self.all_interfaces(ty));
        }
        let qualified = || format!("{}::{name}", self.type_name(ty));
        for t in chain {
            let candidates: Vec<MethodId> = self
                .ty(t)
                .methods
                .iter()
                .copied()
                .filter(|m| {
                    let def = self.method(*m);
                    def.name == name
                        && params.is_none_or(|ps| {
                            def.params.len() == ps.len()
                                && def.params.iter().zip(ps).all(|(p, t)| p.ty == *t)
                        })
                })
                .collect();
            match candidates.as_slice() {
                [] => continue,
                [m] => return Ok(*m),
                _ => return Err(MetadataError::AmbiguousMember(qualified())),
            }
        }
        Err(MetadataError::UnknownMember(qualified()))
    }

    /// Follows `overrides` to the method that introduced the virtual slot.
    pub fn slot_root(&self, mut method: MethodId) -> MethodId {
        while let Some(base) = self.method(method).overrides {
            method = base;
        }
        method
    }

    /// The implementation a virtual or interface call on `method` reaches
    /// for an object whose run-time type is `runtime`.
    pub fn resolve_virtual(&self, method: MethodId, runtime: TypeId) -> Option<MethodId> {
        let def = self.method(method);
        if !self.is_assignable(runtime, def.declaring) {
            return None;
        }
        if self.is_interface(def.declaring) {
            let target = self
                .ancestors(runtime)
                .find_map(|t| self.ty(t).interface_impls.get(&method).copied())?;
            return self.resolve_virtual(target, runtime);
        }
        if !def.is_virtual {
            return Some(method);
        }
        let root = self.slot_root(method);
        self.ancestors(runtime).find_map(|t| {
            self.ty(t)
                .methods
                .iter()
                .copied()
                .find(|m| self.method(*m).is_virtual && self.slot_root(*m) == root)
        })
    }

    /// Interface methods that `method` implements, looked up through the
    /// interface maps of its declaring type and that type's bases.
    pub fn implemented_interface_methods(&self, method: MethodId) -> Vec<MethodId> {
        let declaring = self.method(method).declaring;
        let mut out: Vec<MethodId> = self
            .ancestors(declaring)
            .flat_map(|t| self.ty(t).interface_impls.iter())
            .filter(|(_, imp)| **imp == method)
            .map(|(iface, _)| *iface)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// The delegate type's `Invoke` method.
    pub fn delegate_invoke(&self, delegate: TypeId) -> Option<MethodId> {
        self.ty(delegate)
            .methods
            .iter()
            .copied()
            .find(|m| self.method(*m).name == "Invoke")
    }

    fn push_type(&mut self, def: TypeDef) -> TypeId {
        let id = TypeId::from_index(self.types.len());
        self.types.push(def);
        id
    }
}

/// Mutable phase of the metadata arena.
#[derive(Debug)]
pub struct MetadataBuilder {
    meta: Metadata,
    /// Instantiated types whose member links and bodies are not derived yet.
    pending: Vec<TypeId>,
}

impl Default for MetadataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataBuilder {
    /// A builder with the reserved core types and the core library installed.
    pub fn new() -> Self {
        let mut b = Self {
            meta: Metadata::default(),
            pending: Vec::new(),
        };
        b.install_reserved();
        b.meta.corlib = corlib::install(&mut b);
        b
    }

    fn install_reserved(&mut self) {
        let core: [(TypeId, &str, TypeKind, Option<TypeId>); TypeId::RESERVED as usize] = [
            (TypeId::VOID, "void", TypeKind::Void, None),
            (TypeId::OBJECT, "object", TypeKind::Class, None),
            (TypeId::BOOL, "bool", TypeKind::Primitive(Primitive::Bool), Some(TypeId::VALUE_TYPE)),
            (TypeId::CHAR, "char", TypeKind::Primitive(Primitive::Char), Some(TypeId::VALUE_TYPE)),
            (TypeId::I8, "i8", TypeKind::Primitive(Primitive::I8), Some(TypeId::VALUE_TYPE)),
            (TypeId::U8, "u8", TypeKind::Primitive(Primitive::U8), Some(TypeId::VALUE_TYPE)),
            (TypeId::I16, "i16", TypeKind::Primitive(Primitive::I16), Some(TypeId::VALUE_TYPE)),
            (TypeId::U16, "u16", TypeKind::Primitive(Primitive::U16), Some(TypeId::VALUE_TYPE)),
            (TypeId::I32, "i32", TypeKind::Primitive(Primitive::I32), Some(TypeId::VALUE_TYPE)),
            (TypeId::U32, "u32", TypeKind::Primitive(Primitive::U32), Some(TypeId::VALUE_TYPE)),
            (TypeId::I64, "i64", TypeKind::Primitive(Primitive::I64), Some(TypeId::VALUE_TYPE)),
            (TypeId::U64, "u64", TypeKind::Primitive(Primitive::U64), Some(TypeId::VALUE_TYPE)),
            (TypeId::F32, "f32", TypeKind::Primitive(Primitive::F32), Some(TypeId::VALUE_TYPE)),
            (TypeId::F64, "f64", TypeKind::Primitive(Primitive::F64), Some(TypeId::VALUE_TYPE)),
            (TypeId::STRING, "string", TypeKind::Class, Some(TypeId::OBJECT)),
            (
                TypeId::NATIVE_INT,
                "nint",
                TypeKind::Primitive(Primitive::NativeInt),
                Some(TypeId::VALUE_TYPE),
            ),
            (TypeId::VALUE_TYPE, "ValueType", TypeKind::Class, Some(TypeId::OBJECT)),
            (TypeId::ENUM, "Enum", TypeKind::Class, Some(TypeId::VALUE_TYPE)),
            (TypeId::DELEGATE, "Delegate", TypeKind::Class, Some(TypeId::OBJECT)),
            (TypeId::ARRAY, "Array", TypeKind::Class, Some(TypeId::OBJECT)),
            (
                TypeId::RUNTIME_HANDLE,
                "RuntimeHandle",
                TypeKind::Struct,
                Some(TypeId::VALUE_TYPE),
            ),
        ];
        for (id, name, kind, base) in core {
            let mut def = TypeDef::new(name, kind, base);
            def.sealed = id == TypeId::STRING || matches!(def.kind, TypeKind::Primitive(_));
            def.pure = matches!(def.kind, TypeKind::Primitive(_)) || id == TypeId::STRING;
            def.is_abstract = matches!(id, TypeId::VALUE_TYPE | TypeId::ENUM | TypeId::DELEGATE | TypeId::ARRAY);
            let pushed = self.meta.push_type(def);
            debug_assert_eq!(pushed, id);
            self.meta.by_name.insert(name.to_string(), id);
        }
    }

    /// Read access to everything defined so far.
    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn define_type(
        &mut self,
        name: &str,
        kind: TypeKind,
        base: Option<TypeId>,
    ) -> Result<TypeId, MetadataError> {
        if self.meta.type_by_name(name).is_some() {
            return Err(MetadataError::DuplicateType(name.to_string()));
        }
        Ok(self.push_named_type(name, kind, base))
    }

    /// Defines a type whose name is known to be fresh.
    pub(crate) fn push_named_type(
        &mut self,
        name: &str,
        kind: TypeKind,
        base: Option<TypeId>,
    ) -> TypeId {
        let base = base.or(match kind {
            TypeKind::Class => Some(TypeId::OBJECT),
            TypeKind::Struct => Some(TypeId::VALUE_TYPE),
            TypeKind::Enum(_) => Some(TypeId::ENUM),
            TypeKind::Delegate => Some(TypeId::DELEGATE),
            _ => None,
        });
        let mut def = TypeDef::new(name, kind, base);
        def.sealed = matches!(
            def.kind,
            TypeKind::Struct | TypeKind::Enum(_) | TypeKind::Delegate
        );
        def.pure = matches!(def.kind, TypeKind::Enum(_));
        let id = self.meta.push_type(def);
        self.meta.by_name.insert(name.to_string(), id);
        id
    }

    /// Declares a delegate type with its runtime-supplied constructor
    /// `(object target, nint method)` and `Invoke`.
    pub fn define_delegate(
        &mut self,
        name: &str,
        params: Vec<Param>,
        ret: TypeId,
    ) -> Result<TypeId, MetadataError> {
        let ty = self.define_type(name, TypeKind::Delegate, None)?;
        self.define_method(
            ty,
            MethodSig::ctor(vec![
                Param::new("target", TypeId::OBJECT),
                Param::new("method", TypeId::NATIVE_INT),
            ])
            .with_impl(MethodImpl::Runtime),
        );
        self.define_method(
            ty,
            MethodSig::new("Invoke", params, ret)
                .as_virtual()
                .as_newslot()
                .with_impl(MethodImpl::Runtime),
        );
        Ok(ty)
    }

    pub fn type_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.meta.types[id.index()]
    }

    pub fn set_generic_params(&mut self, ty: TypeId, count: u16) {
        self.type_mut(ty).generic_param_count = count;
    }

    pub fn add_interface(&mut self, ty: TypeId, iface: TypeId) {
        let def = self.type_mut(ty);
        if !def.interfaces.contains(&iface) {
            def.interfaces.push(iface);
        }
    }

    /// Type id standing for the n-th generic parameter.
    pub fn generic_param(&mut self, n: u16) -> TypeId {
        while self.meta.generic_params.len() <= n as usize {
            let i = self.meta.generic_params.len() as u16;
            let id = self
                .meta
                .push_type(TypeDef::new(&format!("!{i}"), TypeKind::GenericParam(i), None));
            self.meta.generic_params.push(id);
        }
        self.meta.generic_params[n as usize]
    }

    pub fn array_of(&mut self, elem: TypeId) -> TypeId {
        if let Some(a) = self.meta.arrays.get(&elem) {
            return *a;
        }
        let mut def = TypeDef::new(
            &format!("{}[]", self.meta.type_name(elem)),
            TypeKind::Array(elem),
            Some(TypeId::ARRAY),
        );
        def.sealed = true;
        let id = self.meta.push_type(def);
        self.meta.arrays.insert(elem, id);
        id
    }

    pub fn define_field(&mut self, ty: TypeId, name: &str, field_ty: TypeId, is_static: bool) -> FieldId {
        let id = FieldId(self.meta.fields.len() as u32);
        self.meta.fields.push(FieldDef {
            name: name.to_string(),
            declaring: ty,
            ty: field_ty,
            is_static,
            literal: None,
        });
        self.type_mut(ty).fields.push(id);
        id
    }

    pub fn set_literal(&mut self, field: FieldId, value: Constant) {
        let f = &mut self.meta.fields[field.index()];
        f.is_static = true;
        f.literal = Some(value);
    }

    pub fn define_method(&mut self, ty: TypeId, sig: MethodSig) -> MethodId {
        let id = MethodId(self.meta.methods.len() as u32);
        self.meta.methods.push(MethodDef {
            name: sig.name,
            declaring: ty,
            params: sig.params,
            ret: sig.ret,
            is_static: sig.is_static,
            is_virtual: sig.is_virtual,
            is_final: sig.is_final,
            is_newslot: sig.is_newslot,
            is_ctor: sig.is_ctor,
            pure: sig.pure,
            overrides: sig.overrides,
            generic_definition: None,
            implementation: sig.implementation,
        });
        self.type_mut(ty).methods.push(id);
        id
    }

    pub fn set_implementation(&mut self, method: MethodId, implementation: MethodImpl) {
        self.meta.methods[method.index()].implementation = implementation;
    }

    /// Records that `imp` implements the interface method `iface_method` on `ty`.
    pub fn map_interface(&mut self, ty: TypeId, iface_method: MethodId, imp: MethodId) {
        self.type_mut(ty).interface_impls.insert(iface_method, imp);
    }

    /// The instantiation `def<args>`, created (memoized) on first request.
    ///
    /// Members are copied from the definition with substituted signatures;
    /// member links and bodies are derived in [`finish`](Self::finish), so a
    /// definition must be complete before it is first instantiated.
    pub fn instantiate(&mut self, def: TypeId, args: &[TypeId]) -> Result<TypeId, MetadataError> {
        let arity = self.meta.ty(def).generic_param_count as usize;
        if arity != args.len() || self.meta.ty(def).generic_definition.is_some() {
            return Err(MetadataError::GenericArity {
                name: self.meta.type_name(def),
                expected: arity,
                found: args.len(),
            });
        }
        if args.iter().enumerate().all(|(i, a)| self.meta.generic_params.get(i) == Some(a)) {
            return Ok(def);
        }
        if let Some(id) = self.meta.instantiation(def, args) {
            return Ok(id);
        }

        let template = self.meta.ty(def).clone();
        let arg_names: Vec<String> = args.iter().map(|a| self.meta.type_name(*a)).collect();
        let mut shell = TypeDef::new(
            &format!("{}<{}>", template.name, arg_names.join(",")),
            template.kind.clone(),
            None,
        );
        shell.sealed = template.sealed;
        shell.is_abstract = template.is_abstract;
        shell.pure = template.pure;
        shell.generic_definition = Some(def);
        shell.generic_args = args.to_vec();
        let id = self.meta.push_type(shell);
        self.meta.by_name.insert(self.meta.ty(id).name.clone(), id);
        self.meta.instantiations.insert((def, args.to_vec()), id);

        let base = template.base.map(|b| self.subst(b, args)).transpose()?;
        let interfaces = template
            .interfaces
            .iter()
            .map(|i| self.subst(*i, args))
            .collect::<Result<Vec<_>, _>>()?;
        self.type_mut(id).base = base;
        self.type_mut(id).interfaces = interfaces;

        for f in &template.fields {
            let src = self.meta.field(*f).clone();
            let ty = self.subst(src.ty, args)?;
            let nf = self.define_field(id, &src.name, ty, src.is_static);
            if let Some(lit) = src.literal {
                self.set_literal(nf, lit);
            }
        }
        for m in &template.methods {
            let src = self.meta.method(*m).clone();
            let params = src
                .params
                .iter()
                .map(|p| Ok(Param::new(&p.name, self.subst(p.ty, args)?)))
                .collect::<Result<Vec<_>, MetadataError>>()?;
            let ret = self.subst(src.ret, args)?;
            let nm = self.define_method(
                id,
                MethodSig {
                    name: src.name.clone(),
                    params,
                    ret,
                    is_static: src.is_static,
                    is_virtual: src.is_virtual,
                    is_final: src.is_final,
                    is_newslot: src.is_newslot,
                    is_ctor: src.is_ctor,
                    pure: src.pure,
                    overrides: None,
                    implementation: MethodImpl::Abstract,
                },
            );
            self.meta.methods[nm.index()].generic_definition = Some(*m);
        }
        self.pending.push(id);
        Ok(id)
    }

    /// Substitutes generic parameters in a type.
    fn subst(&mut self, ty: TypeId, args: &[TypeId]) -> Result<TypeId, MetadataError> {
        if ty.is_by_ref() {
            return Ok(self.subst(ty.dereferenced(), args)?.by_ref());
        }
        let def = self.meta.ty(ty).clone();
        match def.kind {
            TypeKind::GenericParam(i) => args.get(i as usize).copied().ok_or_else(|| {
                MetadataError::GenericArity {
                    name: def.name.clone(),
                    expected: i as usize + 1,
                    found: args.len(),
                }
            }),
            TypeKind::Array(elem) => {
                let elem = self.subst(elem, args)?;
                Ok(self.array_of(elem))
            }
            _ => {
                if let Some(open) = def.generic_definition {
                    let inner = def
                        .generic_args
                        .iter()
                        .map(|a| self.subst(*a, args))
                        .collect::<Result<Vec<_>, _>>()?;
                    self.instantiate(open, &inner)
                } else if def.generic_param_count > 0 {
                    // An open definition stands for itself applied to its
                    // own parameters.
                    let n = def.generic_param_count as usize;
                    let own = args.get(..n).ok_or_else(|| MetadataError::GenericArity {
                        name: def.name.clone(),
                        expected: n,
                        found: args.len(),
                    })?;
                    self.instantiate(ty, own)
                } else {
                    Ok(ty)
                }
            }
        }
    }

    /// The counterpart of `method` in the substituted declaring type.
    fn subst_method(&mut self, method: MethodId, args: &[TypeId]) -> Result<MethodId, MetadataError> {
        let declaring = self.meta.method(method).declaring;
        let target = self.subst(declaring, args)?;
        if target == declaring {
            return Ok(method);
        }
        let pos = self
            .meta
            .ty(declaring)
            .methods
            .iter()
            .position(|m| *m == method)
            .ok_or_else(|| MetadataError::UnknownMember(self.meta.method_name(method)))?;
        Ok(self.meta.ty(target).methods[pos])
    }

    fn subst_field(&mut self, field: FieldId, args: &[TypeId]) -> Result<FieldId, MetadataError> {
        let declaring = self.meta.field(field).declaring;
        let target = self.subst(declaring, args)?;
        if target == declaring {
            return Ok(field);
        }
        let pos = self
            .meta
            .ty(declaring)
            .fields
            .iter()
            .position(|f| *f == field)
            .ok_or_else(|| MetadataError::UnknownMember(self.meta.field_name(field)))?;
        Ok(self.meta.ty(target).fields[pos])
    }

    fn subst_body(&mut self, body: &MethodBody, args: &[TypeId]) -> Result<MethodBody, MetadataError> {
        let locals = body
            .locals
            .iter()
            .map(|l| self.subst(*l, args))
            .collect::<Result<Vec<_>, _>>()?;
        let mut instructions = Vec::with_capacity(body.instructions.len());
        for instr in &body.instructions {
            let Instruction::Op { opcode, operand } = instr else {
                instructions.push(instr.clone());
                continue;
            };
            let operand = match operand {
                Operand::Type(t) => {
                    let t = self.subst(*t, args)?;
                    if *opcode == Opcode::Newarr {
                        self.array_of(t);
                    }
                    Operand::Type(t)
                }
                Operand::Field(f) => Operand::Field(self.subst_field(*f, args)?),
                Operand::Method(m) => Operand::Method(self.subst_method(*m, args)?),
                Operand::Token(MemberToken::Type(t)) => {
                    Operand::Token(MemberToken::Type(self.subst(*t, args)?))
                }
                Operand::Token(MemberToken::Field(f)) => {
                    Operand::Token(MemberToken::Field(self.subst_field(*f, args)?))
                }
                Operand::Token(MemberToken::Method(m)) => {
                    Operand::Token(MemberToken::Method(self.subst_method(*m, args)?))
                }
                other => other.clone(),
            };
            instructions.push(Instruction::Op {
                opcode: *opcode,
                operand,
            });
        }
        Ok(MethodBody {
            locals,
            instructions,
            label_names: body.label_names.clone(),
        })
    }

    fn same_signature(&self, a: MethodId, b: MethodId) -> bool {
        let (a, b) = (self.meta.method(a), self.meta.method(b));
        a.name == b.name
            && a.params.len() == b.params.len()
            && a.params.iter().zip(&b.params).all(|(x, y)| x.ty == y.ty)
    }

    /// Links virtual methods to the base slot they override.
    fn link_overrides(&mut self, ty: TypeId) {
        let methods = self.meta.ty(ty).methods.clone();
        let bases: Vec<TypeId> = self.meta.ancestors(ty).skip(1).collect();
        for m in methods {
            let def = self.meta.method(m);
            if !def.is_virtual || def.is_newslot || def.overrides.is_some() {
                continue;
            }
            let found = bases.iter().find_map(|b| {
                self.meta
                    .ty(*b)
                    .methods
                    .iter()
                    .copied()
                    .find(|bm| self.meta.method(*bm).is_virtual && self.same_signature(m, *bm))
            });
            self.meta.methods[m.index()].overrides = found;
        }
    }

    /// Maps every interface method without an explicit implementation to the
    /// nearest instance method with the same name and parameter types.
    fn link_interfaces(&mut self, ty: TypeId) {
        if self.meta.is_interface(ty) {
            return;
        }
        for iface in self.meta.all_interfaces(ty) {
            for im in self.meta.ty(iface).methods.clone() {
                let known = self
                    .meta
                    .ancestors(ty)
                    .any(|t| self.meta.ty(t).interface_impls.contains_key(&im));
                if known {
                    continue;
                }
                let found = self.meta.ancestors(ty).find_map(|t| {
                    self.meta.ty(t).methods.iter().copied().find(|m| {
                        !self.meta.method(*m).is_static && self.same_signature(*m, im)
                    })
                });
                if let Some(imp) = found {
                    self.map_interface(ty, im, imp);
                }
            }
        }
    }

    /// Derives overrides, interface maps and bodies of an instantiation from
    /// its generic definition.
    fn complete_instantiation(&mut self, id: TypeId) -> Result<(), MetadataError> {
        let inst = self.meta.ty(id).clone();
        let Some(def) = inst.generic_definition else {
            return Ok(());
        };
        let args = inst.generic_args.clone();
        let template = self.meta.ty(def).clone();

        for (open, closed) in template.methods.iter().zip(&inst.methods) {
            let src = self.meta.method(*open).clone();
            if let Some(base) = src.overrides {
                let base = self.subst_method(base, &args)?;
                self.meta.methods[closed.index()].overrides = Some(base);
            }
            let implementation = match &src.implementation {
                MethodImpl::Il(body) => MethodImpl::Il(Arc::new(self.subst_body(body, &args)?)),
                other => other.clone(),
            };
            self.meta.methods[closed.index()].implementation = implementation;
        }
        let mut impls: Vec<(MethodId, MethodId)> = template.interface_impls.into_iter().collect();
        impls.sort();
        for (iface_method, imp) in impls {
            let iface_method = self.subst_method(iface_method, &args)?;
            let imp = self.subst_method(imp, &args)?;
            self.map_interface(id, iface_method, imp);
        }
        Ok(())
    }

    /// Links members and freezes the arena.
    pub fn finish(mut self) -> Result<Metadata, MetadataError> {
        let plain: Vec<TypeId> = self
            .meta
            .type_ids()
            .filter(|t| self.meta.ty(*t).generic_definition.is_none())
            .collect();
        for t in &plain {
            self.link_overrides(*t);
        }
        for t in &plain {
            self.link_interfaces(*t);
        }
        let mut done = 0;
        while done < self.pending.len() {
            let id = self.pending[done];
            self.complete_instantiation(id)?;
            done += 1;
        }
        Ok(self.meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyBuilder;

    fn shape_hierarchy() -> (MetadataBuilder, TypeId, TypeId, MethodId, MethodId) {
        let mut b = MetadataBuilder::new();
        let shape = b.define_type("Shape", TypeKind::Class, None).unwrap();
        let area = b.define_method(
            shape,
            MethodSig::new("Area", vec![], TypeId::I32)
                .as_virtual()
                .as_newslot()
                .with_impl(MethodImpl::Abstract),
        );
        let square = b.define_type("Square", TypeKind::Class, Some(shape)).unwrap();
        let mut body = BodyBuilder::new();
        body.emit(Opcode::LdcI4, Operand::Int32(4)).op(Opcode::Ret);
        let square_area = b.define_method(
            square,
            MethodSig::new("Area", vec![], TypeId::I32)
                .as_virtual()
                .il(body.build().unwrap()),
        );
        (b, shape, square, area, square_area)
    }

    #[test]
    fn reserved_slots_match_constants() {
        let meta = MetadataBuilder::new().finish().unwrap();
        assert_eq!(meta.type_by_name("string"), Some(TypeId::STRING));
        assert_eq!(meta.type_by_name("i32"), Some(TypeId::I32));
        assert_eq!(meta.type_name(TypeId::I32.by_ref()), "i32&");
        assert!(meta.is_value_type(TypeId::I32));
        assert!(!meta.is_value_type(TypeId::STRING));
    }

    #[test]
    fn overrides_are_linked_by_signature() {
        let (b, _shape, square, area, square_area) = shape_hierarchy();
        let meta = b.finish().unwrap();
        assert_eq!(meta.method(square_area).overrides, Some(area));
        assert_eq!(meta.resolve_virtual(area, square), Some(square_area));
    }

    #[test]
    fn resolve_virtual_rejects_unrelated_type() {
        let (b, _shape, _square, area, _) = shape_hierarchy();
        let meta = b.finish().unwrap();
        assert_eq!(meta.resolve_virtual(area, TypeId::STRING), None);
    }

    #[test]
    fn assignability() {
        let (mut b, shape, square, _, _) = shape_hierarchy();
        let squares = b.array_of(square);
        let shapes = b.array_of(shape);
        let ints = b.array_of(TypeId::I32);
        let objs = b.array_of(TypeId::OBJECT);
        let meta = b.finish().unwrap();
        assert!(meta.is_assignable(square, shape));
        assert!(!meta.is_assignable(shape, square));
        assert!(meta.is_assignable(squares, shapes));
        assert!(!meta.is_assignable(ints, objs));
        assert!(meta.is_assignable(TypeId::I32, TypeId::OBJECT));
    }

    #[test]
    fn interface_methods_link_by_name() {
        let mut b = MetadataBuilder::new();
        let disposable = b.metadata().corlib().idisposable;
        let dispose = b.metadata().corlib().dispose;
        let res = b.define_type("Resource", TypeKind::Class, None).unwrap();
        b.add_interface(res, disposable);
        let imp = b.define_method(
            res,
            MethodSig::new("Dispose", vec![], TypeId::VOID).with_impl(MethodImpl::Native),
        );
        let meta = b.finish().unwrap();
        assert_eq!(meta.resolve_virtual(dispose, res), Some(imp));
        assert_eq!(meta.implemented_interface_methods(imp), vec![dispose]);
    }

    #[test]
    fn instantiation_is_memoized_and_substituted() {
        let mut b = MetadataBuilder::new();
        let dict = b.metadata().corlib().dictionary;
        let a = b.instantiate(dict, &[TypeId::STRING, TypeId::I32]).unwrap();
        let again = b.instantiate(dict, &[TypeId::STRING, TypeId::I32]).unwrap();
        assert_eq!(a, again);
        let meta = b.finish().unwrap();
        assert_eq!(meta.type_name(a), "Dictionary<string,i32>");
        let add = meta.find_method(a, "Add", None).unwrap();
        let params: Vec<TypeId> = meta.method(add).params.iter().map(|p| p.ty).collect();
        assert_eq!(params, vec![TypeId::STRING, TypeId::I32]);
        assert_eq!(
            meta.method(add).generic_definition,
            Some(meta.corlib().dictionary_methods.add)
        );
    }

    #[test]
    fn instantiation_derives_enumerator_bodies() {
        let mut b = MetadataBuilder::new();
        let enumerator = b.metadata().corlib().array_enumerator;
        let e = b.instantiate(enumerator, &[TypeId::I32]).unwrap();
        let meta = b.finish().unwrap();
        let current = meta.find_method(e, "get_Current", None).unwrap();
        assert_eq!(meta.method(current).ret, TypeId::I32);
        let body = meta.body(current).unwrap();
        assert!(body.instructions.iter().any(|i| matches!(
            i,
            Instruction::Op { opcode: Opcode::Ldelem, operand: Operand::Type(t) } if *t == TypeId::I32
        )));
        assert!(meta.array_of(TypeId::I32).is_some());
    }

    #[test]
    fn generic_arity_is_checked() {
        let mut b = MetadataBuilder::new();
        let dict = b.metadata().corlib().dictionary;
        assert!(matches!(
            b.instantiate(dict, &[TypeId::STRING]),
            Err(MetadataError::GenericArity { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn duplicate_types_are_rejected() {
        let mut b = MetadataBuilder::new();
        b.define_type("Foo", TypeKind::Class, None).unwrap();
        assert_eq!(
            b.define_type("Foo", TypeKind::Class, None),
            Err(MetadataError::DuplicateType("Foo".to_string()))
        );
    }

    #[test]
    fn instance_fields_include_bases() {
        let mut b = MetadataBuilder::new();
        let base = b.define_type("Base", TypeKind::Class, None).unwrap();
        let fa = b.define_field(base, "a", TypeId::I32, false);
        b.define_field(base, "s", TypeId::I32, true);
        let derived = b.define_type("Derived", TypeKind::Class, Some(base)).unwrap();
        let fb = b.define_field(derived, "b", TypeId::STRING, false);
        let meta = b.finish().unwrap();
        assert_eq!(meta.instance_fields(derived), vec![fa, fb]);
        assert_eq!(meta.find_field(derived, "a"), Ok(fa));
    }

    #[test]
    fn find_method_by_signature() {
        let meta = MetadataBuilder::new().finish().unwrap();
        let math = meta.corlib().math;
        assert!(matches!(
            meta.find_method(math, "Abs", None),
            Err(MetadataError::AmbiguousMember(_))
        ));
        let abs = meta.find_method(math, "Abs", Some(&[TypeId::I32])).unwrap();
        assert_eq!(meta.method(abs).ret, TypeId::I32);
    }
}
