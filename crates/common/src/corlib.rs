//! The core library every metadata arena starts with.
//!
//! Exceptions, `Math`, string helpers, the enumeration interfaces and the
//! dictionary types are defined here. Dictionary members are native: the
//! engine models tracked instances through special executors and treats
//! the rest as opaque. `ArrayEnumerator<T>` is ordinary IL so that
//! enumeration of materialized dictionaries is interpreted like user code.

use std::sync::Arc;

use crate::body::MethodBody;
use crate::host;
use crate::instruction::{Instruction, Operand};
use crate::metadata::{MetadataBuilder, MethodImpl, MethodSig, Param, TypeKind};
use crate::opcode::Opcode;
use crate::types::{FieldId, MethodId, TypeId};

/// Members shared by `IDictionary<K,V>` and `Dictionary<K,V>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DictionaryMethods {
    pub add: MethodId,
    pub get_item: MethodId,
    pub set_item: MethodId,
    pub contains_key: MethodId,
    pub try_get_value: MethodId,
    pub remove: MethodId,
    pub get_count: MethodId,
}

/// Handles of the core-library definitions.
#[derive(Debug, Clone, Default)]
pub struct CoreLib {
    pub object_ctor: MethodId,
    pub object_to_string: MethodId,

    pub exception: TypeId,
    pub exception_message: FieldId,
    pub exception_ctor: MethodId,
    pub null_reference_exception: TypeId,
    pub null_reference_ctor: MethodId,
    pub key_not_found_exception: TypeId,
    pub key_not_found_ctor: MethodId,
    pub argument_exception: TypeId,
    pub argument_exception_ctor: MethodId,
    pub invalid_cast_exception: TypeId,
    pub invalid_cast_ctor: MethodId,

    pub math: TypeId,

    pub idisposable: TypeId,
    pub dispose: MethodId,
    pub ienumerable: TypeId,
    pub ienumerable_get_enumerator: MethodId,
    pub ienumerator: TypeId,
    pub ienumerator_move_next: MethodId,
    pub ienumerator_current: MethodId,

    pub key_value_pair: TypeId,
    pub key_value_pair_ctor: MethodId,
    pub key_value_pair_key: MethodId,
    pub key_value_pair_value: MethodId,

    pub array_enumerator: TypeId,
    pub array_enumerator_ctor: MethodId,

    pub idictionary: TypeId,
    pub idictionary_methods: DictionaryMethods,
    pub dictionary: TypeId,
    pub dictionary_ctor: MethodId,
    /// Set by the constructor of dictionaries created by interpreted code.
    pub dictionary_tracked: FieldId,
    pub dictionary_methods: DictionaryMethods,
    pub dictionary_get_enumerator: MethodId,
}

fn il(locals: Vec<TypeId>, ops: Vec<Instruction>) -> MethodImpl {
    MethodImpl::Il(Arc::new(MethodBody {
        locals,
        instructions: ops,
        label_names: Default::default(),
    }))
}

fn op(opcode: Opcode) -> Instruction {
    Instruction::op(opcode)
}

fn ldarg(n: u16) -> Instruction {
    Instruction::with(Opcode::Ldarg, Operand::Index(n))
}

fn field_op(opcode: Opcode, f: FieldId) -> Instruction {
    Instruction::with(opcode, Operand::Field(f))
}

fn call(m: MethodId) -> Instruction {
    Instruction::with(Opcode::Call, Operand::Method(m))
}

fn interface_method(name: &str, params: Vec<Param>, ret: TypeId) -> MethodSig {
    MethodSig::new(name, params, ret)
        .as_virtual()
        .as_newslot()
        .with_impl(MethodImpl::Abstract)
}

fn native(name: &str, params: Vec<Param>, ret: TypeId) -> MethodSig {
    MethodSig::new(name, params, ret).with_impl(MethodImpl::Native)
}

/// Defines the core library into a builder holding only the reserved types.
pub(crate) fn install(b: &mut MetadataBuilder) -> CoreLib {
    let mut lib = CoreLib {
        object_ctor: b.define_method(
            TypeId::OBJECT,
            MethodSig::ctor(vec![]).with_impl(il(vec![], vec![op(Opcode::Ret)])),
        ),
        object_to_string: b.define_method(
            TypeId::OBJECT,
            native("ToString", vec![], TypeId::STRING).as_virtual().as_newslot(),
        ),
        ..CoreLib::default()
    };
    b.define_method(
        TypeId::OBJECT,
        native("Equals", vec![Param::new("other", TypeId::OBJECT)], TypeId::BOOL)
            .as_virtual()
            .as_newslot(),
    );
    b.define_method(
        TypeId::OBJECT,
        native("GetHashCode", vec![], TypeId::I32).as_virtual().as_newslot(),
    );

    install_exceptions(b, &mut lib);
    install_pure_helpers(b, &mut lib);
    install_enumeration(b, &mut lib);
    install_dictionary(b, &mut lib);
    lib
}

fn named(b: &mut MetadataBuilder, name: &str, kind: TypeKind, base: Option<TypeId>) -> TypeId {
    b.push_named_type(name, kind, base)
}

fn install_exceptions(b: &mut MetadataBuilder, lib: &mut CoreLib) {
    let exception = named(b, "Exception", TypeKind::Class, None);
    let message = b.define_field(exception, "_message", TypeId::STRING, false);
    let object_ctor = lib.object_ctor;
    let ctor0 = b.define_method(
        exception,
        MethodSig::ctor(vec![]).with_impl(il(vec![], vec![ldarg(0), call(object_ctor), op(Opcode::Ret)])),
    );
    let ctor1 = b.define_method(
        exception,
        MethodSig::ctor(vec![Param::new("message", TypeId::STRING)]).with_impl(il(
            vec![],
            vec![
                ldarg(0),
                call(object_ctor),
                ldarg(0),
                ldarg(1),
                field_op(Opcode::Stfld, message),
                op(Opcode::Ret),
            ],
        )),
    );
    b.define_method(
        exception,
        MethodSig::new("get_Message", vec![], TypeId::STRING)
            .as_virtual()
            .as_newslot()
            .with_impl(il(
                vec![],
                vec![ldarg(0), field_op(Opcode::Ldfld, message), op(Opcode::Ret)],
            )),
    );
    lib.exception = exception;
    lib.exception_message = message;
    lib.exception_ctor = ctor1;

    let mut derived = |name: &str| -> (TypeId, MethodId) {
        let ty = named(b, name, TypeKind::Class, Some(exception));
        let c0 = b.define_method(
            ty,
            MethodSig::ctor(vec![]).with_impl(il(vec![], vec![ldarg(0), call(ctor0), op(Opcode::Ret)])),
        );
        b.define_method(
            ty,
            MethodSig::ctor(vec![Param::new("message", TypeId::STRING)]).with_impl(il(
                vec![],
                vec![ldarg(0), ldarg(1), call(ctor1), op(Opcode::Ret)],
            )),
        );
        (ty, c0)
    };
    (lib.null_reference_exception, lib.null_reference_ctor) = derived("NullReferenceException");
    (lib.key_not_found_exception, lib.key_not_found_ctor) = derived("KeyNotFoundException");
    (lib.argument_exception, lib.argument_exception_ctor) = derived("ArgumentException");
    (lib.invalid_cast_exception, lib.invalid_cast_ctor) = derived("InvalidCastException");
}

fn install_pure_helpers(b: &mut MetadataBuilder, lib: &mut CoreLib) {
    let math = named(b, "Math", TypeKind::Class, None);
    b.type_mut(math).pure = true;
    b.type_mut(math).sealed = true;
    let unary = |ty: TypeId| vec![Param::new("value", ty)];
    let binary = |ty: TypeId| vec![Param::new("a", ty), Param::new("b", ty)];
    for (name, params, ret, f) in [
        ("Abs", unary(TypeId::I32), TypeId::I32, host::math_abs_i32 as crate::metadata::HostFn),
        ("Abs", unary(TypeId::I64), TypeId::I64, host::math_abs_i64),
        ("Abs", unary(TypeId::F64), TypeId::F64, host::math_abs_f64),
        ("Max", binary(TypeId::I32), TypeId::I32, host::math_max_i32),
        ("Min", binary(TypeId::I32), TypeId::I32, host::math_min_i32),
    ] {
        b.define_method(math, MethodSig::new(name, params, ret).as_static().host(f));
    }
    lib.math = math;

    let s = TypeId::STRING;
    b.define_method(
        s,
        MethodSig::new("Concat", binary(s), s).as_static().host(host::string_concat),
    );
    b.define_method(
        s,
        MethodSig::new("op_Equality", binary(s), TypeId::BOOL)
            .as_static()
            .host(host::string_equals),
    );
    b.define_method(
        s,
        MethodSig::new("IsNullOrEmpty", unary(s), TypeId::BOOL)
            .as_static()
            .host(host::string_is_null_or_empty),
    );
    b.define_method(
        s,
        MethodSig::new("get_Length", vec![], TypeId::I32).host(host::string_length),
    );
    b.define_method(
        s,
        MethodSig::ctor(vec![
            Param::new("c", TypeId::CHAR),
            Param::new("count", TypeId::I32),
        ])
        .host(host::string_repeat),
    );
    b.define_method(
        TypeId::I32,
        MethodSig::new("ToString", vec![], s).host(host::int32_to_string),
    );
}

fn install_enumeration(b: &mut MetadataBuilder, lib: &mut CoreLib) {
    let t = b.generic_param(0);
    let object_ctor = lib.object_ctor;

    let disposable = named(b, "IDisposable", TypeKind::Interface, None);
    lib.dispose = b.define_method(disposable, interface_method("Dispose", vec![], TypeId::VOID));
    lib.idisposable = disposable;

    let enumerator = named(b, "IEnumerator", TypeKind::Interface, None);
    b.set_generic_params(enumerator, 1);
    b.add_interface(enumerator, disposable);
    lib.ienumerator_move_next =
        b.define_method(enumerator, interface_method("MoveNext", vec![], TypeId::BOOL));
    lib.ienumerator_current = b.define_method(enumerator, interface_method("get_Current", vec![], t));
    lib.ienumerator = enumerator;

    let enumerable = named(b, "IEnumerable", TypeKind::Interface, None);
    b.set_generic_params(enumerable, 1);
    lib.ienumerable_get_enumerator =
        b.define_method(enumerable, interface_method("GetEnumerator", vec![], enumerator));
    lib.ienumerable = enumerable;

    let pair = named(b, "KeyValuePair", TypeKind::Struct, None);
    b.set_generic_params(pair, 2);
    let k = b.generic_param(0);
    let v = b.generic_param(1);
    let key = b.define_field(pair, "key", k, false);
    let value = b.define_field(pair, "value", v, false);
    lib.key_value_pair_ctor = b.define_method(
        pair,
        MethodSig::ctor(vec![Param::new("key", k), Param::new("value", v)]).with_impl(il(
            vec![],
            vec![
                ldarg(0),
                ldarg(1),
                field_op(Opcode::Stfld, key),
                ldarg(0),
                ldarg(2),
                field_op(Opcode::Stfld, value),
                op(Opcode::Ret),
            ],
        )),
    );
    lib.key_value_pair_key = b.define_method(
        pair,
        MethodSig::new("get_Key", vec![], k).with_impl(il(
            vec![],
            vec![ldarg(0), field_op(Opcode::Ldfld, key), op(Opcode::Ret)],
        )),
    );
    lib.key_value_pair_value = b.define_method(
        pair,
        MethodSig::new("get_Value", vec![], v).with_impl(il(
            vec![],
            vec![ldarg(0), field_op(Opcode::Ldfld, value), op(Opcode::Ret)],
        )),
    );
    lib.key_value_pair = pair;

    let array_enum = named(b, "ArrayEnumerator", TypeKind::Class, None);
    b.set_generic_params(array_enum, 1);
    b.type_mut(array_enum).sealed = true;
    b.add_interface(array_enum, enumerator);
    let items_ty = b.array_of(t);
    let items = b.define_field(array_enum, "items", items_ty, false);
    let index = b.define_field(array_enum, "index", TypeId::I32, false);
    lib.array_enumerator_ctor = b.define_method(
        array_enum,
        MethodSig::ctor(vec![Param::new("items", items_ty)]).with_impl(il(
            vec![],
            vec![
                ldarg(0),
                call(object_ctor),
                ldarg(0),
                ldarg(1),
                field_op(Opcode::Stfld, items),
                ldarg(0),
                Instruction::with(Opcode::LdcI4, Operand::Int32(-1)),
                field_op(Opcode::Stfld, index),
                op(Opcode::Ret),
            ],
        )),
    );
    b.define_method(
        array_enum,
        MethodSig::new("MoveNext", vec![], TypeId::BOOL).with_impl(il(
            vec![],
            vec![
                ldarg(0),
                ldarg(0),
                field_op(Opcode::Ldfld, index),
                Instruction::with(Opcode::LdcI4, Operand::Int32(1)),
                op(Opcode::Add),
                field_op(Opcode::Stfld, index),
                ldarg(0),
                field_op(Opcode::Ldfld, index),
                ldarg(0),
                field_op(Opcode::Ldfld, items),
                op(Opcode::Ldlen),
                op(Opcode::ConvI4),
                op(Opcode::Clt),
                op(Opcode::Ret),
            ],
        )),
    );
    b.define_method(
        array_enum,
        MethodSig::new("get_Current", vec![], t).with_impl(il(
            vec![],
            vec![
                ldarg(0),
                field_op(Opcode::Ldfld, items),
                ldarg(0),
                field_op(Opcode::Ldfld, index),
                Instruction::with(Opcode::Ldelem, Operand::Type(t)),
                op(Opcode::Ret),
            ],
        )),
    );
    b.define_method(
        array_enum,
        MethodSig::new("Dispose", vec![], TypeId::VOID).with_impl(il(vec![], vec![op(Opcode::Ret)])),
    );
    lib.array_enumerator = array_enum;
}

fn dictionary_methods(
    b: &mut MetadataBuilder,
    ty: TypeId,
    make: fn(&str, Vec<Param>, TypeId) -> MethodSig,
) -> DictionaryMethods {
    let k = b.generic_param(0);
    let v = b.generic_param(1);
    let key = || Param::new("key", k);
    DictionaryMethods {
        add: b.define_method(ty, make("Add", vec![key(), Param::new("value", v)], TypeId::VOID)),
        get_item: b.define_method(ty, make("get_Item", vec![key()], v)),
        set_item: b.define_method(
            ty,
            make("set_Item", vec![key(), Param::new("value", v)], TypeId::VOID),
        ),
        contains_key: b.define_method(ty, make("ContainsKey", vec![key()], TypeId::BOOL)),
        try_get_value: b.define_method(
            ty,
            make(
                "TryGetValue",
                vec![key(), Param::new("value", v.by_ref())],
                TypeId::BOOL,
            ),
        ),
        remove: b.define_method(ty, make("Remove", vec![key()], TypeId::BOOL)),
        get_count: b.define_method(ty, make("get_Count", vec![], TypeId::I32)),
    }
}

fn install_dictionary(b: &mut MetadataBuilder, lib: &mut CoreLib) {
    let pair = lib.key_value_pair;
    // The open pair type stands for KeyValuePair<K,V> inside the definitions.
    let pairs = b
        .instantiate(lib.ienumerable, &[pair])
        .expect("IEnumerable takes one type argument");
    let pair_enum = b
        .instantiate(lib.array_enumerator, &[pair])
        .expect("ArrayEnumerator takes one type argument");

    let idict = named(b, "IDictionary", TypeKind::Interface, None);
    b.set_generic_params(idict, 2);
    b.add_interface(idict, pairs);
    lib.idictionary_methods = dictionary_methods(b, idict, interface_method);
    lib.idictionary = idict;

    let dict = named(b, "Dictionary", TypeKind::Class, None);
    b.set_generic_params(dict, 2);
    b.add_interface(dict, idict);
    lib.dictionary_tracked = b.define_field(dict, "_tracked", TypeId::BOOL, false);
    lib.dictionary_ctor = b.define_method(dict, MethodSig::ctor(vec![]).with_impl(MethodImpl::Native));
    lib.dictionary_methods = dictionary_methods(b, dict, native);
    lib.dictionary_get_enumerator = b.define_method(dict, native("GetEnumerator", vec![], pair_enum));
    lib.dictionary = dict;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::BodySource;

    #[test]
    fn corlib_bodies_validate() {
        let meta = MetadataBuilder::new().finish().unwrap();
        for ty in meta.type_ids() {
            for m in &meta.ty(ty).methods {
                if let Some(body) = meta.body(*m) {
                    body.validate()
                        .unwrap_or_else(|e| panic!("{}: {e}", meta.method_name(*m)));
                }
            }
        }
    }

    #[test]
    fn exceptions_derive_from_exception() {
        let meta = MetadataBuilder::new().finish().unwrap();
        let lib = meta.corlib();
        for ty in [
            lib.null_reference_exception,
            lib.key_not_found_exception,
            lib.argument_exception,
            lib.invalid_cast_exception,
        ] {
            assert!(meta.is_assignable(ty, lib.exception));
        }
    }

    #[test]
    fn dictionary_implements_enumerable_of_pairs() {
        let mut b = MetadataBuilder::new();
        let lib = b.metadata().corlib().clone();
        let d = b.instantiate(lib.dictionary, &[TypeId::STRING, TypeId::STRING]).unwrap();
        let pair = b.instantiate(lib.key_value_pair, &[TypeId::STRING, TypeId::STRING]).unwrap();
        let pairs = b.instantiate(lib.ienumerable, &[pair]).unwrap();
        let meta = b.finish().unwrap();
        assert!(meta.is_assignable(d, pairs));

        let get_enum = meta.find_method(pairs, "GetEnumerator", None).unwrap();
        let target = meta.resolve_virtual(get_enum, d).unwrap();
        assert_eq!(meta.method(target).generic_definition, Some(lib.dictionary_get_enumerator));
        assert_eq!(
            meta.type_name(meta.method(target).ret),
            "ArrayEnumerator<KeyValuePair<string,string>>"
        );
    }

    #[test]
    fn dictionary_maps_interface_members() {
        let mut b = MetadataBuilder::new();
        let lib = b.metadata().corlib().clone();
        let d = b.instantiate(lib.dictionary, &[TypeId::STRING, TypeId::I32]).unwrap();
        let meta = b.finish().unwrap();
        let add = meta.find_method(d, "Add", None).unwrap();
        let ifaces = meta.implemented_interface_methods(add);
        assert_eq!(ifaces.len(), 1);
        assert_eq!(
            meta.method(ifaces[0]).generic_definition,
            Some(lib.idictionary_methods.add)
        );
    }

    #[test]
    fn math_is_pure() {
        let meta = MetadataBuilder::new().finish().unwrap();
        assert!(meta.ty(meta.corlib().math).pure);
        assert!(meta.ty(TypeId::STRING).pure);
    }
}
