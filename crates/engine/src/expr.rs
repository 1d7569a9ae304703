//! Symbolic expression trees.
//!
//! An [`Expr`] is an immutable, reference-counted node. Equality is
//! structural and type-aware, and the structural hash is computed once when
//! the node is built, so expressions are cheap store keys: hashing is O(1),
//! unequal hashes short-circuit equality and pointer equality is the fast
//! path.
//!
//! Placeholders follow their own identity rules (see [`Placeholder`]).

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHasher;
use symil_common::{Constant, FieldId, MethodId, TypeId};

/// Names starting with this marker are engine temporaries.
pub const SYNTHETIC_PREFIX: &str = "__";

static NEXT_PLACEHOLDER: AtomicU64 = AtomicU64::new(1);

/// An unresolved value.
///
/// Root placeholders are unconstrained inputs; two roots are equal only if
/// they are the same introduction. Local placeholders are re-assignable
/// slots (locals, arguments, temporaries) and compare by name, except
/// synthetic ones (names starting with [`SYNTHETIC_PREFIX`]) which compare
/// by introduction like roots.
#[derive(Debug, Clone)]
pub struct Placeholder {
    name: Arc<str>,
    id: u64,
    root: bool,
    not_null: bool,
    exact_type: bool,
}

impl Placeholder {
    fn fresh(name: &str, root: bool, not_null: bool, exact_type: bool) -> Self {
        Self {
            name: Arc::from(name),
            id: NEXT_PLACEHOLDER.fetch_add(1, Ordering::Relaxed),
            root,
            not_null,
            exact_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    /// The value is known not to be `null`.
    pub fn is_not_null(&self) -> bool {
        self.not_null
    }

    /// The run-time type equals the static type.
    pub fn is_exact_type(&self) -> bool {
        self.exact_type
    }

    pub fn is_synthetic(&self) -> bool {
        self.name.starts_with(SYNTHETIC_PREFIX)
    }

    fn compares_by_id(&self) -> bool {
        self.root || self.is_synthetic()
    }
}

impl PartialEq for Placeholder {
    fn eq(&self, other: &Self) -> bool {
        if self.root != other.root {
            return false;
        }
        if self.compares_by_id() || other.compares_by_id() {
            self.id == other.id
        } else {
            self.name == other.name
        }
    }
}

impl Eq for Placeholder {}

impl Hash for Placeholder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.hash(state);
        if self.compares_by_id() {
            self.id.hash(state);
        } else {
            self.name.hash(state);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Logical negation on `bool`, bitwise complement on integers.
    Not,
    Negate,
    NegateChecked,
    /// Conversion to the node's type.
    Convert,
    ConvertChecked,
    /// `operand as T`: the operand, or `null` when it is not a `T`.
    TypeAs,
    ArrayLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    AddChecked,
    Sub,
    SubChecked,
    Mul,
    MulChecked,
    Div,
    Rem,
    /// Logical on `bool`, bitwise on integers.
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    pub fn is_checked(self) -> bool {
        matches!(
            self,
            BinaryOp::AddChecked | BinaryOp::SubChecked | BinaryOp::MulChecked
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add | BinaryOp::AddChecked => "+",
            BinaryOp::Sub | BinaryOp::SubChecked => "-",
            BinaryOp::Mul | BinaryOp::MulChecked => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    Constant(Constant),
    /// Zero value of the node's type.
    Default,
    Placeholder(Placeholder),
    /// Instance field when `target` is set, static field otherwise.
    Field {
        target: Option<Expr>,
        field: FieldId,
    },
    /// Array element or associative-container entry.
    Index {
        target: Expr,
        index: Expr,
    },
    AddressOf(Expr),
    FunctionPointer {
        method: MethodId,
        target: Option<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Expr,
    },
    Binary {
        op: BinaryOp,
        left: Expr,
        right: Expr,
    },
    Conditional {
        test: Expr,
        if_true: Expr,
        if_false: Expr,
    },
    Call {
        method: MethodId,
        target: Option<Expr>,
        args: Vec<Expr>,
    },
    New {
        ctor: MethodId,
        args: Vec<Expr>,
    },
    /// One-dimensional array of the given length.
    NewArrayBounds(Expr),
    NewArrayInit(Vec<Expr>),
    Assign {
        target: Expr,
        value: Expr,
    },
    Throw(Expr),
    Block(Vec<Expr>),
}

#[derive(Debug)]
pub struct ExprNode {
    kind: ExprKind,
    ty: TypeId,
    hash: u64,
}

impl PartialEq for ExprNode {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.ty == other.ty && self.kind == other.kind
    }
}

/// Shared handle to an immutable expression node.
#[derive(Clone)]
pub struct Expr(Arc<ExprNode>);

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Expr {
    fn make(kind: ExprKind, ty: TypeId) -> Expr {
        let mut h = FxHasher::default();
        ty.hash(&mut h);
        kind.hash(&mut h);
        Expr(Arc::new(ExprNode {
            kind,
            ty,
            hash: h.finish(),
        }))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn ty(&self) -> TypeId {
        self.0.ty
    }

    /// The cached structural hash.
    pub fn structural_hash(&self) -> u64 {
        self.0.hash
    }

    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // ---- constructors ----

    /// A literal typed by its intrinsic type.
    pub fn constant(c: Constant) -> Expr {
        let ty = c.type_id();
        Expr::make(ExprKind::Constant(c), ty)
    }

    /// A literal with an explicit static type (typed `null`, enum values,
    /// boxed literals).
    pub fn typed_constant(c: Constant, ty: TypeId) -> Expr {
        Expr::make(ExprKind::Constant(c), ty)
    }

    pub fn null(ty: TypeId) -> Expr {
        Expr::typed_constant(Constant::Null, ty)
    }

    pub fn bool(b: bool) -> Expr {
        Expr::constant(Constant::Bool(b))
    }

    pub fn i32(v: i32) -> Expr {
        Expr::constant(Constant::I32(v))
    }

    pub fn default_of(ty: TypeId) -> Expr {
        Expr::make(ExprKind::Default, ty)
    }

    /// A fresh unconstrained input.
    pub fn root(ty: TypeId, name: &str) -> Expr {
        Expr::root_tagged(ty, name, false, false)
    }

    pub fn root_tagged(ty: TypeId, name: &str, not_null: bool, exact_type: bool) -> Expr {
        Expr::make(
            ExprKind::Placeholder(Placeholder::fresh(name, true, not_null, exact_type)),
            ty,
        )
    }

    /// A re-assignable slot.
    pub fn local(ty: TypeId, name: &str) -> Expr {
        Expr::make(
            ExprKind::Placeholder(Placeholder::fresh(name, false, false, false)),
            ty,
        )
    }

    pub fn field(target: Option<Expr>, field: FieldId, ty: TypeId) -> Expr {
        Expr::make(ExprKind::Field { target, field }, ty)
    }

    pub fn index(target: Expr, index: Expr, ty: TypeId) -> Expr {
        Expr::make(ExprKind::Index { target, index }, ty)
    }

    pub fn address_of(e: Expr) -> Expr {
        let ty = e.ty().by_ref();
        Expr::make(ExprKind::AddressOf(e), ty)
    }

    pub fn function_pointer(method: MethodId, target: Option<Expr>) -> Expr {
        Expr::make(ExprKind::FunctionPointer { method, target }, TypeId::NATIVE_INT)
    }

    pub fn unary(op: UnaryOp, operand: Expr, ty: TypeId) -> Expr {
        debug_assert!(
            op != UnaryOp::Not || operand.ty() == ty,
            "not must preserve the operand type"
        );
        Expr::make(ExprKind::Unary { op, operand }, ty)
    }

    pub fn not(e: Expr) -> Expr {
        let ty = e.ty();
        Expr::unary(UnaryOp::Not, e, ty)
    }

    pub fn negate(e: Expr) -> Expr {
        let ty = e.ty();
        Expr::unary(UnaryOp::Negate, e, ty)
    }

    pub fn convert(e: Expr, ty: TypeId) -> Expr {
        Expr::unary(UnaryOp::Convert, e, ty)
    }

    /// A binary operator node. Comparisons are typed `bool`, everything
    /// else takes the left operand's type.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        debug_assert!(
            op.is_comparison() || op.is_shift() || left.ty() == right.ty(),
            "{op:?} operands must share a type: {:?} vs {:?}",
            left.ty(),
            right.ty()
        );
        let ty = if op.is_comparison() {
            TypeId::BOOL
        } else {
            left.ty()
        };
        Expr::make(ExprKind::Binary { op, left, right }, ty)
    }

    pub fn and(a: Expr, b: Expr) -> Expr {
        Expr::binary(BinaryOp::And, a, b)
    }

    pub fn or(a: Expr, b: Expr) -> Expr {
        Expr::binary(BinaryOp::Or, a, b)
    }

    pub fn eq(a: Expr, b: Expr) -> Expr {
        Expr::binary(BinaryOp::Equal, a, b)
    }

    pub fn conditional(test: Expr, if_true: Expr, if_false: Expr) -> Expr {
        debug_assert_eq!(test.ty(), TypeId::BOOL, "conditional test must be bool");
        let ty = if_true.ty();
        Expr::make(
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            },
            ty,
        )
    }

    pub fn call(method: MethodId, target: Option<Expr>, args: Vec<Expr>, ret: TypeId) -> Expr {
        Expr::make(
            ExprKind::Call {
                method,
                target,
                args,
            },
            ret,
        )
    }

    pub fn new_object(ctor: MethodId, args: Vec<Expr>, ty: TypeId) -> Expr {
        Expr::make(ExprKind::New { ctor, args }, ty)
    }

    pub fn new_array(array_ty: TypeId, length: Expr) -> Expr {
        Expr::make(ExprKind::NewArrayBounds(length), array_ty)
    }

    pub fn new_array_init(array_ty: TypeId, items: Vec<Expr>) -> Expr {
        Expr::make(ExprKind::NewArrayInit(items), array_ty)
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        let ty = target.ty();
        Expr::make(ExprKind::Assign { target, value }, ty)
    }

    pub fn throw(exception: Expr) -> Expr {
        Expr::make(ExprKind::Throw(exception), TypeId::VOID)
    }

    pub fn block(items: Vec<Expr>) -> Expr {
        let ty = items.last().map_or(TypeId::VOID, Expr::ty);
        Expr::make(ExprKind::Block(items), ty)
    }

    // ---- queries ----

    pub fn as_constant(&self) -> Option<&Constant> {
        match self.kind() {
            ExprKind::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind(), ExprKind::Constant(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_constant().and_then(Constant::as_bool)
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self.kind(), ExprKind::Constant(Constant::Null))
    }

    pub fn as_placeholder(&self) -> Option<&Placeholder> {
        match self.kind() {
            ExprKind::Placeholder(p) => Some(p),
            _ => None,
        }
    }

    /// A local placeholder or root whose name carries the synthetic marker.
    pub fn is_synthetic_placeholder(&self) -> bool {
        self.as_placeholder().is_some_and(Placeholder::is_synthetic)
    }

    /// A heap location: field or element access.
    pub fn is_heap_read(&self) -> bool {
        matches!(self.kind(), ExprKind::Field { .. } | ExprKind::Index { .. })
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self.kind() {
            ExprKind::Constant(_) | ExprKind::Default | ExprKind::Placeholder(_) => Vec::new(),
            ExprKind::Field { target, .. } | ExprKind::FunctionPointer { target, .. } => {
                target.iter().collect()
            }
            ExprKind::Index { target, index } => vec![target, index],
            ExprKind::AddressOf(e) | ExprKind::NewArrayBounds(e) | ExprKind::Throw(e) => vec![e],
            ExprKind::Unary { operand, .. } => vec![operand],
            ExprKind::Binary { left, right, .. } => vec![left, right],
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => vec![test, if_true, if_false],
            ExprKind::Call { target, args, .. } => target.iter().chain(args.iter()).collect(),
            ExprKind::New { args, .. } => args.iter().collect(),
            ExprKind::NewArrayInit(items) | ExprKind::Block(items) => items.iter().collect(),
            ExprKind::Assign { target, value } => vec![target, value],
        }
    }

    /// Rebuilds the node with every child mapped through `f`. Returns the
    /// same node (pointer-equal) when no child changed.
    pub fn try_map_children<E>(
        &self,
        mut f: impl FnMut(&Expr) -> Result<Expr, E>,
    ) -> Result<Expr, E> {
        let mut changed = false;
        let kind = {
            let mut m = |e: &Expr| -> Result<Expr, E> {
                let n = f(e)?;
                if !n.ptr_eq(e) {
                    changed = true;
                }
                Ok(n)
            };
            match self.kind() {
                ExprKind::Constant(_) | ExprKind::Default | ExprKind::Placeholder(_) => {
                    return Ok(self.clone())
                }
                ExprKind::Field { target, field } => ExprKind::Field {
                    target: target.as_ref().map(&mut m).transpose()?,
                    field: *field,
                },
                ExprKind::Index { target, index } => ExprKind::Index {
                    target: m(target)?,
                    index: m(index)?,
                },
                ExprKind::AddressOf(e) => ExprKind::AddressOf(m(e)?),
                ExprKind::FunctionPointer { method, target } => ExprKind::FunctionPointer {
                    method: *method,
                    target: target.as_ref().map(&mut m).transpose()?,
                },
                ExprKind::Unary { op, operand } => ExprKind::Unary {
                    op: *op,
                    operand: m(operand)?,
                },
                ExprKind::Binary { op, left, right } => ExprKind::Binary {
                    op: *op,
                    left: m(left)?,
                    right: m(right)?,
                },
                ExprKind::Conditional {
                    test,
                    if_true,
                    if_false,
                } => ExprKind::Conditional {
                    test: m(test)?,
                    if_true: m(if_true)?,
                    if_false: m(if_false)?,
                },
                ExprKind::Call {
                    method,
                    target,
                    args,
                } => ExprKind::Call {
                    method: *method,
                    target: target.as_ref().map(&mut m).transpose()?,
                    args: args.iter().map(&mut m).collect::<Result<_, _>>()?,
                },
                ExprKind::New { ctor, args } => ExprKind::New {
                    ctor: *ctor,
                    args: args.iter().map(&mut m).collect::<Result<_, _>>()?,
                },
                ExprKind::NewArrayBounds(e) => ExprKind::NewArrayBounds(m(e)?),
                ExprKind::NewArrayInit(items) => {
                    ExprKind::NewArrayInit(items.iter().map(&mut m).collect::<Result<_, _>>()?)
                }
                ExprKind::Assign { target, value } => ExprKind::Assign {
                    target: m(target)?,
                    value: m(value)?,
                },
                ExprKind::Throw(e) => ExprKind::Throw(m(e)?),
                ExprKind::Block(items) => {
                    ExprKind::Block(items.iter().map(&mut m).collect::<Result<_, _>>()?)
                }
            }
        };
        if !changed {
            return Ok(self.clone());
        }
        Ok(Expr::make(kind, self.ty()))
    }

    pub fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        match self.try_map_children(|e| Ok::<_, std::convert::Infallible>(f(e))) {
            Ok(e) => e,
            Err(never) => match never {},
        }
    }

    /// Whether `needle` occurs anywhere in the tree.
    pub fn contains(&self, needle: &Expr) -> bool {
        self == needle || self.children().into_iter().any(|c| c.contains(needle))
    }

    /// Replaces every occurrence of `from` with `to`.
    pub fn replace(&self, from: &Expr, to: &Expr) -> Expr {
        if self == from {
            return to.clone();
        }
        self.map_children(|c| c.replace(from, to))
    }

    /// Flattens nested conditionals into `(guard, leaf)` pairs, where each
    /// guard conjoins the tests leading to the leaf. Guards are not
    /// simplified.
    pub fn branches(&self) -> Vec<(Expr, Expr)> {
        let ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } = self.kind()
        else {
            return vec![(Expr::bool(true), self.clone())];
        };
        let negated = match test.kind() {
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => operand.clone(),
            _ => Expr::not(test.clone()),
        };
        let mut out = Vec::new();
        for (guard, arm) in [(test.clone(), if_true), (negated, if_false)] {
            if matches!(arm.kind(), ExprKind::Conditional { .. }) {
                for (inner, leaf) in arm.branches() {
                    out.push((Expr::and(guard.clone(), inner), leaf));
                }
            } else {
                out.push((guard, arm.clone()));
            }
        }
        out
    }

    pub fn node_count(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(Expr::node_count)
            .sum::<usize>()
    }
}
