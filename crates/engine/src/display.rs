//! Human-readable rendering of expressions.
//!
//! `Display` on [`Expr`] works without metadata and prints member handles
//! as `f#n` / `m#n`; [`Expr::render`] resolves names against a
//! [`Metadata`] arena. Roots print as `%name`, binary operators are
//! parenthesized, conditionals print as `(test ? a : b)`.

use std::fmt;

use symil_common::{FieldId, Metadata, MethodId, TypeId};

use crate::expr::{Expr, ExprKind, UnaryOp};

/// An expression paired with the metadata used to name its members.
pub struct Rendered<'a> {
    expr: &'a Expr,
    meta: Option<&'a Metadata>,
}

impl Expr {
    pub fn render<'a>(&'a self, meta: &'a Metadata) -> Rendered<'a> {
        Rendered {
            expr: self,
            meta: Some(meta),
        }
    }
}

impl fmt::Display for Rendered<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Writer { meta: self.meta }.expr(f, self.expr)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Writer { meta: None }.expr(f, self)
    }
}

struct Writer<'a> {
    meta: Option<&'a Metadata>,
}

impl Writer<'_> {
    fn type_name(&self, ty: TypeId) -> String {
        match self.meta {
            Some(m) => m.type_name(ty),
            None => match ty.primitive() {
                Some(p) => p.name().to_string(),
                None if ty == TypeId::OBJECT => "object".to_string(),
                None if ty == TypeId::STRING => "string".to_string(),
                None => format!("t#{}", ty.index()),
            },
        }
    }

    fn field_name(&self, field: FieldId) -> String {
        match self.meta {
            Some(m) => m.field(field).name.clone(),
            None => format!("f#{}", field.index()),
        }
    }

    fn method_name(&self, method: MethodId, qualified: bool) -> String {
        match self.meta {
            Some(m) if qualified => m.method_name(method),
            Some(m) => m.method(method).name.clone(),
            None => format!("m#{}", method.index()),
        }
    }

    fn list(&self, f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            self.expr(f, item)?;
        }
        Ok(())
    }

    fn expr(&self, f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
        match e.kind() {
            ExprKind::Constant(c) => write!(f, "{c}"),
            ExprKind::Default => write!(f, "default({})", self.type_name(e.ty())),
            ExprKind::Placeholder(p) if p.is_root() => write!(f, "%{}", p.name()),
            ExprKind::Placeholder(p) => write!(f, "{}", p.name()),
            ExprKind::Field { target, field } => {
                match target {
                    Some(t) => self.expr(f, t)?,
                    None => {
                        let declaring = self.meta.map(|m| m.field(*field).declaring);
                        match declaring {
                            Some(d) => write!(f, "{}", self.type_name(d))?,
                            None => write!(f, "static")?,
                        }
                    }
                }
                write!(f, ".{}", self.field_name(*field))
            }
            ExprKind::Index { target, index } => {
                self.expr(f, target)?;
                write!(f, "[")?;
                self.expr(f, index)?;
                write!(f, "]")
            }
            ExprKind::AddressOf(inner) => {
                write!(f, "&")?;
                self.expr(f, inner)
            }
            ExprKind::FunctionPointer { method, .. } => {
                write!(f, "&{}", self.method_name(*method, true))
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Not if e.ty() == TypeId::BOOL => {
                    write!(f, "!")?;
                    self.expr(f, operand)
                }
                UnaryOp::Not => {
                    write!(f, "~")?;
                    self.expr(f, operand)
                }
                UnaryOp::Negate => {
                    write!(f, "-")?;
                    self.expr(f, operand)
                }
                UnaryOp::NegateChecked => {
                    write!(f, "checked(-")?;
                    self.expr(f, operand)?;
                    write!(f, ")")
                }
                UnaryOp::Convert => {
                    write!(f, "({})", self.type_name(e.ty()))?;
                    self.expr(f, operand)
                }
                UnaryOp::ConvertChecked => {
                    write!(f, "checked(({})", self.type_name(e.ty()))?;
                    self.expr(f, operand)?;
                    write!(f, ")")
                }
                UnaryOp::TypeAs => {
                    write!(f, "(")?;
                    self.expr(f, operand)?;
                    write!(f, " as {})", self.type_name(e.ty()))
                }
                UnaryOp::ArrayLength => {
                    self.expr(f, operand)?;
                    write!(f, ".Length")
                }
            },
            ExprKind::Binary { op, left, right } => {
                write!(f, "(")?;
                self.expr(f, left)?;
                write!(f, " {} ", op.symbol())?;
                self.expr(f, right)?;
                if op.is_checked() {
                    write!(f, " checked")?;
                }
                write!(f, ")")
            }
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                write!(f, "(")?;
                self.expr(f, test)?;
                write!(f, " ? ")?;
                self.expr(f, if_true)?;
                write!(f, " : ")?;
                self.expr(f, if_false)?;
                write!(f, ")")
            }
            ExprKind::Call {
                method,
                target,
                args,
            } => {
                match target {
                    Some(t) => {
                        self.expr(f, t)?;
                        write!(f, ".{}(", self.method_name(*method, false))?;
                    }
                    None => write!(f, "{}(", self.method_name(*method, true))?,
                }
                self.list(f, args)?;
                write!(f, ")")
            }
            ExprKind::New { args, .. } => {
                write!(f, "new {}(", self.type_name(e.ty()))?;
                self.list(f, args)?;
                write!(f, ")")
            }
            ExprKind::NewArrayBounds(len) => {
                let elem = self
                    .meta
                    .and_then(|m| m.element_type(e.ty()))
                    .map(|t| self.type_name(t))
                    .unwrap_or_else(|| "?".to_string());
                write!(f, "new {elem}[")?;
                self.expr(f, len)?;
                write!(f, "]")
            }
            ExprKind::NewArrayInit(items) => {
                write!(f, "new {} {{", self.type_name(e.ty()))?;
                self.list(f, items)?;
                write!(f, "}}")
            }
            ExprKind::Assign { target, value } => {
                self.expr(f, target)?;
                write!(f, " := ")?;
                self.expr(f, value)
            }
            ExprKind::Throw(ex) => {
                write!(f, "throw ")?;
                self.expr(f, ex)
            }
            ExprKind::Block(items) => {
                write!(f, "{{ ")?;
                for item in items {
                    self.expr(f, item)?;
                    write!(f, "; ")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;
    use symil_common::{Constant, MetadataBuilder};

    #[test]
    fn absolute_value_shape() {
        let p = Expr::root(TypeId::I32, "p");
        let e = Expr::conditional(
            Expr::binary(BinaryOp::LessThan, p.clone(), Expr::i32(0)),
            Expr::negate(p.clone()),
            p,
        );
        assert_eq!(e.to_string(), "((%p < 0) ? -%p : %p)");
    }

    #[test]
    fn locals_and_assignments() {
        let x = Expr::local(TypeId::I32, "local_0__1");
        let e = Expr::assign(x, Expr::constant(Constant::str("a")));
        assert_eq!(e.to_string(), "local_0__1 := \"a\"");
    }

    #[test]
    fn render_uses_member_names() {
        let meta = MetadataBuilder::new().finish().unwrap();
        let lib = meta.corlib();
        let ex = Expr::root(lib.exception, "e");
        let msg = Expr::field(Some(ex), lib.exception_message, TypeId::STRING);
        assert_eq!(msg.render(&meta).to_string(), "%e._message");
        let thrown = Expr::throw(Expr::new_object(
            lib.exception_ctor,
            vec![Expr::constant(Constant::str("boom"))],
            lib.exception,
        ));
        assert_eq!(
            thrown.render(&meta).to_string(),
            "throw new Exception(\"boom\")"
        );
    }

    #[test]
    fn bool_not_and_bitwise_not_differ() {
        let b = Expr::root(TypeId::BOOL, "b");
        let i = Expr::root(TypeId::I32, "i");
        assert_eq!(Expr::not(b).to_string(), "!%b");
        assert_eq!(Expr::not(i).to_string(), "~%i");
    }
}
