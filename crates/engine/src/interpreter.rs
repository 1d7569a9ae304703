//! Instruction dispatch and the branch explorer.
//!
//! The interpreter walks one decoded body with a program counter. Decided
//! branches just move the counter; an undecided branch forks the state,
//! runs the rest of the body along both arms and merges the results, so a
//! call to [`Executor::run`] always returns the single joined state of
//! every path through the body.

use symil_common::{Constant, Instruction, LabelId, Opcode, Operand, Primitive, Region, TypeId};
use tracing::trace;

use crate::convert::{compare, force_convert, to_bool, to_numeric, to_signed, to_unsigned, unify, unwrap_address_of};
use crate::disassembly::FinallyRegion;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::expr::{BinaryOp, Expr, UnaryOp};
use crate::frame::Frame;
use crate::resolve::ResolveMode;
use crate::state::ExecutionState;

/// What the interpreter does after an instruction.
enum Flow {
    Next(ExecutionState),
    Jump(ExecutionState, LabelId),
    /// Continue at the label when the test holds, at the next instruction
    /// otherwise.
    Branch(ExecutionState, Expr, LabelId),
    Leave(ExecutionState, LabelId),
    EndFinally(ExecutionState),
    Return(ExecutionState),
}

/// A `leave` whose finally handlers are still running.
#[derive(Debug, Clone)]
struct PendingLeave {
    target: usize,
    /// Handlers still to run after the current one, innermost first.
    remaining: Vec<FinallyRegion>,
}

#[derive(Debug, Clone, Default)]
struct Cursor {
    pc: usize,
    pending: Vec<PendingLeave>,
    constrained: Option<TypeId>,
}

/// Target primitive, checked, unsigned source.
fn conversion(opcode: Opcode) -> Option<(Primitive, bool, bool)> {
    use Opcode::*;
    Some(match opcode {
        ConvI1 => (Primitive::I8, false, false),
        ConvI2 => (Primitive::I16, false, false),
        ConvI4 => (Primitive::I32, false, false),
        ConvI8 => (Primitive::I64, false, false),
        ConvU1 => (Primitive::U8, false, false),
        ConvU2 => (Primitive::U16, false, false),
        ConvU4 => (Primitive::U32, false, false),
        ConvU8 => (Primitive::U64, false, false),
        ConvR4 => (Primitive::F32, false, false),
        ConvR8 => (Primitive::F64, false, false),
        ConvRUn => (Primitive::F64, false, true),
        ConvOvfI1 => (Primitive::I8, true, false),
        ConvOvfI2 => (Primitive::I16, true, false),
        ConvOvfI4 => (Primitive::I32, true, false),
        ConvOvfI8 => (Primitive::I64, true, false),
        ConvOvfU1 => (Primitive::U8, true, false),
        ConvOvfU2 => (Primitive::U16, true, false),
        ConvOvfU4 => (Primitive::U32, true, false),
        ConvOvfU8 => (Primitive::U64, true, false),
        ConvOvfI1Un => (Primitive::I8, true, true),
        ConvOvfI2Un => (Primitive::I16, true, true),
        ConvOvfI4Un => (Primitive::I32, true, true),
        ConvOvfI8Un => (Primitive::I64, true, true),
        ConvOvfU1Un => (Primitive::U8, true, true),
        ConvOvfU2Un => (Primitive::U16, true, true),
        ConvOvfU4Un => (Primitive::U32, true, true),
        ConvOvfU8Un => (Primitive::U64, true, true),
        _ => return None,
    })
}

/// Operator and unsigned flag of an arithmetic or bitwise opcode.
fn arithmetic(opcode: Opcode) -> Option<(BinaryOp, bool)> {
    use Opcode::*;
    Some(match opcode {
        Add => (BinaryOp::Add, false),
        Sub => (BinaryOp::Sub, false),
        Mul => (BinaryOp::Mul, false),
        Div => (BinaryOp::Div, false),
        DivUn => (BinaryOp::Div, true),
        Rem => (BinaryOp::Rem, false),
        RemUn => (BinaryOp::Rem, true),
        AddOvf => (BinaryOp::AddChecked, false),
        AddOvfUn => (BinaryOp::AddChecked, true),
        SubOvf => (BinaryOp::SubChecked, false),
        SubOvfUn => (BinaryOp::SubChecked, true),
        MulOvf => (BinaryOp::MulChecked, false),
        MulOvfUn => (BinaryOp::MulChecked, true),
        And => (BinaryOp::And, false),
        Or => (BinaryOp::Or, false),
        Xor => (BinaryOp::Xor, false),
        _ => return None,
    })
}

/// Comparison and unsigned flag of a compare-and-branch opcode.
fn branch_comparison(opcode: Opcode) -> Option<(BinaryOp, bool)> {
    use Opcode::*;
    Some(match opcode {
        Beq => (BinaryOp::Equal, false),
        BneUn => (BinaryOp::NotEqual, false),
        Bge => (BinaryOp::GreaterThanOrEqual, false),
        Bgt => (BinaryOp::GreaterThan, false),
        Ble => (BinaryOp::LessThanOrEqual, false),
        Blt => (BinaryOp::LessThan, false),
        BgeUn => (BinaryOp::GreaterThanOrEqual, true),
        BgtUn => (BinaryOp::GreaterThan, true),
        BleUn => (BinaryOp::LessThanOrEqual, true),
        BltUn => (BinaryOp::LessThan, true),
        _ => return None,
    })
}

impl Executor<'_> {
    /// Runs `frame` from its first instruction to termination.
    pub(crate) fn run(&mut self, frame: &Frame, state: ExecutionState) -> Result<ExecutionState, EngineError> {
        self.run_from(frame, state, Cursor::default())
    }

    fn run_from(
        &mut self,
        frame: &Frame,
        mut state: ExecutionState,
        mut cursor: Cursor,
    ) -> Result<ExecutionState, EngineError> {
        let instructions = frame.body.instructions();
        loop {
            let pc = cursor.pc;
            self.set_pc(pc);
            let (opcode, operand) = match instructions.get(pc) {
                None => return Err(self.invalid("control falls off the end of the body")),
                Some(Instruction::Label(_)) => {
                    cursor.pc += 1;
                    continue;
                }
                Some(Instruction::Region(Region::CatchStart(_) | Region::FaultStart)) => {
                    cursor.pc = frame
                        .body
                        .skip_handler(pc)
                        .ok_or_else(|| self.invalid("handler without an end"))?;
                    continue;
                }
                Some(Instruction::Region(_)) => {
                    cursor.pc += 1;
                    continue;
                }
                Some(Instruction::Op { opcode, operand }) => (*opcode, operand),
            };
            self.tick()?;
            let constrained = cursor.constrained.take();

            match self.step(frame, state, opcode, operand, &mut cursor, constrained)? {
                Flow::Next(next) => {
                    state = next;
                    cursor.pc += 1;
                }
                Flow::Jump(next, label) => {
                    state = next;
                    cursor.pc = self.target(frame, label)?;
                }
                Flow::Branch(next, test, label) => {
                    let target = self.target(frame, label)?;
                    let test = self.resolve(&test, &next, ResolveMode::Full);
                    match test.as_bool().or_else(|| next.implied(&test)) {
                        Some(true) => cursor.pc = target,
                        Some(false) => cursor.pc += 1,
                        None => return self.fork(frame, next, test, target, cursor),
                    }
                    state = next;
                }
                Flow::Leave(next, label) => {
                    let target = self.target(frame, label)?;
                    state = next.clear_stack();
                    let mut handlers = frame.body.finally_for_leave(pc, target);
                    if handlers.is_empty() {
                        cursor.pc = target;
                    } else {
                        let first = handlers.remove(0);
                        cursor.pending.push(PendingLeave {
                            target,
                            remaining: handlers,
                        });
                        cursor.pc = first.start + 1;
                    }
                }
                Flow::EndFinally(next) => {
                    state = next;
                    let outer = match cursor.pending.last_mut() {
                        Some(p) if !p.remaining.is_empty() => Some(p.remaining.remove(0).start + 1),
                        _ => None,
                    };
                    cursor.pc = match outer {
                        Some(start) => start,
                        None => cursor.pending.pop().map_or(pc + 1, |p| p.target),
                    };
                }
                Flow::Return(done) => return Ok(done),
            }
            if state.is_thrown() {
                return Ok(state);
            }
        }
    }

    /// Runs both arms of an undecided branch to termination and merges them.
    fn fork(
        &mut self,
        frame: &Frame,
        state: ExecutionState,
        test: Expr,
        target: usize,
        cursor: Cursor,
    ) -> Result<ExecutionState, EngineError> {
        self.enter_fork()?;
        trace!(
            method = %self.meta().method_name(frame.method),
            at = cursor.pc,
            test = %test.render(self.meta()),
            "fork"
        );
        let negated = self.simplify(&Expr::not(test.clone()));
        let fallthrough = cursor.pc + 1;
        let taken = self.run_from(
            frame,
            state.fork(test.clone()),
            Cursor {
                pc: target,
                ..cursor.clone()
            },
        );
        let arms = taken.and_then(|taken| {
            let other = self.run_from(
                frame,
                state.fork(negated),
                Cursor {
                    pc: fallthrough,
                    ..cursor
                },
            )?;
            Ok((taken, other))
        });
        self.leave_fork();
        let (taken, other) = arms?;
        self.set_pc(fallthrough - 1);
        self.merge(&state, &test, taken, other)
    }

    fn target(&self, frame: &Frame, label: LabelId) -> Result<usize, EngineError> {
        frame
            .body
            .label(label)
            .ok_or_else(|| self.invalid(format!("undefined label {label}")))
    }

    fn pop<const N: usize>(&self, state: ExecutionState) -> Result<(ExecutionState, [Expr; N]), EngineError> {
        let top = state
            .peek(N)
            .ok_or_else(|| self.invalid(format!("stack underflow: need {N}, have {}", state.stack().len())))?;
        let values: [Expr; N] = std::array::from_fn(|i| top[i].clone());
        Ok((state.replace_top(N, std::iter::empty()), values))
    }

    /// The object a field or element access goes through.
    fn receiver(&self, state: &ExecutionState, e: &Expr) -> Expr {
        self.resolve(&unwrap_address_of(e), state, ResolveMode::Default)
    }

    fn is_null(&self, state: &ExecutionState, e: &Expr) -> bool {
        self.resolve(e, state, ResolveMode::Full).is_null_constant()
    }

    fn throw_null(&mut self, state: ExecutionState) -> Result<Flow, EngineError> {
        let ctor = self.meta().corlib().null_reference_ctor;
        self.throw_new(state, ctor).map(Flow::Return)
    }

    fn index_value(&self, state: &ExecutionState, e: &Expr, mode: ResolveMode) -> Result<Expr, EngineError> {
        let meta = self.meta();
        let n = to_numeric(meta, &self.resolve(e, state, mode))
            .ok_or_else(|| self.invalid(format!("array index of type {}", meta.type_name(e.ty()))))?;
        Ok(self.simplify(&force_convert(meta, &n, TypeId::I32)))
    }

    fn element_type(&self, array: &Expr, declared: TypeId) -> TypeId {
        self.meta().element_type(array.ty()).unwrap_or(declared)
    }

    fn step(
        &mut self,
        frame: &Frame,
        state: ExecutionState,
        opcode: Opcode,
        operand: &Operand,
        cursor: &mut Cursor,
        constrained: Option<TypeId>,
    ) -> Result<Flow, EngineError> {
        let meta = self.meta();

        if let Some((op, unsigned)) = arithmetic(opcode) {
            let (state, [a, b]) = self.pop(state)?;
            let bitwise = matches!(op, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor);
            let (a, b) = if bitwise && a.ty() == TypeId::BOOL && b.ty() == TypeId::BOOL {
                (a, b)
            } else {
                unify(meta, &a, &b).ok_or_else(|| {
                    self.invalid(format!(
                        "{} on {} and {}",
                        opcode.mnemonic(),
                        meta.type_name(a.ty()),
                        meta.type_name(b.ty())
                    ))
                })?
            };
            let (a, b) = if unsigned {
                (to_unsigned(&a), to_unsigned(&b))
            } else {
                (a, b)
            };
            return Ok(Flow::Next(state.push(self.simplify(&Expr::binary(op, a, b)))));
        }
        if let Some((target, checked, unsigned)) = conversion(opcode) {
            let (state, [v]) = self.pop(state)?;
            let n = to_numeric(meta, &v)
                .ok_or_else(|| self.invalid(format!("{} on {}", opcode.mnemonic(), meta.type_name(v.ty()))))?;
            let n = if unsigned { to_unsigned(&n) } else { n };
            let op = if checked {
                UnaryOp::ConvertChecked
            } else {
                UnaryOp::Convert
            };
            let converted = Expr::unary(op, n, target.type_id());
            return Ok(Flow::Next(state.push(self.simplify(&converted))));
        }
        if let Some((op, unsigned)) = branch_comparison(opcode) {
            let Operand::Label(label) = operand else {
                return Err(self.invalid(format!("{} without a label", opcode.mnemonic())));
            };
            let (state, [a, b]) = self.pop(state)?;
            let test = compare(meta, op, &a, &b, unsigned).ok_or_else(|| {
                self.invalid(format!(
                    "{} on {} and {}",
                    opcode.mnemonic(),
                    meta.type_name(a.ty()),
                    meta.type_name(b.ty())
                ))
            })?;
            return Ok(Flow::Branch(state, test, *label));
        }

        let flow = match (opcode, operand) {
            (Opcode::Nop | Opcode::Break | Opcode::Volatile | Opcode::Tail | Opcode::Readonly, _)
            | (Opcode::Unaligned, _) => Flow::Next(state),
            (Opcode::Constrained, Operand::Type(t)) => {
                cursor.constrained = Some(*t);
                Flow::Next(state)
            }

            // Arguments and locals
            (Opcode::Ldarg, Operand::Index(i)) => {
                let slot = self.arg_slot(frame, *i)?;
                let value = self.resolve(&slot, &state, ResolveMode::Default);
                Flow::Next(state.push(value))
            }
            (Opcode::Ldarga, Operand::Index(i)) => {
                let slot = self.arg_slot(frame, *i)?;
                Flow::Next(state.push(Expr::address_of(slot)))
            }
            (Opcode::Starg, Operand::Index(i)) => {
                let slot = self.arg_slot(frame, *i)?;
                let (state, [v]) = self.pop(state)?;
                Flow::Next(self.set_var(state, &slot, &v)?)
            }
            (Opcode::Ldloc, Operand::Index(i)) => {
                let slot = self.local_slot(frame, *i)?;
                let value = self.resolve(&slot, &state, ResolveMode::Default);
                Flow::Next(state.push(value))
            }
            (Opcode::Ldloca, Operand::Index(i)) => {
                let slot = self.local_slot(frame, *i)?;
                Flow::Next(state.push(Expr::address_of(slot)))
            }
            (Opcode::Stloc, Operand::Index(i)) => {
                let slot = self.local_slot(frame, *i)?;
                let (state, [v]) = self.pop(state)?;
                Flow::Next(self.set_var(state, &slot, &v)?)
            }

            // Constants
            (Opcode::Ldnull, _) => Flow::Next(state.push(Expr::null(TypeId::OBJECT))),
            (Opcode::LdcI4, Operand::Int32(v)) => Flow::Next(state.push(Expr::i32(*v))),
            (Opcode::LdcI8, Operand::Int64(v)) => Flow::Next(state.push(Expr::constant(Constant::I64(*v)))),
            (Opcode::LdcR4, Operand::Float32(v)) => Flow::Next(state.push(Expr::constant(Constant::F32(*v)))),
            (Opcode::LdcR8, Operand::Float64(v)) => Flow::Next(state.push(Expr::constant(Constant::F64(*v)))),
            (Opcode::Ldstr, Operand::String(s)) => {
                Flow::Next(state.push(Expr::constant(Constant::Str(s.clone()))))
            }
            (Opcode::Ldtoken, Operand::Token(t)) => Flow::Next(
                state.push(Expr::typed_constant(Constant::Token(*t), TypeId::RUNTIME_HANDLE)),
            ),

            // Stack
            (Opcode::Dup, _) => {
                let top = state
                    .stack()
                    .last()
                    .cloned()
                    .ok_or_else(|| self.invalid("dup on an empty stack"))?;
                Flow::Next(state.push(top))
            }
            (Opcode::Pop, _) => Flow::Next(self.pop::<1>(state)?.0),

            // Calls
            (Opcode::Call, Operand::Method(m)) => Flow::Next(self.dispatch(state, *m, false, constrained)?),
            (Opcode::Callvirt, Operand::Method(m)) => Flow::Next(self.dispatch(state, *m, true, constrained)?),
            (Opcode::Newobj, Operand::Method(m)) => Flow::Next(self.call_constructor(state, *m)?),
            (Opcode::Ldftn, Operand::Method(m)) => Flow::Next(state.push(Expr::function_pointer(*m, None))),
            (Opcode::Ldvirtftn, Operand::Method(m)) => {
                let (state, [obj]) = self.pop(state)?;
                let obj = self.receiver(&state, &obj);
                let target = if meta.method(*m).is_overridable() {
                    self.devirtualize(&state, *m, &obj)?
                } else {
                    *m
                };
                Flow::Next(state.push(Expr::function_pointer(target, None)))
            }
            (Opcode::Ret, _) => Flow::Return(self.ret(frame, state)?),

            // Control flow
            (Opcode::Br, Operand::Label(label)) => Flow::Jump(state, *label),
            (Opcode::Brtrue | Opcode::Brfalse, Operand::Label(label)) => {
                let (state, [v]) = self.pop(state)?;
                let test = to_bool(meta, &v)
                    .ok_or_else(|| self.invalid(format!("branch on {}", meta.type_name(v.ty()))))?;
                let test = if opcode == Opcode::Brfalse {
                    Expr::not(test)
                } else {
                    test
                };
                Flow::Branch(state, test, *label)
            }
            (Opcode::Switch, Operand::Labels(labels)) => {
                let (state, [v]) = self.pop(state)?;
                let value = self.resolve(&v, &state, ResolveMode::Full);
                let index = value
                    .as_constant()
                    .and_then(Constant::as_i64)
                    .ok_or_else(|| self.unprovable(format!("switch value {}", value.render(meta))))?;
                match usize::try_from(index).ok().and_then(|i| labels.get(i)) {
                    Some(label) => Flow::Jump(state, *label),
                    None => Flow::Next(state),
                }
            }
            (Opcode::Leave, Operand::Label(label)) => Flow::Leave(state, *label),
            (Opcode::Endfinally, _) => Flow::EndFinally(state),
            (Opcode::Throw, _) => {
                let (state, [e]) = self.pop(state)?;
                if self.is_null(&state, &e) {
                    return self.throw_null(state);
                }
                let e = self.resolve(&e, &state, ResolveMode::Default);
                Flow::Return(state.with_exception(e))
            }

            // Unary operators and comparisons
            (Opcode::Neg, _) => {
                let (state, [v]) = self.pop(state)?;
                let n = to_numeric(meta, &v)
                    .ok_or_else(|| self.invalid(format!("neg on {}", meta.type_name(v.ty()))))?;
                Flow::Next(state.push(self.simplify(&Expr::negate(n))))
            }
            (Opcode::Not, _) => {
                let (state, [v]) = self.pop(state)?;
                let n = if v.ty() == TypeId::BOOL {
                    v
                } else {
                    to_numeric(meta, &v)
                        .ok_or_else(|| self.invalid(format!("not on {}", meta.type_name(v.ty()))))?
                };
                Flow::Next(state.push(self.simplify(&Expr::not(n))))
            }
            (Opcode::Shl | Opcode::Shr | Opcode::ShrUn, _) => {
                let (state, [v, amount]) = self.pop(state)?;
                let bad = || self.invalid(format!("{} on {}", opcode.mnemonic(), meta.type_name(v.ty())));
                let v = to_numeric(meta, &v).ok_or_else(bad)?;
                let amount = to_numeric(meta, &amount).ok_or_else(bad)?;
                let amount = force_convert(meta, &amount, TypeId::I32);
                let (op, v) = match opcode {
                    Opcode::Shl => (BinaryOp::Shl, v),
                    Opcode::Shr => (BinaryOp::Shr, to_signed(&v)),
                    _ => (BinaryOp::Shr, to_unsigned(&v)),
                };
                Flow::Next(state.push(self.simplify(&Expr::binary(op, v, amount))))
            }
            (Opcode::Ceq | Opcode::Cgt | Opcode::CgtUn | Opcode::Clt | Opcode::CltUn, _) => {
                let (state, [a, b]) = self.pop(state)?;
                let (op, unsigned) = match opcode {
                    Opcode::Ceq => (BinaryOp::Equal, false),
                    Opcode::Cgt => (BinaryOp::GreaterThan, false),
                    Opcode::CgtUn => (BinaryOp::GreaterThan, true),
                    Opcode::Clt => (BinaryOp::LessThan, false),
                    _ => (BinaryOp::LessThan, true),
                };
                let references = crate::convert::is_reference(meta, a.ty()) && crate::convert::is_reference(meta, b.ty());
                let test = if opcode == Opcode::CgtUn && references {
                    compare(meta, BinaryOp::NotEqual, &a, &b, false)
                } else {
                    compare(meta, op, &a, &b, unsigned)
                };
                let test = test.ok_or_else(|| {
                    self.invalid(format!(
                        "{} on {} and {}",
                        opcode.mnemonic(),
                        meta.type_name(a.ty()),
                        meta.type_name(b.ty())
                    ))
                })?;
                Flow::Next(state.push(self.simplify(&test)))
            }

            // Fields
            (Opcode::Ldfld, Operand::Field(f)) => {
                let (state, [obj]) = self.pop(state)?;
                let obj = self.receiver(&state, &obj);
                if self.is_null(&state, &obj) {
                    return self.throw_null(state);
                }
                let location = Expr::field(Some(obj), *f, meta.field(*f).ty);
                let value = self.resolve(&location, &state, ResolveMode::Default);
                Flow::Next(state.push(value))
            }
            (Opcode::Ldflda, Operand::Field(f)) => {
                let (state, [obj]) = self.pop(state)?;
                let obj = self.receiver(&state, &obj);
                if self.is_null(&state, &obj) {
                    return self.throw_null(state);
                }
                let location = Expr::field(Some(obj), *f, meta.field(*f).ty);
                Flow::Next(state.push(Expr::address_of(location)))
            }
            (Opcode::Stfld, Operand::Field(f)) => {
                let (state, [obj, v]) = self.pop(state)?;
                let obj = self.receiver(&state, &obj);
                if self.is_null(&state, &obj) {
                    return self.throw_null(state);
                }
                let location = Expr::field(Some(obj), *f, meta.field(*f).ty);
                Flow::Next(self.set_var(state, &location, &v)?)
            }
            (Opcode::Ldsfld, Operand::Field(f)) => {
                let def = meta.field(*f);
                if let Some(literal) = &def.literal {
                    return Ok(Flow::Next(state.push(Expr::typed_constant(literal.clone(), def.ty))));
                }
                let root = self.fresh_root(def.ty, "sfld");
                let read = Expr::assign(root.clone(), Expr::field(None, *f, def.ty));
                Flow::Next(state.add_side_effect(None, read).push(root))
            }
            (Opcode::Stsfld, Operand::Field(f)) => {
                let (state, [v]) = self.pop(state)?;
                let ty = meta.field(*f).ty;
                let v = self.resolve(&v, &state, ResolveMode::Default);
                let v = self.simplify(&force_convert(meta, &v, ty));
                Flow::Next(state.add_side_effect(None, Expr::assign(Expr::field(None, *f, ty), v)))
            }

            // Objects
            (Opcode::Box, Operand::Type(t)) => {
                let (state, [v]) = self.pop(state)?;
                let boxed = if meta.is_value_type(*t) {
                    let typed = force_convert(meta, &v, *t);
                    self.simplify(&force_convert(meta, &typed, TypeId::OBJECT))
                } else {
                    v
                };
                Flow::Next(state.push(boxed))
            }
            (Opcode::UnboxAny, Operand::Type(t)) if meta.is_value_type(*t) => {
                let (state, [v]) = self.pop(state)?;
                let v = self.resolve(&v, &state, ResolveMode::Default);
                Flow::Next(state.push(self.simplify(&force_convert(meta, &v, *t))))
            }
            (Opcode::UnboxAny | Opcode::Castclass, Operand::Type(t)) => {
                let (state, [v]) = self.pop(state)?;
                self.cast(state, v, *t, true)?
            }
            (Opcode::Isinst, Operand::Type(t)) => {
                let (state, [v]) = self.pop(state)?;
                self.cast(state, v, *t, false)?
            }
            (Opcode::Initobj, Operand::Type(t)) => {
                let (state, [address]) = self.pop(state)?;
                let (state, zero) = self.zero_value(state, *t);
                Flow::Next(self.set_var(state, &unwrap_address_of(&address), &zero)?)
            }
            (Opcode::Ldobj | Opcode::Ldind, Operand::Type(_)) => {
                let (state, [address]) = self.pop(state)?;
                let value = self.resolve(&unwrap_address_of(&address), &state, ResolveMode::Default);
                Flow::Next(state.push(value))
            }
            (Opcode::Stobj | Opcode::Stind, Operand::Type(_)) => {
                let (state, [address, v]) = self.pop(state)?;
                Flow::Next(self.set_var(state, &unwrap_address_of(&address), &v)?)
            }

            // Arrays
            (Opcode::Newarr, Operand::Type(t)) => {
                let array = meta
                    .array_of(*t)
                    .ok_or_else(|| self.unsupported(format!("array of {} is not declared", meta.type_name(*t))))?;
                let (state, [length]) = self.pop(state)?;
                let length = self.index_value(&state, &length, ResolveMode::Default)?;
                let n = self.next_id();
                let root = Expr::root_tagged(array, &format!("__arr{n}"), true, true);
                let state = state.write(root.clone(), Expr::new_array(array, length));
                Flow::Next(state.push(root))
            }
            (Opcode::Ldlen, _) => {
                let (state, [array]) = self.pop(state)?;
                let array = self.receiver(&state, &array);
                if self.is_null(&state, &array) {
                    return self.throw_null(state);
                }
                let length = Expr::unary(UnaryOp::ArrayLength, array, TypeId::I32);
                Flow::Next(state.push(self.simplify(&length)))
            }
            (Opcode::Ldelem | Opcode::Ldelema, Operand::Type(t)) => {
                let (state, [array, index]) = self.pop(state)?;
                let array = self.receiver(&state, &array);
                if self.is_null(&state, &array) {
                    return self.throw_null(state);
                }
                let index = self.index_value(&state, &index, ResolveMode::Default)?;
                let ty = self.element_type(&array, *t);
                let location = Expr::index(array, index, ty);
                if opcode == Opcode::Ldelema {
                    Flow::Next(state.push(Expr::address_of(location)))
                } else {
                    let value = self.resolve(&location, &state, ResolveMode::Default);
                    Flow::Next(state.push(value))
                }
            }
            (Opcode::Stelem, Operand::Type(t)) => {
                let (state, [array, index, v]) = self.pop(state)?;
                let array = self.receiver(&state, &array);
                if self.is_null(&state, &array) {
                    return self.throw_null(state);
                }
                let index = self.index_value(&state, &index, ResolveMode::Full)?;
                if !index.is_constant() {
                    return Err(self.unsupported(format!(
                        "element store at symbolic index {}",
                        index.render(meta)
                    )));
                }
                let ty = self.element_type(&array, *t);
                Flow::Next(self.set_var(state, &Expr::index(array, index, ty), &v)?)
            }

            (
                Opcode::Jmp
                | Opcode::Calli
                | Opcode::Endfilter
                | Opcode::Rethrow
                | Opcode::Ckfinite
                | Opcode::ConvI
                | Opcode::ConvU
                | Opcode::ConvOvfI
                | Opcode::ConvOvfU
                | Opcode::ConvOvfIUn
                | Opcode::ConvOvfUUn
                | Opcode::Ldsflda
                | Opcode::Unbox
                | Opcode::Cpobj
                | Opcode::Sizeof
                | Opcode::Localloc
                | Opcode::Cpblk
                | Opcode::Initblk
                | Opcode::Arglist
                | Opcode::Mkrefany
                | Opcode::Refanyval
                | Opcode::Refanytype,
                _,
            ) => return Err(self.unsupported(format!("opcode {}", opcode.mnemonic()))),

            (_, operand) => {
                return Err(self.invalid(format!(
                    "{} with a {:?} operand",
                    opcode.mnemonic(),
                    operand.kind()
                )))
            }
        };
        Ok(flow)
    }

    fn arg_slot(&self, frame: &Frame, index: u16) -> Result<Expr, EngineError> {
        frame
            .arg(index)
            .cloned()
            .ok_or_else(|| self.invalid(format!("no argument {index}")))
    }

    fn local_slot(&self, frame: &Frame, index: u16) -> Result<Expr, EngineError> {
        frame
            .local(index)
            .cloned()
            .ok_or_else(|| self.invalid(format!("no local {index}")))
    }

    /// The terminal state of `ret`: the converted return value alone on the
    /// stack, or an empty stack for `void` methods.
    fn ret(&self, frame: &Frame, state: ExecutionState) -> Result<ExecutionState, EngineError> {
        let meta = self.meta();
        let ret = meta.method(frame.method).ret;
        let depth = state.stack().len();
        if ret == TypeId::VOID {
            if depth != 0 {
                return Err(self.invalid(format!("ret with {depth} values from a void method")));
            }
            return Ok(state);
        }
        match state.stack() {
            [v] => {
                let v = self.resolve(v, &state, ResolveMode::Default);
                let v = self.simplify(&force_convert(meta, &v, ret));
                Ok(state.with_stack(vec![v]))
            }
            _ => Err(self.invalid(format!("ret with {depth} values, expected 1"))),
        }
    }

    /// `castclass` (`throwing`) and `isinst`.
    fn cast(&mut self, state: ExecutionState, v: Expr, target: TypeId, throwing: bool) -> Result<Flow, EngineError> {
        let meta = self.meta();
        let v = self.resolve(&v, &state, ResolveMode::Default);
        if self.is_null(&state, &v) {
            return Ok(Flow::Next(state.push(Expr::null(target))));
        }
        if meta.is_assignable(v.ty(), target) {
            return Ok(Flow::Next(state.push(v)));
        }
        match self.prove_type(&v, &state) {
            Some(runtime) if meta.is_assignable(runtime, target) => {
                let cast = self.simplify(&force_convert(meta, &v, target));
                Ok(Flow::Next(state.push(cast)))
            }
            Some(_) if throwing => {
                let ctor = meta.corlib().invalid_cast_ctor;
                self.throw_new(state, ctor).map(Flow::Return)
            }
            Some(_) => Ok(Flow::Next(state.push(Expr::null(target)))),
            None if throwing => Err(self.unprovable(format!(
                "cast of {} to {}",
                v.render(meta),
                meta.type_name(target)
            ))),
            None => {
                let test = Expr::unary(UnaryOp::TypeAs, v, target);
                Ok(Flow::Next(state.push(self.simplify(&test))))
            }
        }
    }
}
