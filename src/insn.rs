//! The closed instruction set and its execution contract.
//!
//! Every opcode family is one enum case executing against the whole
//! machine state: it may replace the current frame (calls, returns),
//! mutate stack or locals through a copy-on-write frame clone, or raise
//! a failure. Families that observably require a class to be
//! initialized declare it through [`Insn::class_for_clinit`] and the
//! loop intercepts them before execution.
use std::sync::Arc;

use crate::code::global_code;
use crate::error::{Result, VmError};
use crate::frame::Frame;
use crate::runtime::VirtualMachine;
use crate::trace::Thrown;
use crate::types::{self, ClassId, FieldRef, MemberRef, ReturnKind};
use crate::value::Value;

/// A failure raised while executing one instruction. Thrown failures
/// are subject to exception-table recovery; fatal ones abort the run.
#[derive(Debug)]
pub(crate) enum Raised {
    Thrown(Thrown),
    Fatal(VmError),
}

impl From<VmError> for Raised {
    fn from(e: VmError) -> Self {
        Self::Fatal(e)
    }
}

/// A loadable constant, one case per constant category.
#[derive(Debug, Clone)]
pub enum Const {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(Arc<str>),
    Class(ClassId),
}

impl Const {
    pub fn string(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Int(i) => Value::Int(*i),
            Self::Long(l) => Value::Long(*l),
            Self::Float(f) => Value::Float(*f),
            Self::Double(d) => Value::Double(*d),
            Self::Str(s) => Value::Str(s.clone()),
            Self::Class(c) => Value::Class(c.clone()),
        }
    }
}

/// One instruction of a code object.
#[derive(Debug, Clone)]
pub enum Insn {
    Nop,
    /// Push a constant.
    Ldc(Const),
    /// Push the value of a local slot.
    Load(usize),
    /// Pop into a local slot.
    Store(usize),
    IAdd,
    ISub,
    Goto(usize),
    /// Pop an int, branch when it is zero.
    IfEq(usize),
    GetStatic(FieldRef),
    PutStatic(FieldRef),
    InvokeStatic(MemberRef),
    /// Delegate to a host-native member through the loader.
    NativeCall(MemberRef),
    /// Pop a value and raise it as a program-level failure.
    Throw,
    Return(ReturnKind),
}

impl Insn {
    /// Class whose static initializer must have run before this
    /// instruction's effect is observable, per the required-timing rule
    /// for active use of a type.
    pub fn class_for_clinit(&self) -> Option<&ClassId> {
        match self {
            Self::GetStatic(f) | Self::PutStatic(f) => Some(&f.class),
            Self::InvokeStatic(m) | Self::NativeCall(m) => Some(&m.class),
            _ => None,
        }
    }

    pub(crate) fn execute(
        &self,
        vm: &mut VirtualMachine,
    ) -> std::result::Result<(), Raised> {
        match self {
            Self::Nop => Ok(()),
            Self::Ldc(c) => {
                let value = c.to_value();
                vm.mutate_frame(|f| {
                    f.push(value);
                    Ok(())
                })?;
                Ok(())
            }
            Self::Load(slot) => {
                let slot = *slot;
                vm.mutate_frame(|f| {
                    let v = f.load(slot);
                    f.push(v);
                    Ok(())
                })?;
                Ok(())
            }
            Self::Store(slot) => {
                let slot = *slot;
                vm.mutate_frame(|f| {
                    let v = f.pop()?;
                    f.store(slot, v);
                    Ok(())
                })?;
                Ok(())
            }
            Self::IAdd => {
                vm.mutate_frame(|f| {
                    let b = f.pop_int()?;
                    let a = f.pop_int()?;
                    f.push(Value::Int(a.wrapping_add(b)));
                    Ok(())
                })?;
                Ok(())
            }
            Self::ISub => {
                vm.mutate_frame(|f| {
                    let b = f.pop_int()?;
                    let a = f.pop_int()?;
                    f.push(Value::Int(a.wrapping_sub(b)));
                    Ok(())
                })?;
                Ok(())
            }
            Self::Goto(target) => {
                vm.set_cp(*target);
                Ok(())
            }
            Self::IfEq(target) => {
                let mut taken = false;
                let target = *target;
                vm.mutate_frame(|f| {
                    taken = f.pop_int()? == 0;
                    Ok(())
                })?;
                if taken {
                    vm.set_cp(target);
                }
                Ok(())
            }
            Self::GetStatic(field) => {
                let value = vm
                    .statics()
                    .get(field)
                    .cloned()
                    .unwrap_or(Value::Null);
                vm.mutate_frame(|f| {
                    f.push(value);
                    Ok(())
                })?;
                Ok(())
            }
            Self::PutStatic(field) => {
                let mut value = Value::Null;
                vm.mutate_frame(|f| {
                    value = f.pop()?;
                    Ok(())
                })?;
                vm.statics_mut().set(field.clone(), value);
                Ok(())
            }
            Self::InvokeStatic(member) => execute_invoke(vm, member),
            Self::NativeCall(member) => execute_native(vm, member),
            Self::Throw => {
                let mut value = Value::Null;
                vm.mutate_frame(|f| {
                    value = f.pop()?;
                    Ok(())
                })?;
                let thrown = match value {
                    Value::Null => Thrown::new(
                        ClassId::new("java.lang.NullPointerException"),
                        Value::Null,
                    ),
                    v => Thrown::from_value(v),
                };
                Err(Raised::Thrown(thrown))
            }
            Self::Return(kind) => execute_return(vm, *kind),
        }
    }
}

/// Pops `argc` values off a frame, restoring call order.
fn pop_args(frame: &mut Frame, argc: usize) -> Result<Vec<Value>> {
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(frame.pop()?);
    }
    args.reverse();
    Ok(args)
}

fn execute_invoke(
    vm: &mut VirtualMachine,
    member: &MemberRef,
) -> std::result::Result<(), Raised> {
    let argc = types::arg_count(&member.descriptor)?;
    let code = global_code(vm.loader().as_ref(), member)?;
    let caller = vm.current_frame()?.clone();
    let mut caller_copy = caller.mutable_copy();
    let args = pop_args(&mut caller_copy, argc)?;
    let callee = Frame::new_call(
        member.clone(),
        code,
        args,
        Arc::new(caller_copy),
        vm.cp(),
    );
    vm.install_frame(callee);
    vm.set_cp(0);
    Ok(())
}

fn execute_native(
    vm: &mut VirtualMachine,
    member: &MemberRef,
) -> std::result::Result<(), Raised> {
    let argc = types::arg_count(&member.descriptor)?;
    let returns = types::return_kind(&member.descriptor)? != ReturnKind::Void;
    let mut args = Vec::new();
    vm.mutate_frame(|f| {
        args = pop_args(f, argc)?;
        Ok(())
    })?;
    match vm.loader().native_call(member, args) {
        Ok(value) => {
            if returns {
                vm.mutate_frame(|f| {
                    f.push(value);
                    Ok(())
                })?;
            }
            Ok(())
        }
        Err(thrown) => Err(Raised::Thrown(thrown)),
    }
}

fn check_return_value(
    kind: ReturnKind,
    value: Value,
    member: &MemberRef,
) -> Result<Value> {
    let compatible = matches!(
        (kind, &value),
        (ReturnKind::Int, Value::Int(_))
            | (ReturnKind::Long, Value::Long(_))
            | (ReturnKind::Float, Value::Float(_))
            | (ReturnKind::Double, Value::Double(_))
            | (
                ReturnKind::Reference,
                Value::Null
                    | Value::Str(_)
                    | Value::Class(_)
                    | Value::Native(_)
            )
    );
    if compatible {
        Ok(value)
    } else {
        Err(VmError::State(format!(
            "{kind:?} return with {value:?} on stack in {member}"
        )))
    }
}

fn execute_return(
    vm: &mut VirtualMachine,
    kind: ReturnKind,
) -> std::result::Result<(), Raised> {
    let frame = vm.current_frame()?.clone();
    let value = if kind == ReturnKind::Void {
        None
    } else {
        let top = frame.stack().last().cloned().ok_or_else(|| {
            VmError::State(format!(
                "return from {} with empty stack",
                frame.member()
            ))
        })?;
        Some(check_return_value(kind, top, frame.member())?)
    };
    vm.set_cp(frame.ret());
    match frame.parent() {
        Some(parent) => {
            let mut parent_copy = parent.mutable_copy();
            if let Some(v) = value {
                parent_copy.push(v);
            }
            vm.install_frame(parent_copy);
        }
        None => {
            vm.finish(value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clinit_classes_are_declared_by_static_access_and_invoke() {
        let cls = ClassId::new("T");
        let get = Insn::GetStatic(FieldRef::new(cls.clone(), "x"));
        let put = Insn::PutStatic(FieldRef::new(cls.clone(), "x"));
        let inv = Insn::InvokeStatic(MemberRef::new(cls.clone(), "m", "()V"));
        assert_eq!(get.class_for_clinit(), Some(&cls));
        assert_eq!(put.class_for_clinit(), Some(&cls));
        assert_eq!(inv.class_for_clinit(), Some(&cls));
        assert_eq!(Insn::Nop.class_for_clinit(), None);
        assert_eq!(Insn::Ldc(Const::Int(1)).class_for_clinit(), None);
    }

    #[test]
    fn return_value_category_is_checked() {
        let m = MemberRef::new(ClassId::new("T"), "m", "()I");
        assert!(check_return_value(ReturnKind::Int, Value::Int(1), &m).is_ok());
        assert!(
            check_return_value(ReturnKind::Int, Value::Long(1), &m).is_err()
        );
        assert!(
            check_return_value(ReturnKind::Reference, Value::Null, &m).is_ok()
        );
        assert!(check_return_value(
            ReturnKind::Reference,
            Value::string("s"),
            &m
        )
        .is_ok());
        assert!(
            check_return_value(ReturnKind::Double, Value::Int(0), &m).is_err()
        );
    }
}
