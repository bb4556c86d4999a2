//! Call-stack activations with copy-on-write mutation discipline.
use std::sync::Arc;

use crate::code::CodeObject;
use crate::error::{Result, VmError};
use crate::types::MemberRef;
use crate::value::Value;

/// One call-stack activation: operand stack, local slots, a non-owning
/// back-link to the caller and the caller's resume program counter.
///
/// A frame that may already be part of an externally observed snapshot
/// is never mutated in place: instructions clone it via [`Frame::
/// mutable_copy`] and install the copy as the machine's current frame.
/// Parents are shared through `Arc` so the copy is cheap and the prior
/// chain stays intact.
#[derive(Debug, Clone)]
pub struct Frame {
    stack: Vec<Value>,
    locals: Vec<Value>,
    parent: Option<Arc<Frame>>,
    ret: usize,
    member: MemberRef,
    code: Arc<CodeObject>,
}

impl Frame {
    /// Outermost frame of a machine: no parent, locals seeded from the
    /// call arguments (receiver first for instance members).
    pub fn new_bootstrap(
        member: MemberRef,
        code: Arc<CodeObject>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            stack: Vec::with_capacity(code.stack_size),
            locals: params,
            parent: None,
            ret: 0,
            member,
            code,
        }
    }

    /// Frame entered by a call instruction. Records the caller's resume
    /// pc and links back to the caller.
    pub fn new_call(
        member: MemberRef,
        code: Arc<CodeObject>,
        params: Vec<Value>,
        parent: Arc<Frame>,
        ret: usize,
    ) -> Self {
        Self {
            stack: Vec::with_capacity(code.stack_size),
            locals: params,
            parent: Some(parent),
            ret,
            member,
            code,
        }
    }

    /// Rebuilds a frame from its persisted image at resume.
    pub(crate) fn from_saved(
        member: MemberRef,
        code: Arc<CodeObject>,
        stack: Vec<Value>,
        locals: Vec<Value>,
        parent: Option<Arc<Frame>>,
        ret: usize,
    ) -> Self {
        Self {
            stack,
            locals,
            parent,
            ret,
            member,
            code,
        }
    }

    /// Private mutable copy of a possibly-snapshotted frame.
    pub fn mutable_copy(self: &Arc<Self>) -> Frame {
        (**self).clone()
    }

    pub fn parent(&self) -> Option<&Arc<Frame>> {
        self.parent.as_ref()
    }

    pub fn ret(&self) -> usize {
        self.ret
    }

    pub fn member(&self) -> &MemberRef {
        &self.member
    }

    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn locals(&self) -> &[Value] {
        &self.locals
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| {
            VmError::State(format!("operand stack underflow in {}", self.member))
        })
    }

    pub fn pop_int(&mut self) -> Result<i32> {
        match self.pop()? {
            Value::Int(i) => Ok(i),
            other => Err(VmError::State(format!(
                "expected int on stack in {}, found {other:?}",
                self.member
            ))),
        }
    }

    /// Discards every value on the operand stack. Only exception-handler
    /// dispatch does this.
    pub fn pop_all(&mut self) {
        self.stack.clear();
    }

    pub fn load(&self, slot: usize) -> Value {
        self.locals.get(slot).cloned().unwrap_or(Value::Null)
    }

    pub fn store(&mut self, slot: usize, value: Value) {
        if slot >= self.locals.len() {
            self.locals.resize(slot + 1, Value::Null);
        }
        self.locals[slot] = value;
    }

    /// Depth of the chain rooted at this frame, the bootstrap frame
    /// counting as one.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut frame = self.parent.as_deref();
        while let Some(f) = frame {
            depth += 1;
            frame = f.parent.as_deref();
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeObject;
    use crate::types::ClassId;

    fn empty_code() -> Arc<CodeObject> {
        Arc::new(CodeObject::new(0, Vec::new(), Vec::new(), Vec::new(), 4, "T.java"))
    }

    fn member() -> MemberRef {
        MemberRef::new(ClassId::new("T"), "m", "()V")
    }

    #[test]
    fn bootstrap_frame_seeds_locals_from_params() {
        let f = Frame::new_bootstrap(
            member(),
            empty_code(),
            vec![Value::Int(7), Value::string("x")],
        );
        assert_eq!(f.load(0), Value::Int(7));
        assert_eq!(f.load(1), Value::string("x"));
        assert_eq!(f.load(5), Value::Null);
        assert_eq!(f.depth(), 1);
    }

    #[test]
    fn push_pop_round_trip_and_underflow() {
        let mut f = Frame::new_bootstrap(member(), empty_code(), Vec::new());
        f.push(Value::Int(1));
        f.push(Value::Int(2));
        assert_eq!(f.pop_int().unwrap(), 2);
        assert_eq!(f.pop_int().unwrap(), 1);
        assert!(f.pop().is_err());
    }

    #[test]
    fn store_grows_local_slots() {
        let mut f = Frame::new_bootstrap(member(), empty_code(), Vec::new());
        f.store(3, Value::Long(9));
        assert_eq!(f.load(3), Value::Long(9));
        assert_eq!(f.load(0), Value::Null);
    }

    #[test]
    fn mutable_copy_leaves_original_untouched() {
        let mut base = Frame::new_bootstrap(member(), empty_code(), Vec::new());
        base.push(Value::Int(1));
        let shared = Arc::new(base);
        let mut copy = shared.mutable_copy();
        copy.push(Value::Int(2));
        assert_eq!(shared.stack().len(), 1);
        assert_eq!(copy.stack().len(), 2);
    }

    #[test]
    fn call_frames_chain_to_their_caller() {
        let outer =
            Arc::new(Frame::new_bootstrap(member(), empty_code(), Vec::new()));
        let inner = Frame::new_call(
            member(),
            empty_code(),
            vec![Value::Int(1)],
            outer.clone(),
            5,
        );
        assert_eq!(inner.ret(), 5);
        assert_eq!(inner.depth(), 2);
        assert!(Arc::ptr_eq(inner.parent().unwrap(), &outer));
    }
}
