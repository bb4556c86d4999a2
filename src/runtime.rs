//! The virtual machine: fetch-execute loop, static-initialization
//! interception, exception-table search and frame unwinding.
//!
//! A machine executes strictly single-threaded and instruction-granular.
//! The only suspension points are the cycle boundaries exposed through
//! the cycle budget of [`VirtualMachine::run`]; at any such boundary the
//! whole machine can be serialized and later resumed. To keep that
//! sound, every instruction that changes frame contents works on a
//! private copy of the frame, so a snapshot taken a moment earlier
//! still refers to unchanged state.
use std::fmt;
use std::sync::Arc;

use crate::checkpoint;
use crate::code::{global_code, line_for, CodeLoader};
use crate::error::{Result, VmError};
use crate::frame::Frame;
use crate::insn::{Insn, Raised};
use crate::statics::{StaticBacking, StaticState};
use crate::trace::{Thrown, TraceElement};
use crate::types::{ClassId, MemberRef, Type};
use crate::value::Value;

/// One independent interpreter execution context, with its own static
/// storage and initialized-type set.
pub struct VirtualMachine {
    step_number: u64,
    cp: usize,
    frame: Option<Arc<Frame>>,
    result: Option<Value>,
    statics: StaticState,
    // Caller-supplied context appended to every synthesized trace.
    context: Vec<TraceElement>,
    loader: Arc<dyn CodeLoader>,
    probe_enabled: bool,
}

// The loader is a trait object, so this cannot be derived.
impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("step_number", &self.step_number)
            .field("cp", &self.cp)
            .field("active", &self.frame.is_some())
            .field("pointer", &self.pointer())
            .finish_non_exhaustive()
    }
}

impl VirtualMachine {
    /// Builds a machine poised at the first instruction of `member`,
    /// with locals seeded from the receiver (if any) and arguments, and
    /// runs the declaring class's static initializer.
    pub fn create(
        loader: Arc<dyn CodeLoader>,
        member: MemberRef,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Self> {
        let code = global_code(loader.as_ref(), &member)?;
        let params: Vec<Value> = receiver.into_iter().chain(args).collect();
        let class = member.class.clone();
        let mut vm = Self {
            step_number: 0,
            cp: 0,
            frame: Some(Arc::new(Frame::new_bootstrap(member, code, params))),
            result: None,
            statics: StaticState::new(),
            context: Vec::new(),
            loader,
            probe_enabled: true,
        };
        vm.ensure_clinited(&class)?;
        Ok(vm)
    }

    /// Reconstructs a machine from a snapshot produced by
    /// [`VirtualMachine::serialize_to_bytes`], re-binding code through
    /// `loader` and replaying recorded statics into `backing`.
    pub fn resume(
        bytes: &[u8],
        loader: Arc<dyn CodeLoader>,
        backing: &mut dyn StaticBacking,
    ) -> Result<Self> {
        checkpoint::resume(bytes, loader, backing)
    }

    /// Base64 variant of [`VirtualMachine::resume`].
    pub fn resume_from_string(
        encoded: &str,
        loader: Arc<dyn CodeLoader>,
        backing: &mut dyn StaticBacking,
    ) -> Result<Self> {
        checkpoint::resume_from_string(encoded, loader, backing)
    }

    /// Executes until the machine terminates or a failure propagates.
    pub fn run_to_completion(&mut self) -> Result<()> {
        self.run(-1)
    }

    /// Executes a single instruction.
    pub fn step(&mut self) -> Result<()> {
        self.run(1)
    }

    /// Executes up to `cycles` instructions, unbounded when `cycles` is
    /// negative. A cycle whose failure is caught by an in-program
    /// handler consumes neither budget nor a step.
    pub fn run(&mut self, mut cycles: i64) -> Result<()> {
        while let Some(frame) = self.frame.clone() {
            let insn = frame.code().insn(self.cp)?.clone();
            self.cp += 1;

            // A type's initializer runs the first time the type is
            // actively used, before that use is observed, once per
            // machine. Roll back and re-fetch after it completes.
            if let Some(class) = insn.class_for_clinit() {
                if !self.statics.is_clinited(class) {
                    self.cp -= 1;
                    let class = class.clone();
                    self.ensure_clinited(&class)?;
                    continue;
                }
            }

            match insn.execute(self) {
                Ok(()) => {
                    if self.probe_enabled {
                        self.probe_serializable()?;
                    }
                    self.step_number += 1;
                }
                Err(Raised::Fatal(e)) => return Err(e),
                Err(Raised::Thrown(mut thrown)) => {
                    self.fill_in_stack_trace(&mut thrown);
                    if !self.find_handler(&thrown) {
                        return Err(VmError::Uncaught(thrown));
                    }
                    continue;
                }
            }

            if cycles > 0 {
                cycles -= 1;
            }
            if cycles == 0 {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Whether the machine still has a frame to execute. Inactive means
    /// terminated; the result slot is meaningful only then.
    pub fn is_active(&self) -> bool {
        self.frame.is_some()
    }

    /// Value returned by the outermost frame, `None` for void returns
    /// or while the machine is still active.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn step_number(&self) -> u64 {
        self.step_number
    }

    /// Trace context decorating every failure surfaced by this machine.
    pub fn set_context(&mut self, context: Vec<TraceElement>) {
        self.context = context;
    }

    /// Gates the per-step serializability probe. Default on; disabling
    /// it only defers non-persistable-value detection to an explicit
    /// serialization, never changes results.
    pub fn set_probe_enabled(&mut self, enabled: bool) {
        self.probe_enabled = enabled;
    }

    pub fn probe_enabled(&self) -> bool {
        self.probe_enabled
    }

    /// Snapshot of the full machine state as an opaque byte sequence.
    pub fn serialize_to_bytes(&self) -> Result<Vec<u8>> {
        checkpoint::serialize(self)
    }

    /// Printable transport form of [`VirtualMachine::serialize_to_bytes`].
    pub fn serialize_to_string(&self) -> Result<String> {
        checkpoint::serialize_to_string(self)
    }

    /// Where the machine currently points, for diagnostics.
    pub fn pointer(&self) -> Option<TraceElement> {
        let frame = self.frame.as_ref()?;
        let code = frame.code();
        Some(TraceElement::new(
            frame.member().class.clone(),
            frame.member().name.clone(),
            code.source.clone(),
            line_for(&code.lines, self.cp),
        ))
    }

    /// True when the next instruction is a return compatible with
    /// `return_type` and no handler range covers the current pc.
    pub fn in_tail_position(&self, return_type: &Type) -> bool {
        let Some(frame) = self.frame.as_ref() else {
            return false;
        };
        let code = frame.code();
        if code.excpts.iter().any(|h| h.covers(self.cp)) {
            return false;
        }
        matches!(
            code.insns.get(self.cp),
            Some(Insn::Return(kind)) if kind.can_return(return_type)
        )
    }

    pub fn frame(&self) -> Option<&Arc<Frame>> {
        self.frame.as_ref()
    }

    pub fn statics(&self) -> &StaticState {
        &self.statics
    }

    pub(crate) fn statics_mut(&mut self) -> &mut StaticState {
        &mut self.statics
    }

    pub(crate) fn loader(&self) -> &Arc<dyn CodeLoader> {
        &self.loader
    }

    pub(crate) fn cp(&self) -> usize {
        self.cp
    }

    pub(crate) fn set_cp(&mut self, cp: usize) {
        self.cp = cp;
    }

    pub(crate) fn context(&self) -> &[TraceElement] {
        &self.context
    }

    pub(crate) fn current_frame(&self) -> Result<&Arc<Frame>> {
        self.frame
            .as_ref()
            .ok_or_else(|| VmError::State("machine is inactive".into()))
    }

    /// Applies a mutation to a private copy of the current frame and
    /// installs the copy.
    pub(crate) fn mutate_frame<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Frame) -> Result<()>,
    {
        let mut copy = self.current_frame()?.mutable_copy();
        mutate(&mut copy)?;
        self.frame = Some(Arc::new(copy));
        Ok(())
    }

    pub(crate) fn install_frame(&mut self, frame: Frame) {
        self.frame = Some(Arc::new(frame));
    }

    /// Outermost return: publish the result and deactivate.
    pub(crate) fn finish(&mut self, result: Option<Value>) {
        self.result = result;
        self.frame = None;
    }

    pub(crate) fn from_parts(
        loader: Arc<dyn CodeLoader>,
        cp: usize,
        frame: Option<Arc<Frame>>,
        statics: StaticState,
        step_number: u64,
        context: Vec<TraceElement>,
        probe_enabled: bool,
    ) -> Self {
        Self {
            step_number,
            cp,
            frame,
            result: None,
            statics,
            context,
            loader,
            probe_enabled,
        }
    }

    /// Runs `class`'s static initializer as a nested sub-execution of
    /// this same loop, to completion, inside the current cycle. The
    /// class is marked first so self-referential initializers do not
    /// recurse.
    fn ensure_clinited(&mut self, class: &ClassId) -> Result<()> {
        if self.statics.is_clinited(class) {
            return Ok(());
        }
        self.statics.mark_clinited(class.clone());
        let Some(code) = self.loader.clinit(class) else {
            return Ok(());
        };
        let saved_cp = self.cp;
        let saved_frame = self.frame.take();
        let saved_result = self.result.take();
        self.frame = Some(Arc::new(Frame::new_bootstrap(
            MemberRef::clinit(class),
            code,
            Vec::new(),
        )));
        self.cp = 0;
        let outcome = self.run(-1);
        // Restore the triggering frame even when the initializer fails,
        // so the machine is not left pointing into the dropped nested
        // sub-execution.
        self.cp = saved_cp;
        self.frame = saved_frame;
        self.result = saved_result;
        outcome
    }

    /// Transient full-state serialization after every instruction. A
    /// non-persistable reachable value is fatal, attributed to the
    /// instruction that just produced it; every other outcome is
    /// ignored because the probe never persists anything.
    fn probe_serializable(&self) -> Result<()> {
        match checkpoint::probe(self) {
            Err(VmError::NotPersistable { type_name, .. }) => {
                let at = self
                    .pointer()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "<inactive>".into());
                Err(VmError::NotPersistable { type_name, at })
            }
            _ => Ok(()),
        }
    }

    /// Exception-table search over the frame chain. On a match the
    /// handler frame's stack is cleared down to the failure object and
    /// execution resumes at the handler address; otherwise the chain is
    /// unwound through caller resume addresses. Returns false when the
    /// chain is exhausted, leaving the machine inactive.
    fn find_handler(&mut self, thrown: &Thrown) -> bool {
        while let Some(frame) = self.frame.clone() {
            for handler in &frame.code().excpts {
                let accepts = handler.class.as_ref().map_or(true, |cls| {
                    self.loader.is_assignable(&thrown.class, cls)
                });
                if handler.covers(self.cp) && accepts {
                    let mut copy = frame.mutable_copy();
                    copy.pop_all();
                    copy.push(thrown.value.clone());
                    self.cp = handler.handler;
                    self.frame = Some(Arc::new(copy));
                    return true;
                }
            }
            self.cp = frame.ret();
            self.frame = frame.parent().cloned();
        }
        false
    }

    /// Synthesizes the failure's trace by walking the frame chain
    /// innermost-first, then appending the caller-supplied context.
    /// Entries already present (e.g. from a native call) stay in front.
    fn fill_in_stack_trace(&self, thrown: &mut Thrown) {
        let mut cp = self.cp;
        let mut frame = self.frame.clone();
        while let Some(f) = frame {
            let code = f.code();
            thrown.trace.push(TraceElement::new(
                f.member().class.clone(),
                f.member().name.clone(),
                code.source.clone(),
                line_for(&code.lines, cp),
            ));
            cp = f.ret();
            frame = f.parent().cloned();
        }
        thrown.trace.extend(self.context.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeObject;
    use crate::insn::Const;
    use crate::types::{parse_method_types, ReturnKind};
    use std::collections::HashMap;

    struct MapLoader {
        methods: HashMap<MemberRef, Arc<CodeObject>>,
    }

    impl CodeLoader for MapLoader {
        fn load(&self, member: &MemberRef) -> Result<Arc<CodeObject>> {
            self.methods.get(member).cloned().ok_or_else(|| {
                VmError::Resolution(member.to_string())
            })
        }

        fn clinit(&self, class: &ClassId) -> Option<Arc<CodeObject>> {
            self.methods.get(&MemberRef::clinit(class)).cloned()
        }
    }

    fn single_method(
        member: MemberRef,
        insns: Vec<Insn>,
    ) -> (Arc<dyn CodeLoader>, MemberRef) {
        let code = Arc::new(CodeObject::new(
            0,
            insns,
            Vec::new(),
            Vec::new(),
            4,
            "T.java",
        ));
        let mut methods = HashMap::new();
        methods.insert(member.clone(), code);
        (Arc::new(MapLoader { methods }), member)
    }

    #[test]
    fn constant_return_produces_result_and_deactivates() {
        let member = MemberRef::new(
            ClassId::new("rt.unit.ConstRet"),
            "f",
            "()I",
        );
        let (loader, member) = single_method(
            member,
            vec![Insn::Ldc(Const::Int(41)), Insn::Return(ReturnKind::Int)],
        );
        let mut vm =
            VirtualMachine::create(loader, member, None, Vec::new()).unwrap();
        assert!(vm.is_active());
        vm.run_to_completion().unwrap();
        assert!(!vm.is_active());
        assert_eq!(vm.result(), Some(&Value::Int(41)));
        assert_eq!(vm.step_number(), 2);
    }

    #[test]
    fn cycle_budget_suspends_between_instructions() {
        let member = MemberRef::new(
            ClassId::new("rt.unit.Budget"),
            "f",
            "()I",
        );
        let (loader, member) = single_method(
            member,
            vec![
                Insn::Ldc(Const::Int(1)),
                Insn::Ldc(Const::Int(2)),
                Insn::IAdd,
                Insn::Return(ReturnKind::Int),
            ],
        );
        let mut vm =
            VirtualMachine::create(loader, member, None, Vec::new()).unwrap();
        vm.step().unwrap();
        assert_eq!(vm.step_number(), 1);
        assert!(vm.is_active());
        vm.run(2).unwrap();
        assert_eq!(vm.step_number(), 3);
        assert!(vm.is_active());
        vm.run_to_completion().unwrap();
        assert_eq!(vm.result(), Some(&Value::Int(3)));
        // Running an inactive machine is a no-op.
        vm.run_to_completion().unwrap();
        assert_eq!(vm.step_number(), 4);
    }

    #[test]
    fn tail_position_reflects_next_instruction_and_handlers() {
        let member = MemberRef::new(
            ClassId::new("rt.unit.Tail"),
            "f",
            "()I",
        );
        let (loader, member) = single_method(
            member,
            vec![Insn::Ldc(Const::Int(0)), Insn::Return(ReturnKind::Int)],
        );
        let mut vm =
            VirtualMachine::create(loader, member, None, Vec::new()).unwrap();
        let (_, int_ty) = parse_method_types("()I").unwrap();
        let (_, long_ty) = parse_method_types("()J").unwrap();
        assert!(!vm.in_tail_position(&int_ty));
        vm.step().unwrap();
        assert!(vm.in_tail_position(&int_ty));
        assert!(!vm.in_tail_position(&long_ty));
    }
}
