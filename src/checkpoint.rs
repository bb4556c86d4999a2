//! Checkpoint subsystem: serializes the whole machine state to an
//! opaque byte sequence and reconstructs a running machine from one.
//!
//! The persisted form is an owned mirror of the live state: frames
//! carry their member identity instead of their code object, and every
//! operand is converted to [`PValue`]. Conversion fails eagerly on the
//! first value the format cannot represent, naming its type; nothing is
//! ever silently dropped. The payload is bincode, framed by a
//! big-endian magic word and a format version.
use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::code::{global_code, CodeLoader};
use crate::error::{Result, VmError};
use crate::frame::Frame;
use crate::runtime::VirtualMachine;
use crate::statics::{StaticBacking, StaticState};
use crate::trace::TraceElement;
use crate::types::{ClassId, FieldRef, MemberRef};
use crate::value::Value;

const MAGIC: u32 = 0xCAFE_D00D;
const VERSION: u16 = 1;

/// Persistable mirror of [`Value`]. Native values have no case here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum PValue {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Class(ClassId),
}

fn persist(value: &Value) -> Result<PValue> {
    Ok(match value {
        Value::Null => PValue::Null,
        Value::Int(i) => PValue::Int(*i),
        Value::Long(l) => PValue::Long(*l),
        Value::Float(f) => PValue::Float(*f),
        Value::Double(d) => PValue::Double(*d),
        Value::Str(s) => PValue::Str(s.to_string()),
        Value::Class(c) => PValue::Class(c.clone()),
        Value::Native(_) => {
            return Err(VmError::NotPersistable {
                type_name: value.class_id().to_string(),
                at: String::new(),
            })
        }
    })
}

fn revive(value: PValue) -> Value {
    match value {
        PValue::Null => Value::Null,
        PValue::Int(i) => Value::Int(i),
        PValue::Long(l) => Value::Long(l),
        PValue::Float(f) => Value::Float(f),
        PValue::Double(d) => Value::Double(d),
        PValue::Str(s) => Value::string(&s),
        PValue::Class(c) => Value::Class(c),
    }
}

/// One frame of the chain. Code objects are referenced through the
/// member identity and re-resolved at resume, never duplicated.
#[derive(Debug, Serialize, Deserialize)]
struct FrameImage {
    stack: Vec<PValue>,
    locals: Vec<PValue>,
    member: MemberRef,
    ret: usize,
}

/// Full machine state. Frames are stored innermost-first.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    cp: usize,
    frames: Vec<FrameImage>,
    statics: Vec<(FieldRef, PValue)>,
    clinited: Vec<ClassId>,
    step_number: u64,
    context: Vec<TraceElement>,
    probe_enabled: bool,
}

fn snapshot(vm: &VirtualMachine) -> Result<Snapshot> {
    let mut frames = Vec::new();
    let mut frame = vm.frame().cloned();
    while let Some(f) = frame {
        frames.push(FrameImage {
            stack: f.stack().iter().map(persist).collect::<Result<_>>()?,
            locals: f.locals().iter().map(persist).collect::<Result<_>>()?,
            member: f.member().clone(),
            ret: f.ret(),
        });
        frame = f.parent().cloned();
    }
    let statics = vm
        .statics()
        .values()
        .iter()
        .map(|(field, value)| Ok((field.clone(), persist(value)?)))
        .collect::<Result<_>>()?;
    // The initialized set has no meaningful order; sort it so equal
    // states serialize to equal bytes.
    let mut clinited: Vec<ClassId> =
        vm.statics().clinited().cloned().collect();
    clinited.sort();
    Ok(Snapshot {
        cp: vm.cp(),
        frames,
        statics,
        clinited,
        step_number: vm.step_number(),
        context: vm.context().to_vec(),
        probe_enabled: vm.probe_enabled(),
    })
}

/// The per-cycle validity probe: builds and encodes a transient
/// snapshot, persisting nothing. Only a non-persistable value is a
/// meaningful outcome for the caller.
pub(crate) fn probe(vm: &VirtualMachine) -> Result<()> {
    let snap = snapshot(vm)?;
    let _ = bincode::serialize(&snap);
    Ok(())
}

pub(crate) fn serialize(vm: &VirtualMachine) -> Result<Vec<u8>> {
    let snap = snapshot(vm)?;
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(MAGIC)
        .map_err(|e| VmError::Snapshot(e.to_string()))?;
    buf.write_u16::<BigEndian>(VERSION)
        .map_err(|e| VmError::Snapshot(e.to_string()))?;
    bincode::serialize_into(&mut buf, &snap)
        .map_err(|e| VmError::Snapshot(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn serialize_to_string(vm: &VirtualMachine) -> Result<String> {
    Ok(STANDARD.encode(serialize(vm)?))
}

pub(crate) fn resume(
    bytes: &[u8],
    loader: Arc<dyn CodeLoader>,
    backing: &mut dyn StaticBacking,
) -> Result<VirtualMachine> {
    let mut reader = bytes;
    let magic = reader
        .read_u32::<BigEndian>()
        .map_err(|e| VmError::Snapshot(e.to_string()))?;
    if magic != MAGIC {
        return Err(VmError::Snapshot(format!(
            "bad magic 0x{magic:08x}"
        )));
    }
    let version = reader
        .read_u16::<BigEndian>()
        .map_err(|e| VmError::Snapshot(e.to_string()))?;
    if version != VERSION {
        return Err(VmError::Snapshot(format!(
            "snapshot format v{version}, runtime supports v{VERSION}"
        )));
    }
    let snap: Snapshot = bincode::deserialize(reader)
        .map_err(|e| VmError::Snapshot(e.to_string()))?;

    // Rebuild the chain outermost-first so each frame can link to its
    // already-reconstructed parent.
    let mut chain: Option<Arc<Frame>> = None;
    for image in snap.frames.into_iter().rev() {
        let code = global_code(loader.as_ref(), &image.member)?;
        let frame = Frame::from_saved(
            image.member,
            code,
            image.stack.into_iter().map(revive).collect(),
            image.locals.into_iter().map(revive).collect(),
            chain.take(),
            image.ret,
        );
        chain = Some(Arc::new(frame));
    }

    let values: Vec<(FieldRef, Value)> = snap
        .statics
        .into_iter()
        .map(|(field, value)| (field, revive(value)))
        .collect();
    // Natively executed code must observe the same statics the
    // interpreter believes are current; replay them into the real
    // backing storage before handing the machine back.
    for (field, value) in &values {
        backing.restore(field, value).map_err(|reason| {
            VmError::StaticRestore {
                field: field.clone(),
                reason,
            }
        })?;
    }
    let clinited: HashSet<ClassId> = snap.clinited.into_iter().collect();
    let statics = StaticState::from_parts(values, clinited);

    Ok(VirtualMachine::from_parts(
        loader,
        snap.cp,
        chain,
        statics,
        snap.step_number,
        snap.context,
        snap.probe_enabled,
    ))
}

pub(crate) fn resume_from_string(
    encoded: &str,
    loader: Arc<dyn CodeLoader>,
    backing: &mut dyn StaticBacking,
) -> Result<VirtualMachine> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| VmError::Snapshot(e.to_string()))?;
    resume(&bytes, loader, backing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statics::DiscardBacking;
    use crate::value::NativeValue;

    struct NoLoader;

    impl CodeLoader for NoLoader {
        fn load(
            &self,
            member: &MemberRef,
        ) -> Result<Arc<crate::code::CodeObject>> {
            Err(VmError::Resolution(member.to_string()))
        }

        fn clinit(
            &self,
            _class: &ClassId,
        ) -> Option<Arc<crate::code::CodeObject>> {
            None
        }
    }

    #[test]
    fn persist_revive_round_trip() {
        for v in [
            Value::Null,
            Value::Int(-7),
            Value::Long(1 << 40),
            Value::Float(0.5),
            Value::Double(-2.25),
            Value::string("snapshot"),
            Value::Class(ClassId::new("com.example.Main")),
        ] {
            assert_eq!(revive(persist(&v).unwrap()), v);
        }
    }

    #[test]
    fn persist_names_the_offending_type() {
        let v = Value::Native(NativeValue::new(
            ClassId::new("java.net.Socket"),
            Arc::new(0_u8),
        ));
        match persist(&v) {
            Err(VmError::NotPersistable { type_name, .. }) => {
                assert_eq!(type_name, "java.net.Socket");
            }
            other => panic!("expected NotPersistable, got {other:?}"),
        }
    }

    #[test]
    fn resume_rejects_bad_magic_and_version() {
        let mut backing = DiscardBacking;
        let err = resume(&[0, 0, 0, 0, 0, 1], Arc::new(NoLoader), &mut backing)
            .unwrap_err();
        assert!(matches!(err, VmError::Snapshot(_)));

        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(MAGIC).unwrap();
        buf.write_u16::<BigEndian>(VERSION + 1).unwrap();
        let err = resume(&buf, Arc::new(NoLoader), &mut backing).unwrap_err();
        assert!(matches!(err, VmError::Snapshot(_)));

        let err = resume(&[1], Arc::new(NoLoader), &mut backing).unwrap_err();
        assert!(matches!(err, VmError::Snapshot(_)));
    }
}
