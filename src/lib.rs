//! Checkpointable byte-code virtual machine for a stack-based managed
//! runtime: it interprets pre-decoded method bodies one instruction at
//! a time, can suspend between any two instructions, and serializes the
//! whole machine state to an opaque byte sequence that later resumes
//! exactly where it left off, mid-method included.

mod checkpoint;
pub mod code;
pub mod error;
pub mod frame;
pub mod insn;
pub mod runtime;
pub mod statics;
pub mod trace;
pub mod types;
pub mod value;

pub use code::{CodeLoader, CodeObject, ExceptionHandler, LineEntry};
pub use error::{Result, VmError};
pub use frame::Frame;
pub use insn::{Const, Insn};
pub use runtime::VirtualMachine;
pub use statics::{DiscardBacking, StaticBacking, StaticState};
pub use trace::{Thrown, TraceElement};
pub use types::{ClassId, FieldRef, MemberRef, ReturnKind};
pub use value::{NativeValue, Value};
