//! Failure taxonomy of the virtual machine.
use thiserror::Error;

use crate::trace::Thrown;
use crate::types::FieldRef;

pub type Result<T> = std::result::Result<T, VmError>;

/// `VmError` represents the possible failures a `run`/`step`/`resume`
/// call can surface to the embedder. Only `Uncaught` originates from
/// program logic; everything else aborts the call outright and is never
/// subject to in-machine handler recovery.
#[derive(Debug, Error)]
pub enum VmError {
    /// A failure thrown by interpreted code with no matching handler
    /// anywhere up the frame chain. Carries the synthesized trace.
    #[error("uncaught exception: {0}")]
    Uncaught(Thrown),

    /// The per-step validity probe found a value the checkpoint format
    /// cannot capture. Attributed to the instruction that produced it.
    #[error("instance of non-persistable class [{type_name}] at {at}")]
    NotPersistable { type_name: String, at: String },

    /// A method, constructor or class could not be found or bound.
    #[error("cannot resolve {0}")]
    Resolution(String),

    /// Resume-time failure writing a recorded static value back into
    /// its backing storage location.
    #[error("cannot restore static field {field}: {reason}")]
    StaticRestore { field: FieldRef, reason: String },

    /// A snapshot byte sequence that cannot be decoded.
    #[error("corrupt snapshot: {0}")]
    Snapshot(String),

    /// Internal consistency violation, e.g. a fetch past the end of a
    /// code object or a type-mismatched stack operation. Inputs are
    /// assumed verified, so this indicates a broken code object.
    #[error("invalid machine state: {0}")]
    State(String),
}
