//! Immutable compiled-method representation and the process-wide code
//! cache through which all method bodies are resolved.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::error::{Result, VmError};
use crate::insn::Insn;
use crate::trace::Thrown;
use crate::types::{ClassId, MemberRef};
use crate::value::Value;

/// One exception-handler table entry. Matches a program counter `cp`
/// when `start < cp <= end`; `class` of `None` catches everything.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    pub class: Option<ClassId>,
}

impl ExceptionHandler {
    pub fn covers(&self, cp: usize) -> bool {
        self.start < cp && cp <= self.end
    }
}

/// Sparse mapping from an instruction index to a source line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LineEntry {
    pub index: usize,
    pub line: i32,
}

/// Source line for `cp`: the line of the largest entry whose index is
/// at most `cp`, or -1 when there is none.
pub fn line_for(lines: &[LineEntry], cp: usize) -> i32 {
    let mut line = -1;
    for entry in lines {
        if entry.index > cp {
            break;
        }
        line = entry.line;
    }
    line
}

/// Immutable decoded body of one method or constructor. Built once per
/// member by the loader, cached globally, and referenced by any number
/// of frames afterwards.
#[derive(Debug)]
pub struct CodeObject {
    pub access: u32,
    pub insns: Vec<Insn>,
    pub excpts: Vec<ExceptionHandler>,
    pub lines: Vec<LineEntry>,
    pub stack_size: usize,
    pub source: String,
}

impl CodeObject {
    pub fn new(
        access: u32,
        insns: Vec<Insn>,
        excpts: Vec<ExceptionHandler>,
        mut lines: Vec<LineEntry>,
        stack_size: usize,
        source: impl Into<String>,
    ) -> Self {
        lines.sort_by_key(|e| e.index);
        Self {
            access,
            insns,
            excpts,
            lines,
            stack_size,
            source: source.into(),
        }
    }

    pub fn insn(&self, cp: usize) -> Result<&Insn> {
        self.insns.get(cp).ok_or_else(|| {
            VmError::State(format!(
                "instruction index {cp} out of range in {}",
                self.source
            ))
        })
    }
}

/// Resolves program identities for the machine. The embedder's decoder
/// and loader sit behind this trait; the machine itself never decodes
/// byte code.
pub trait CodeLoader: Send + Sync {
    /// Decoded body of a method or constructor. Called at most once per
    /// member per process; results are published in the global cache.
    fn load(&self, member: &MemberRef) -> Result<Arc<CodeObject>>;

    /// Static-initializer body of a class, if the class declares one.
    fn clinit(&self, class: &ClassId) -> Option<Arc<CodeObject>>;

    /// Subtype test used by exception-handler filters.
    fn is_assignable(&self, from: &ClassId, to: &ClassId) -> bool {
        from == to
    }

    /// Executes a host-native member on behalf of interpreted code. A
    /// `Thrown` failure is recoverable by in-program handlers.
    fn native_call(
        &self,
        member: &MemberRef,
        _args: Vec<Value>,
    ) -> std::result::Result<Value, Thrown> {
        Err(Thrown::new(
            ClassId::new("java.lang.UnsatisfiedLinkError"),
            Value::string(&member.to_string()),
        ))
    }
}

// Process-wide, read-mostly cache of decoded bodies. Entries are
// immutable once published and never invalidated for the lifetime of a
// loaded type, so concurrent lookups across machine instances are safe.
static CODE_CACHE: Lazy<RwLock<HashMap<(ClassId, String), Arc<CodeObject>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Looks a member's code up in the global cache, consulting `loader` on
/// a miss and publishing the result.
pub fn global_code(
    loader: &dyn CodeLoader,
    member: &MemberRef,
) -> Result<Arc<CodeObject>> {
    let key = (member.class.clone(), member.signature());
    if let Ok(cache) = CODE_CACHE.read() {
        if let Some(code) = cache.get(&key) {
            return Ok(code.clone());
        }
    }
    let code = loader.load(member)?;
    if let Ok(mut cache) = CODE_CACHE.write() {
        // A racing machine may have published first; keep its entry.
        return Ok(cache.entry(key).or_insert(code).clone());
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_range_is_start_exclusive_end_inclusive() {
        let h = ExceptionHandler {
            start: 2,
            end: 4,
            handler: 7,
            class: None,
        };
        assert!(!h.covers(2));
        assert!(h.covers(3));
        assert!(h.covers(4));
        assert!(!h.covers(5));
    }

    #[test]
    fn line_lookup_takes_largest_entry_at_or_before_cp() {
        let lines = vec![
            LineEntry { index: 0, line: 10 },
            LineEntry { index: 4, line: 11 },
            LineEntry { index: 9, line: 13 },
        ];
        assert_eq!(line_for(&lines, 0), 10);
        assert_eq!(line_for(&lines, 3), 10);
        assert_eq!(line_for(&lines, 4), 11);
        assert_eq!(line_for(&lines, 8), 11);
        assert_eq!(line_for(&lines, 20), 13);
        assert_eq!(line_for(&[], 5), -1);
    }

    #[test]
    fn line_entries_are_sorted_on_construction() {
        let code = CodeObject::new(
            0,
            Vec::new(),
            Vec::new(),
            vec![
                LineEntry { index: 6, line: 3 },
                LineEntry { index: 1, line: 1 },
            ],
            0,
            "T.java",
        );
        assert_eq!(line_for(&code.lines, 2), 1);
        assert_eq!(line_for(&code.lines, 6), 3);
    }
}
