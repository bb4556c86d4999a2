//! Synthesized stack traces for failures raised by interpreted code.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ClassId;
use crate::value::Value;

/// One entry of a synthesized trace: where inside the interpreted
/// program something happened. Line is -1 when the code object carries
/// no line entry at or before the pc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceElement {
    pub class: ClassId,
    pub member: String,
    pub source: String,
    pub line: i32,
}

impl TraceElement {
    pub fn new(
        class: ClassId,
        member: impl Into<String>,
        source: impl Into<String>,
        line: i32,
    ) -> Self {
        Self {
            class,
            member: member.into(),
            source: source.into(),
            line,
        }
    }
}

impl fmt::Display for TraceElement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}({}:{})",
            self.class, self.member, self.source, self.line
        )
    }
}

/// A failure raised by interpreted code, travelling up the frame chain
/// until a handler catches it or the chain is exhausted.
#[derive(Debug, Clone)]
pub struct Thrown {
    pub class: ClassId,
    pub value: Value,
    pub trace: Vec<TraceElement>,
}

impl Thrown {
    /// Wraps a thrown operand value; its run-time class drives handler
    /// filter matching.
    pub fn from_value(value: Value) -> Self {
        Self {
            class: value.class_id(),
            value,
            trace: Vec::new(),
        }
    }

    pub fn new(class: ClassId, value: Value) -> Self {
        Self {
            class,
            value,
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.class)?;
        for element in &self.trace {
            write!(f, "\n\tat {element}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_element_formats_like_a_stack_frame() {
        let e = TraceElement::new(
            ClassId::new("com.example.Main"),
            "run",
            "Main.java",
            42,
        );
        assert_eq!(e.to_string(), "com.example.Main.run(Main.java:42)");
    }

    #[test]
    fn thrown_display_lists_trace_entries() {
        let mut t = Thrown::from_value(Value::string("boom"));
        t.trace
            .push(TraceElement::new(ClassId::new("A"), "f", "A.java", 1));
        let s = t.to_string();
        assert!(s.starts_with("java.lang.String"));
        assert!(s.contains("\tat A.f(A.java:1)"));
    }
}
