//! Operand values flowing through the interpreter's stacks and locals.
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::types::ClassId;

/// A value living on an operand stack, in a local slot or in static
/// storage. Primitive categories mirror the managed runtime's; strings
/// and class references are the two persistable reference categories.
/// Everything else the host object model produces arrives as `Native`.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(Arc<str>),
    Class(ClassId),
    Native(NativeValue),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    /// Run-time class of the value, used for handler-filter matching and
    /// for naming the value in diagnostics. Primitives report their boxed
    /// class names.
    pub fn class_id(&self) -> ClassId {
        match self {
            Self::Null => ClassId::new("java.lang.Object"),
            Self::Int(_) => ClassId::new("java.lang.Integer"),
            Self::Long(_) => ClassId::new("java.lang.Long"),
            Self::Float(_) => ClassId::new("java.lang.Float"),
            Self::Double(_) => ClassId::new("java.lang.Double"),
            Self::Str(_) => ClassId::new("java.lang.String"),
            Self::Class(_) => ClassId::new("java.lang.Class"),
            Self::Native(n) => n.class.clone(),
        }
    }

    /// Whether the checkpoint subsystem can capture this value.
    pub fn is_persistable(&self) -> bool {
        !matches!(self, Self::Native(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Class(a), Self::Class(b)) => a == b,
            (Self::Native(a), Self::Native(b)) => Arc::ptr_eq(&a.data, &b.data),
            _ => false,
        }
    }
}

/// An opaque reference into the host's object model. The interpreter
/// moves these around without looking inside; the checkpoint subsystem
/// refuses them.
#[derive(Clone)]
pub struct NativeValue {
    class: ClassId,
    data: Arc<dyn Any + Send + Sync>,
}

impl NativeValue {
    pub fn new(class: ClassId, data: Arc<dyn Any + Send + Sync>) -> Self {
        Self { class, data }
    }

    pub fn class(&self) -> &ClassId {
        &self.class
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }
}

impl fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NativeValue({})", self.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_values_are_persistable() {
        assert!(Value::Int(3).is_persistable());
        assert!(Value::string("abc").is_persistable());
        assert!(Value::Null.is_persistable());
    }

    #[test]
    fn native_values_are_not_persistable() {
        let v = Value::Native(NativeValue::new(
            ClassId::new("java.io.FileInputStream"),
            Arc::new(42_u64),
        ));
        assert!(!v.is_persistable());
        assert_eq!(v.class_id(), ClassId::new("java.io.FileInputStream"));
    }

    #[test]
    fn native_equality_is_by_identity() {
        let data: Arc<dyn Any + Send + Sync> = Arc::new(1_u8);
        let a = NativeValue::new(ClassId::new("X"), data.clone());
        let b = NativeValue::new(ClassId::new("X"), data);
        let c = NativeValue::new(ClassId::new("X"), Arc::new(1_u8));
        assert_eq!(Value::Native(a.clone()), Value::Native(b));
        assert_ne!(Value::Native(a), Value::Native(c));
    }
}
