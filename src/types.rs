//! Class, member and field identities plus method-descriptor decoding.
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};

/// Binary name of a class, e.g. `com.example.Main`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClassId(String);

impl ClassId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a method or constructor: declaring class, member name and
/// JVM-style descriptor. Constructors use the name `<init>`, static
/// initializers `<clinit>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub class: ClassId,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(
        class: ClassId,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            class,
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }

    pub fn clinit(class: &ClassId) -> Self {
        Self::new(class.clone(), "<clinit>", "()V")
    }

    /// Cache key within the declaring class: name plus descriptor.
    pub fn signature(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor)
    }
}

/// Identity of a static field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub class: ClassId,
    pub name: String,
}

impl FieldRef {
    pub fn new(class: ClassId, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.name)
    }
}

/// Primitive type categories of the managed runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Int,
    Long,
    Float,
    Double,
    Void,
    Reference,
    List,
}

/// A decoded descriptor type. Lists carry their element type.
#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    pub kind: BaseTypeKind,
    pub sub: Option<Box<Type>>,
}

impl Type {
    pub const fn scalar(kind: BaseTypeKind) -> Self {
        Self { kind, sub: None }
    }
}

/// Return-value categories, one per return-instruction variant.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ReturnKind {
    Void,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl ReturnKind {
    /// Whether a return of this category satisfies a declared return
    /// type. The integral category covers every sub-word type.
    pub fn can_return(&self, t: &Type) -> bool {
        match self {
            Self::Void => t.kind == BaseTypeKind::Void,
            Self::Int => t.kind == BaseTypeKind::Int,
            Self::Long => t.kind == BaseTypeKind::Long,
            Self::Float => t.kind == BaseTypeKind::Float,
            Self::Double => t.kind == BaseTypeKind::Double,
            Self::Reference => {
                matches!(t.kind, BaseTypeKind::Reference | BaseTypeKind::List)
            }
        }
    }
}

static DESCRIPTOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([^\)]*)\)([^$]+)").unwrap());

/// Splits a method descriptor into its argument types and return type.
pub fn parse_method_types(descriptor: &str) -> Result<(Vec<Type>, Type)> {
    let caps = DESCRIPTOR_RE.captures(descriptor).ok_or_else(|| {
        VmError::Resolution(format!("malformed descriptor [{descriptor}]"))
    })?;
    let arg_string = caps.get(1).map_or("", |m| m.as_str());
    let return_type_string = caps.get(2).map_or("", |m| m.as_str());
    let (ret_type, _) = decode_type(return_type_string)?;

    let mut types = Vec::new();
    let mut rest = arg_string;
    while !rest.is_empty() {
        let (t, consumed) = decode_type(rest)?;
        types.push(t);
        rest = &rest[consumed..];
    }
    Ok((types, ret_type))
}

/// Number of argument values a call through `descriptor` pops.
pub fn arg_count(descriptor: &str) -> Result<usize> {
    Ok(parse_method_types(descriptor)?.0.len())
}

/// Return category declared by `descriptor`.
pub fn return_kind(descriptor: &str) -> Result<ReturnKind> {
    let (_, ret) = parse_method_types(descriptor)?;
    Ok(match ret.kind {
        BaseTypeKind::Void => ReturnKind::Void,
        BaseTypeKind::Int => ReturnKind::Int,
        BaseTypeKind::Long => ReturnKind::Long,
        BaseTypeKind::Float => ReturnKind::Float,
        BaseTypeKind::Double => ReturnKind::Double,
        BaseTypeKind::Reference | BaseTypeKind::List => ReturnKind::Reference,
    })
}

/// Decodes the leading type of a descriptor fragment, returning the type
/// and the number of bytes consumed.
pub fn decode_type(type_str: &str) -> Result<(Type, usize)> {
    let malformed =
        || VmError::Resolution(format!("malformed type [{type_str}]"));
    match type_str.get(0..1).ok_or_else(malformed)? {
        "I" | "B" | "S" | "C" | "Z" => {
            Ok((Type::scalar(BaseTypeKind::Int), 1))
        }
        "J" => Ok((Type::scalar(BaseTypeKind::Long), 1)),
        "F" => Ok((Type::scalar(BaseTypeKind::Float), 1)),
        "D" => Ok((Type::scalar(BaseTypeKind::Double), 1)),
        "V" => Ok((Type::scalar(BaseTypeKind::Void), 1)),
        "L" => {
            let end = type_str.find(';').ok_or_else(malformed)?;
            Ok((Type::scalar(BaseTypeKind::Reference), end + 1))
        }
        "[" => {
            let (sub, consumed) = decode_type(&type_str[1..])?;
            Ok((
                Type {
                    kind: BaseTypeKind::List,
                    sub: Some(Box::new(sub)),
                },
                consumed + 1,
            ))
        }
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitive_descriptor() {
        let (args, ret) = parse_method_types("(IJ)I").unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].kind, BaseTypeKind::Int);
        assert_eq!(args[1].kind, BaseTypeKind::Long);
        assert_eq!(ret.kind, BaseTypeKind::Int);
    }

    #[test]
    fn parses_reference_and_list_descriptor() {
        let (args, ret) =
            parse_method_types("(Ljava/lang/String;[I)Ljava/lang/Object;")
                .unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].kind, BaseTypeKind::Reference);
        assert_eq!(args[1].kind, BaseTypeKind::List);
        assert_eq!(
            args[1].sub.as_ref().unwrap().kind,
            BaseTypeKind::Int
        );
        assert_eq!(ret.kind, BaseTypeKind::Reference);
    }

    #[test]
    fn arg_count_matches_descriptor() {
        assert_eq!(arg_count("()V").unwrap(), 0);
        assert_eq!(arg_count("(I[JLjava/lang/String;)V").unwrap(), 3);
    }

    #[test]
    fn return_kind_per_category() {
        assert_eq!(return_kind("()V").unwrap(), ReturnKind::Void);
        assert_eq!(return_kind("(I)I").unwrap(), ReturnKind::Int);
        assert_eq!(
            return_kind("()Ljava/lang/String;").unwrap(),
            ReturnKind::Reference
        );
    }

    #[test]
    fn integral_return_covers_sub_word_types() {
        let (_, byte_ret) = parse_method_types("()B").unwrap();
        assert!(ReturnKind::Int.can_return(&byte_ret));
        assert!(!ReturnKind::Long.can_return(&byte_ret));
        let (_, obj_ret) = parse_method_types("()[I").unwrap();
        assert!(ReturnKind::Reference.can_return(&obj_ret));
    }

    #[test]
    fn rejects_malformed_descriptor() {
        assert!(parse_method_types("I").is_err());
        assert!(decode_type("Lunterminated").is_err());
    }
}
