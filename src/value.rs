//! Dynamically typed values.
//!
//! [`Value`] is the closed tagged union the dynamic codec path works on:
//! one variant per wire type. A value knows its own signature
//! ([`Value::signature`]): that is what makes variants self-describing,
//! the payload signature is resolved from the runtime value at encode
//! time, not from any declared field type.

use std::fmt;

use crate::error::{Error, Result};
use crate::names;
use crate::signature::{Basic, Signature};

/// A validated object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<ObjectPath> {
        let path = path.into();
        names::ensure_object_path(&path)?;
        Ok(ObjectPath(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The root path `/`.
    pub fn root() -> ObjectPath {
        ObjectPath("/".to_string())
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(path: &str) -> Result<ObjectPath> {
        ObjectPath::new(path)
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> String {
        path.0
    }
}

/// A file-descriptor handle value.
///
/// The handle is capability-scoped by the transport; this runtime carries
/// the descriptor number and leaves descriptor translation to the byte
/// transport underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnixFd(pub i32);

/// An ordered sequence with a fixed element signature.
///
/// The element signature is carried explicitly so empty arrays still
/// marshal with the right type.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    elem: Signature,
    items: Vec<Value>,
}

impl Array {
    pub fn new(elem: Signature) -> Array {
        Array {
            elem,
            items: Vec::new(),
        }
    }

    /// Append an element; its signature must match the array's.
    pub fn push(&mut self, value: Value) -> Result<()> {
        let got = value.signature();
        if got != self.elem {
            return Err(Error::InvalidSignature(format!(
                "array of '{}' cannot hold a '{}'",
                self.elem, got
            )));
        }
        self.items.push(value);
        Ok(())
    }

    pub fn element_signature(&self) -> &Signature {
        &self.elem
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A key/value mapping with fixed key and value signatures.
#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    key: Signature,
    value: Signature,
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new(key: Signature, value: Signature) -> Dict {
        Dict {
            key,
            value,
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Result<()> {
        if key.signature() != self.key || value.signature() != self.value {
            return Err(Error::InvalidSignature(format!(
                "dict of '{{{}{}}}' cannot hold '{{{}{}}}'",
                self.key,
                self.value,
                key.signature(),
                value.signature()
            )));
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn key_signature(&self) -> &Signature {
        &self.key
    }

    pub fn value_signature(&self) -> &Signature {
        &self.value
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    UnixFd(UnixFd),
    Array(Array),
    Dict(Dict),
    Struct(Vec<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// The wire signature of this value, resolved from the runtime payload.
    pub fn signature(&self) -> Signature {
        match self {
            Value::Bool(_) => Signature::basic(Basic::Bool),
            Value::Byte(_) => Signature::basic(Basic::Byte),
            Value::Int16(_) => Signature::basic(Basic::Int16),
            Value::UInt16(_) => Signature::basic(Basic::UInt16),
            Value::Int32(_) => Signature::basic(Basic::Int32),
            Value::UInt32(_) => Signature::basic(Basic::UInt32),
            Value::Int64(_) => Signature::basic(Basic::Int64),
            Value::UInt64(_) => Signature::basic(Basic::UInt64),
            Value::Double(_) => Signature::basic(Basic::Double),
            Value::Str(_) => Signature::basic(Basic::Str),
            Value::ObjectPath(_) => Signature::basic(Basic::ObjectPath),
            Value::Signature(_) => Signature::basic(Basic::Signature),
            Value::UnixFd(_) => Signature::basic(Basic::UnixFd),
            Value::Array(a) => Signature::array_of(a.element_signature().clone()),
            Value::Dict(d) => {
                Signature::dict_of(d.key_signature().clone(), d.value_signature().clone())
            }
            Value::Struct(fields) => {
                Signature::struct_of(fields.iter().map(Value::signature).collect())
            }
            Value::Variant(_) => Signature::variant(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Unwrap one level of variant, if any.
    pub fn unwrap_variant(self) -> Value {
        match self {
            Value::Variant(inner) => *inner,
            other => other,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Value {
                    Value::$variant(v)
                }
            }

            impl TryFrom<Value> for $ty {
                type Error = Error;

                fn try_from(v: Value) -> Result<$ty> {
                    match v {
                        Value::$variant(v) => Ok(v),
                        other => Err(Error::Decode(format!(
                            "expected {}, got '{}'",
                            stringify!($variant),
                            other.signature()
                        ))),
                    }
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Str,
    ObjectPath => ObjectPath,
    UnixFd => UnixFd,
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::TypeTag;

    #[test]
    fn values_know_their_signatures() {
        assert_eq!(Value::from(42i32).signature().as_str(), "i");
        assert_eq!(Value::from("hi").signature().as_str(), "s");
        assert_eq!(
            Value::Variant(Box::new(Value::from(1u64))).signature().as_str(),
            "v"
        );
        assert_eq!(
            Value::Struct(vec![Value::from(1u8), Value::from("x")])
                .signature()
                .as_str(),
            "(ys)"
        );
    }

    #[test]
    fn empty_array_keeps_element_signature() {
        let arr = Array::new(Signature::resolve(&TypeTag::Str));
        assert_eq!(Value::Array(arr).signature().as_str(), "as");
    }

    #[test]
    fn array_rejects_mismatched_elements() {
        let mut arr = Array::new(Signature::resolve(&TypeTag::Int32));
        arr.push(Value::from(7i32)).unwrap();
        assert!(arr.push(Value::from("nope")).is_err());
    }

    #[test]
    fn dict_lookup() {
        let mut dict = Dict::new(
            Signature::resolve(&TypeTag::Str),
            Signature::resolve(&TypeTag::UInt32),
        );
        dict.insert(Value::from("a"), Value::from(1u32)).unwrap();
        assert_eq!(dict.get(&Value::from("a")), Some(&Value::UInt32(1)));
        assert_eq!(dict.get(&Value::from("b")), None);
        assert_eq!(Value::Dict(dict).signature().as_str(), "a{su}");
    }

    #[test]
    fn object_path_validation() {
        assert!(ObjectPath::new("/org/example").is_ok());
        assert!(ObjectPath::new("relative").is_err());
    }
}
