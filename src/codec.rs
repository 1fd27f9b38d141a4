//! Marshalling of typed values and dynamic [`Value`] trees into and out of
//! a [`Message`].
//!
//! The codec is descriptor-driven: a closed set of structural tags
//! ([`TypeTag`]) is walked at encode/decode time, matching container
//! boundaries against the message. Encoding fields in declaration order and
//! decoding them back in the same order reproduces the original value
//! exactly.
//!
//! Arrays of trivial elements (fixed-size primitives other than boolean)
//! bypass per-element dispatch: [`Arg::append_slice`] and [`Arg::read_vec`]
//! are overridden to move one native-sized buffer through the message in a
//! single call. This is the hottest marshalling path and the reason the
//! resolver tags signatures trivial.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::signature::{self, Basic, Signature, TypeTag};
use crate::value::{Array, Dict, ObjectPath, UnixFd, Value};

/// A value with a statically known structural type.
///
/// Implementations exist for every basic wire type, `Vec<T>`,
/// `HashMap<K, V>`, tuples (as structs) and [`Value`] (as a variant).
pub trait Arg: Sized + 'static {
    fn type_tag() -> TypeTag;

    /// The resolved signature; computed once per Rust type and shared.
    fn signature() -> Signature {
        signature::cached::<Self>(Self::type_tag)
    }

    fn append(&self, msg: &mut Message) -> Result<()>;

    fn read(msg: &mut Message) -> Result<Self>;

    /// Append a whole array of `Self`. The default walks elements one by
    /// one; trivial primitives override it with a bulk copy.
    fn append_slice(items: &[Self], msg: &mut Message) -> Result<()> {
        let sig = Self::signature();
        sig.ensure_valid()?;
        msg.open_array(&sig)?;
        for item in items {
            item.append(msg)?;
        }
        msg.close_array()
    }

    /// Read a whole array of `Self`; counterpart of [`Arg::append_slice`].
    fn read_vec(msg: &mut Message) -> Result<Vec<Self>> {
        let sig = Self::signature();
        sig.ensure_valid()?;
        msg.enter_array(&sig)?;
        let mut out = Vec::new();
        while !msg.at_end_of_container() {
            out.push(Self::read(msg)?);
        }
        msg.exit_array()?;
        Ok(out)
    }
}

macro_rules! trivial_arg {
    ($ty:ty, $tag:ident, $basic:ident, $append:ident, $read:ident) => {
        impl Arg for $ty {
            fn type_tag() -> TypeTag {
                TypeTag::$tag
            }

            fn append(&self, msg: &mut Message) -> Result<()> {
                msg.$append(*self)
            }

            fn read(msg: &mut Message) -> Result<Self> {
                msg.$read()
            }

            fn append_slice(items: &[Self], msg: &mut Message) -> Result<()> {
                let mut raw = Vec::with_capacity(items.len() * std::mem::size_of::<$ty>());
                for item in items {
                    raw.extend_from_slice(&item.to_le_bytes());
                }
                msg.append_trivial_array(Basic::$basic, &raw)
            }

            fn read_vec(msg: &mut Message) -> Result<Vec<Self>> {
                let raw = msg.read_trivial_array(Basic::$basic)?;
                msg.ensure_ok()?;
                Ok(raw
                    .chunks_exact(std::mem::size_of::<$ty>())
                    .map(|chunk| <$ty>::from_le_bytes(chunk.try_into().expect("exact chunk")))
                    .collect())
            }
        }
    };
}

trivial_arg!(u8, Byte, Byte, append_u8, read_u8);
trivial_arg!(i16, Int16, Int16, append_i16, read_i16);
trivial_arg!(u16, UInt16, UInt16, append_u16, read_u16);
trivial_arg!(i32, Int32, Int32, append_i32, read_i32);
trivial_arg!(u32, UInt32, UInt32, append_u32, read_u32);
trivial_arg!(i64, Int64, Int64, append_i64, read_i64);
trivial_arg!(u64, UInt64, UInt64, append_u64, read_u64);
trivial_arg!(f64, Double, Double, append_f64, read_f64);

// Booleans keep the element-by-element path: their wire form is not a
// plain native buffer.
impl Arg for bool {
    fn type_tag() -> TypeTag {
        TypeTag::Bool
    }

    fn append(&self, msg: &mut Message) -> Result<()> {
        msg.append_bool(*self)
    }

    fn read(msg: &mut Message) -> Result<Self> {
        msg.read_bool()
    }
}

impl Arg for String {
    fn type_tag() -> TypeTag {
        TypeTag::Str
    }

    fn append(&self, msg: &mut Message) -> Result<()> {
        msg.append_str(self)
    }

    fn read(msg: &mut Message) -> Result<Self> {
        msg.read_str()
    }
}

impl Arg for ObjectPath {
    fn type_tag() -> TypeTag {
        TypeTag::ObjectPath
    }

    fn append(&self, msg: &mut Message) -> Result<()> {
        msg.append_object_path(self)
    }

    fn read(msg: &mut Message) -> Result<Self> {
        msg.read_object_path()
    }
}

impl Arg for Signature {
    fn type_tag() -> TypeTag {
        TypeTag::Signature
    }

    fn append(&self, msg: &mut Message) -> Result<()> {
        msg.append_signature(self)
    }

    fn read(msg: &mut Message) -> Result<Self> {
        msg.read_signature_value()
    }
}

impl Arg for UnixFd {
    fn type_tag() -> TypeTag {
        TypeTag::UnixFd
    }

    fn append(&self, msg: &mut Message) -> Result<()> {
        msg.append_fd(*self)
    }

    fn read(msg: &mut Message) -> Result<Self> {
        msg.read_fd()
    }
}

impl<T: Arg> Arg for Vec<T> {
    fn type_tag() -> TypeTag {
        TypeTag::Array(Box::new(T::type_tag()))
    }

    fn append(&self, msg: &mut Message) -> Result<()> {
        T::append_slice(self, msg)
    }

    fn read(msg: &mut Message) -> Result<Self> {
        T::read_vec(msg)
    }
}

impl<K, V> Arg for HashMap<K, V>
where
    K: Arg + Eq + Hash,
    V: Arg,
{
    fn type_tag() -> TypeTag {
        TypeTag::Dict(Box::new(K::type_tag()), Box::new(V::type_tag()))
    }

    fn append(&self, msg: &mut Message) -> Result<()> {
        Self::signature().ensure_valid()?;
        msg.open_dict(&K::signature(), &V::signature())?;
        for (k, v) in self {
            msg.open_dict_entry()?;
            k.append(msg)?;
            v.append(msg)?;
            msg.close_dict_entry()?;
        }
        msg.close_array()
    }

    fn read(msg: &mut Message) -> Result<Self> {
        Self::signature().ensure_valid()?;
        msg.enter_dict(&K::signature(), &V::signature())?;
        let mut out = HashMap::new();
        while !msg.at_end_of_container() {
            msg.enter_dict_entry()?;
            let k = K::read(msg)?;
            let v = V::read(msg)?;
            msg.exit_dict_entry()?;
            out.insert(k, v);
        }
        msg.exit_array()?;
        Ok(out)
    }
}

/// A dynamically typed value marshals as a variant: the payload signature
/// is resolved from the runtime value and travels inside the container.
impl Arg for Value {
    fn type_tag() -> TypeTag {
        TypeTag::Variant
    }

    fn append(&self, msg: &mut Message) -> Result<()> {
        let payload = self.signature();
        payload.ensure_valid()?;
        msg.open_variant(&payload)?;
        encode_value_body(msg, self)?;
        msg.close_variant()
    }

    fn read(msg: &mut Message) -> Result<Self> {
        let payload = msg.enter_variant()?;
        let value = decode_value_body(msg, &payload)?;
        msg.exit_variant()?;
        Ok(value)
    }
}

macro_rules! tuple_arg {
    ($($name:ident),+) => {
        impl<$($name: Arg),+> Arg for ($($name,)+) {
            fn type_tag() -> TypeTag {
                TypeTag::Struct(vec![$($name::type_tag()),+])
            }

            fn append(&self, msg: &mut Message) -> Result<()> {
                Self::signature().ensure_valid()?;
                #[allow(non_snake_case)]
                let ($(ref $name,)+) = *self;
                msg.open_struct()?;
                $($name.append(msg)?;)+
                msg.close_struct()
            }

            fn read(msg: &mut Message) -> Result<Self> {
                Self::signature().ensure_valid()?;
                msg.enter_struct()?;
                let out = ($($name::read(msg)?,)+);
                msg.exit_struct()?;
                Ok(out)
            }
        }
    };
}

tuple_arg!(A);
tuple_arg!(A, B);
tuple_arg!(A, B, C);
tuple_arg!(A, B, C, D);
tuple_arg!(A, B, C, D, E);
tuple_arg!(A, B, C, D, E, F);
tuple_arg!(A, B, C, D, E, F, G);
tuple_arg!(A, B, C, D, E, F, G, H);

/// An ordered argument list at a call boundary: the inputs of a method,
/// its outputs, or a signal's payload.
///
/// Unlike a tuple marshalled through [`Arg`], an argument list has no
/// enclosing struct container: its fields and signatures concatenate at
/// the top level of the message body, and the concatenation is the wire
/// plan used for dispatch.
pub trait ArgList: Sized + 'static {
    /// Concatenated signatures, one complete type per argument.
    fn signature_text() -> String;

    /// Structural tags per argument, for registration-time validation.
    fn type_tags() -> Vec<TypeTag>;

    fn append_args(&self, msg: &mut Message) -> Result<()>;

    fn read_args(msg: &mut Message) -> Result<Self>;

    /// Validate that every argument type resolves to a valid signature.
    fn ensure_valid() -> Result<()> {
        for tag in Self::type_tags() {
            Signature::resolve(&tag).ensure_valid()?;
        }
        Ok(())
    }
}

impl ArgList for () {
    fn signature_text() -> String {
        String::new()
    }

    fn type_tags() -> Vec<TypeTag> {
        Vec::new()
    }

    fn append_args(&self, _msg: &mut Message) -> Result<()> {
        Ok(())
    }

    fn read_args(msg: &mut Message) -> Result<Self> {
        if msg.body_signature().is_empty() {
            Ok(())
        } else {
            Err(Error::Decode(format!(
                "expected no arguments, got '{}'",
                msg.body_signature()
            )))
        }
    }
}

macro_rules! arg_list {
    ($($name:ident),+) => {
        impl<$($name: Arg),+> ArgList for ($($name,)+) {
            fn signature_text() -> String {
                let mut text = String::new();
                $(text.push_str($name::signature().as_str());)+
                text
            }

            fn type_tags() -> Vec<TypeTag> {
                vec![$($name::type_tag()),+]
            }

            fn append_args(&self, msg: &mut Message) -> Result<()> {
                #[allow(non_snake_case)]
                let ($(ref $name,)+) = *self;
                $(
                    $name::signature().ensure_valid()?;
                    msg.note_body_signature($name::signature().as_str());
                    $name.append(msg)?;
                )+
                Ok(())
            }

            fn read_args(msg: &mut Message) -> Result<Self> {
                let expected = Self::signature_text();
                if msg.body_signature() != expected {
                    return Err(Error::Decode(format!(
                        "argument signature mismatch: expected '{}', got '{}'",
                        expected,
                        msg.body_signature()
                    )));
                }
                Ok(($($name::read(msg)?,)+))
            }
        }
    };
}

arg_list!(A);
arg_list!(A, B);
arg_list!(A, B, C);
arg_list!(A, B, C, D);
arg_list!(A, B, C, D, E);
arg_list!(A, B, C, D, E, F);
arg_list!(A, B, C, D, E, F, G);
arg_list!(A, B, C, D, E, F, G, H);

/// Encode a dynamic value at the top level of a message body, per the
/// value's own signature.
pub fn encode_value(msg: &mut Message, value: &Value) -> Result<()> {
    let sig = value.signature();
    sig.ensure_valid()?;
    msg.note_body_signature(sig.as_str());
    encode_value_body(msg, value)
}

/// Encode a dynamic value, requiring it to match a declared signature.
pub fn encode_value_as(msg: &mut Message, declared: &Signature, value: &Value) -> Result<()> {
    let got = value.signature();
    if &got != declared {
        return Err(Error::InvalidSignature(format!(
            "value of type '{}' where '{}' was declared",
            got, declared
        )));
    }
    encode_value(msg, value)
}

fn encode_value_body(msg: &mut Message, value: &Value) -> Result<()> {
    match value {
        Value::Bool(v) => msg.append_bool(*v),
        Value::Byte(v) => msg.append_u8(*v),
        Value::Int16(v) => msg.append_i16(*v),
        Value::UInt16(v) => msg.append_u16(*v),
        Value::Int32(v) => msg.append_i32(*v),
        Value::UInt32(v) => msg.append_u32(*v),
        Value::Int64(v) => msg.append_i64(*v),
        Value::UInt64(v) => msg.append_u64(*v),
        Value::Double(v) => msg.append_f64(*v),
        Value::Str(v) => msg.append_str(v),
        Value::ObjectPath(v) => msg.append_object_path(v),
        Value::Signature(v) => msg.append_signature(v),
        Value::UnixFd(v) => msg.append_fd(*v),
        Value::Array(arr) => {
            msg.open_array(arr.element_signature())?;
            for item in arr.items() {
                encode_value_body(msg, item)?;
            }
            msg.close_array()
        }
        Value::Dict(dict) => {
            msg.open_dict(dict.key_signature(), dict.value_signature())?;
            for (k, v) in dict.entries() {
                msg.open_dict_entry()?;
                encode_value_body(msg, k)?;
                encode_value_body(msg, v)?;
                msg.close_dict_entry()?;
            }
            msg.close_array()
        }
        Value::Struct(fields) => {
            msg.open_struct()?;
            for field in fields {
                encode_value_body(msg, field)?;
            }
            msg.close_struct()
        }
        Value::Variant(inner) => {
            let payload = inner.signature();
            payload.ensure_valid()?;
            msg.open_variant(&payload)?;
            encode_value_body(msg, inner)?;
            msg.close_variant()
        }
    }
}

/// Decode one complete type from the message, driven by its signature.
pub fn decode_value(msg: &mut Message, sig: &Signature) -> Result<Value> {
    sig.ensure_valid()?;
    decode_value_body(msg, sig)
}

fn decode_value_body(msg: &mut Message, sig: &Signature) -> Result<Value> {
    if let Some(basic) = sig.as_basic() {
        return Ok(match basic {
            Basic::Bool => Value::Bool(msg.read_bool()?),
            Basic::Byte => Value::Byte(msg.read_u8()?),
            Basic::Int16 => Value::Int16(msg.read_i16()?),
            Basic::UInt16 => Value::UInt16(msg.read_u16()?),
            Basic::Int32 => Value::Int32(msg.read_i32()?),
            Basic::UInt32 => Value::UInt32(msg.read_u32()?),
            Basic::Int64 => Value::Int64(msg.read_i64()?),
            Basic::UInt64 => Value::UInt64(msg.read_u64()?),
            Basic::Double => Value::Double(msg.read_f64()?),
            Basic::Str => Value::Str(msg.read_str()?),
            Basic::ObjectPath => Value::ObjectPath(msg.read_object_path()?),
            Basic::Signature => Value::Signature(msg.read_signature_value()?),
            Basic::UnixFd => Value::UnixFd(msg.read_fd()?),
        });
    }
    if sig.is_variant() {
        let payload = msg.enter_variant()?;
        let inner = decode_value_body(msg, &payload)?;
        msg.exit_variant()?;
        return Ok(Value::Variant(Box::new(inner)));
    }
    if let Some(elem) = sig.element() {
        msg.enter_array(elem)?;
        let mut arr = Array::new(elem.clone());
        while !msg.at_end_of_container() {
            let item = decode_value_body(msg, elem)?;
            arr.push(item)
                .map_err(|e| Error::Decode(e.to_string()))?;
        }
        msg.exit_array()?;
        return Ok(Value::Array(arr));
    }
    if let Some((key_sig, value_sig)) = sig.dict_entry() {
        msg.enter_dict(key_sig, value_sig)?;
        let mut dict = Dict::new(key_sig.clone(), value_sig.clone());
        while !msg.at_end_of_container() {
            msg.enter_dict_entry()?;
            let k = decode_value_body(msg, key_sig)?;
            let v = decode_value_body(msg, value_sig)?;
            msg.exit_dict_entry()?;
            dict.insert(k, v).map_err(|e| Error::Decode(e.to_string()))?;
        }
        msg.exit_array()?;
        return Ok(Value::Dict(dict));
    }
    if let Some(fields) = sig.fields() {
        msg.enter_struct()?;
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            out.push(decode_value_body(msg, field)?);
        }
        msg.exit_struct()?;
        return Ok(Value::Struct(out));
    }
    Err(Error::InvalidSignature(format!(
        "cannot decode against '{}'",
        sig
    )))
}

/// Bridge a typed value into its dynamic form through the wire encoding,
/// so the two paths can never disagree about the representation.
pub fn to_value<T: Arg>(value: &T) -> Result<Value> {
    let sig = T::signature();
    sig.ensure_valid()?;
    let mut scratch = Message::scratch();
    value.append(&mut scratch)?;
    scratch.rewind();
    decode_value_body(&mut scratch, &sig)
}

/// Bridge a dynamic value back into a typed one; fails on a type
/// mismatch.
pub fn from_value<T: Arg>(value: &Value) -> Result<T> {
    let sig = T::signature();
    sig.ensure_valid()?;
    let got = value.signature();
    if got != sig {
        return Err(Error::Decode(format!(
            "expected a value of type '{}', got '{}'",
            sig, got
        )));
    }
    let mut scratch = Message::scratch();
    encode_value_body(&mut scratch, value)?;
    scratch.rewind();
    T::read(&mut scratch)
}

/// Decode the whole body of a message into one dynamic value per argument.
pub fn decode_body_values(msg: &mut Message) -> Result<Vec<Value>> {
    let sigs = Signature::parse_many(msg.body_signature())?;
    let mut out = Vec::with_capacity(sigs.len());
    for sig in &sigs {
        out.push(decode_value_body(msg, sig)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> Message {
        Message::signal("/t", "org.test.Iface", "Go").unwrap()
    }

    #[test]
    fn typed_round_trip_flat() {
        let mut msg = scratch();
        let args = (7i32, "hi".to_string(), true);
        args.append_args(&mut msg).unwrap();
        assert_eq!(msg.body_signature(), "isb");

        msg.rewind();
        let back = <(i32, String, bool)>::read_args(&mut msg).unwrap();
        assert_eq!(back, args);
    }

    #[test]
    fn typed_round_trip_nested() {
        let mut map = HashMap::new();
        map.insert("k".to_string(), vec![1u64, 2, 3]);
        let args = (map.clone(), (5u8, "in".to_string()));

        let mut msg = scratch();
        args.append_args(&mut msg).unwrap();
        assert_eq!(msg.body_signature(), "a{sat}(ys)");

        msg.rewind();
        let (m2, pair) = <(HashMap<String, Vec<u64>>, (u8, String))>::read_args(&mut msg).unwrap();
        assert_eq!(m2, map);
        assert_eq!(pair, (5u8, "in".to_string()));
    }

    #[test]
    fn arg_signature_mismatch_is_an_error() {
        let mut msg = scratch();
        (1u32,).append_args(&mut msg).unwrap();
        msg.rewind();
        assert!(<(String,)>::read_args(&mut msg).is_err());
    }

    #[test]
    fn fast_path_matches_element_path() {
        // Bulk-encode, then decode the same body element by element through
        // the dynamic path; the sequences must agree.
        let values: Vec<u32> = (0..100).map(|i| i * 31).collect();
        let mut msg = scratch();
        (values.clone(),).append_args(&mut msg).unwrap();

        msg.rewind();
        let (bulk,) = <(Vec<u32>,)>::read_args(&mut msg).unwrap();
        assert_eq!(bulk, values);

        msg.rewind();
        let sig = Signature::parse("au").unwrap();
        let dynamic = decode_value(&mut msg, &sig).unwrap();
        match dynamic {
            Value::Array(arr) => {
                let elems: Vec<u32> = arr
                    .items()
                    .iter()
                    .map(|v| match v {
                        Value::UInt32(n) => *n,
                        other => panic!("unexpected element {:?}", other),
                    })
                    .collect();
                assert_eq!(elems, values);
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn variant_payload_signature_from_runtime_value() {
        let mut msg = scratch();
        let v = Value::Variant(Box::new(Value::Struct(vec![
            Value::Int64(-9),
            Value::Str("x".into()),
        ])));
        // The declared type is "variant"; the payload signature (xs) is
        // taken from the value itself.
        (v.clone(),).append_args(&mut msg).unwrap();
        assert_eq!(msg.body_signature(), "v");

        msg.rewind();
        let (back,) = <(Value,)>::read_args(&mut msg).unwrap();
        assert_eq!(back, v.unwrap_variant());
    }

    #[test]
    fn dynamic_round_trip_deeply_nested() {
        // struct of (map of string -> variant of list of i32, byte)
        let mut dict = Dict::new(
            Signature::parse("s").unwrap(),
            Signature::parse("v").unwrap(),
        );
        let mut list = Array::new(Signature::parse("i").unwrap());
        list.push(Value::Int32(1)).unwrap();
        list.push(Value::Int32(-2)).unwrap();
        dict.insert(
            Value::Str("xs".into()),
            Value::Variant(Box::new(Value::Array(list))),
        )
        .unwrap();
        let value = Value::Struct(vec![Value::Dict(dict), Value::Byte(9)]);
        let sig = value.signature();
        assert_eq!(sig.as_str(), "(a{sv}y)");

        let mut msg = scratch();
        encode_value(&mut msg, &value).unwrap();
        assert_eq!(msg.body_signature(), "(a{sv}y)");

        msg.rewind();
        let back = decode_value(&mut msg, &sig).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn encode_value_as_enforces_declared_signature() {
        let mut msg = scratch();
        let declared = Signature::parse("u").unwrap();
        assert!(encode_value_as(&mut msg, &declared, &Value::UInt32(1)).is_ok());
        assert!(encode_value_as(&mut msg, &declared, &Value::Str("no".into())).is_err());
    }

    #[test]
    fn invalid_signature_fails_fast() {
        // A map keyed by a container type has no wire representation.
        let sig = <HashMap<Vec<u8>, u32> as Arg>::signature();
        assert!(!sig.is_valid());
        let mut msg = scratch();
        let mut map = HashMap::new();
        map.insert(vec![1u8], 2u32);
        assert!(map.append(&mut msg).is_err());
    }

    #[test]
    fn decode_body_values_walks_all_arguments() {
        let mut msg = scratch();
        (1u8, "two".to_string(), vec![3i64]).append_args(&mut msg).unwrap();
        msg.rewind();
        let values = decode_body_values(&mut msg).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], Value::Byte(1));
        assert_eq!(values[1], Value::Str("two".into()));
    }
}
