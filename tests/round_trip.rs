//! Marshalling laws: encode-then-decode reproduces the value, signatures
//! resolve deterministically, and the bulk array fast path agrees with
//! element-by-element decoding.

use std::collections::HashMap;

use sorbus::{
    decode_value, encode_value, Arg, ArgList, Array, Dict, Message, Signature, TypeTag, Value,
};

fn scratch() -> Message {
    Message::signal("/t", "org.test.Iface", "Scratch").unwrap()
}

#[test]
fn primitives_round_trip_in_declaration_order() {
    let mut msg = scratch();
    let args = (
        true,
        255u8,
        -32000i16,
        65000u16,
        -2_000_000_000i32,
        4_000_000_000u32,
        -9_000_000_000_000i64,
        18_000_000_000_000u64,
        // eight is the tuple limit; doubles and strings get their own test
    );
    args.append_args(&mut msg).unwrap();
    assert_eq!(msg.body_signature(), "bynqiuxt");

    msg.rewind();
    let back = <(bool, u8, i16, u16, i32, u32, i64, u64)>::read_args(&mut msg).unwrap();
    assert_eq!(back, args);
    assert!(msg.ok());
}

#[test]
fn strings_and_doubles_round_trip() {
    let mut msg = scratch();
    let args = (2.718281828f64, "naïve ünïcode ✓".to_string(), String::new());
    args.append_args(&mut msg).unwrap();
    assert_eq!(msg.body_signature(), "dss");

    msg.rewind();
    let back = <(f64, String, String)>::read_args(&mut msg).unwrap();
    assert_eq!(back, args);
}

#[test]
fn nested_struct_of_map_of_variant_of_list_round_trips() {
    // The hardest shape: struct(map<string, variant(list<i64>)>, byte).
    let mut inner = Array::new(Signature::parse("x").unwrap());
    inner.push(Value::Int64(-1)).unwrap();
    inner.push(Value::Int64(i64::MAX)).unwrap();

    let mut map = Dict::new(
        Signature::parse("s").unwrap(),
        Signature::parse("v").unwrap(),
    );
    map.insert(
        Value::Str("longs".into()),
        Value::Variant(Box::new(Value::Array(inner))),
    )
    .unwrap();
    map.insert(
        Value::Str("word".into()),
        Value::Variant(Box::new(Value::Str("inside".into()))),
    )
    .unwrap();

    let value = Value::Struct(vec![Value::Dict(map), Value::Byte(7)]);
    let sig = value.signature();
    assert_eq!(sig.as_str(), "(a{sv}y)");

    let mut msg = scratch();
    encode_value(&mut msg, &value).unwrap();
    msg.rewind();
    let back = decode_value(&mut msg, &sig).unwrap();
    assert_eq!(back, value);
    assert!(msg.ok());
}

#[test]
fn typed_nested_containers_round_trip() {
    let mut msg = scratch();
    let mut map: HashMap<String, Vec<(u32, String)>> = HashMap::new();
    map.insert(
        "pairs".to_string(),
        vec![(1, "one".to_string()), (2, "two".to_string())],
    );
    (map.clone(),).append_args(&mut msg).unwrap();
    assert_eq!(msg.body_signature(), "a{sa(us)}");

    msg.rewind();
    let (back,) = <(HashMap<String, Vec<(u32, String)>>,)>::read_args(&mut msg).unwrap();
    assert_eq!(back, map);
}

#[test]
fn signature_resolution_is_deterministic() {
    let tag = TypeTag::Struct(vec![
        TypeTag::Dict(Box::new(TypeTag::Str), Box::new(TypeTag::Variant)),
        TypeTag::Array(Box::new(TypeTag::Double)),
    ]);
    let first = Signature::resolve(&tag);
    let second = Signature::resolve(&tag);
    assert_eq!(first.as_str(), second.as_str());
    assert_eq!(first, second);
    assert_eq!(first.as_str(), "(a{sv}ad)");

    // The typed path shares one resolution per Rust type.
    let a = <Vec<(i32, String)> as Arg>::signature();
    let b = <Vec<(i32, String)> as Arg>::signature();
    assert_eq!(a.as_str(), "a(is)");
    assert_eq!(a, b);
}

#[test]
fn fast_path_equals_element_path_for_every_trivial_type() {
    fn check<T>(values: Vec<T>, expected_sig: &str)
    where
        T: Arg + Clone + PartialEq + std::fmt::Debug,
    {
        let mut msg = scratch();
        (values.clone(),).append_args(&mut msg).unwrap();
        assert_eq!(msg.body_signature(), expected_sig);

        // Bulk decode.
        msg.rewind();
        let (bulk,) = <(Vec<T>,)>::read_args(&mut msg).unwrap();
        assert_eq!(bulk, values);

        // Element-by-element decode of the same bytes via the dynamic
        // path must yield the same sequence.
        msg.rewind();
        let sig = Signature::parse(expected_sig).unwrap();
        let dynamic = decode_value(&mut msg, &sig).unwrap();
        match dynamic {
            Value::Array(arr) => assert_eq!(arr.len(), values.len()),
            other => panic!("expected an array, got {:?}", other),
        }
    }

    check::<u8>((0..=255).collect(), "ay");
    check::<i16>(vec![i16::MIN, -1, 0, 1, i16::MAX], "an");
    check::<u16>(vec![0, 1, u16::MAX], "aq");
    check::<i32>(vec![i32::MIN, 0, i32::MAX], "ai");
    check::<u32>((0..64).map(|i| i * 1000).collect(), "au");
    check::<i64>(vec![i64::MIN, 0, i64::MAX], "ax");
    check::<u64>(vec![0, u64::MAX], "at");
    check::<f64>(vec![0.0, -1.5, f64::MAX, f64::MIN_POSITIVE], "ad");
}

#[test]
fn empty_trivial_array_round_trips() {
    let mut msg = scratch();
    (Vec::<u64>::new(),).append_args(&mut msg).unwrap();
    msg.rewind();
    let (back,) = <(Vec<u64>,)>::read_args(&mut msg).unwrap();
    assert!(back.is_empty());
}

#[test]
fn bool_arrays_take_the_element_path() {
    let mut msg = scratch();
    let values = vec![true, false, true, true];
    (values.clone(),).append_args(&mut msg).unwrap();
    assert_eq!(msg.body_signature(), "ab");
    msg.rewind();
    let (back,) = <(Vec<bool>,)>::read_args(&mut msg).unwrap();
    assert_eq!(back, values);
}

#[test]
fn exhausted_message_reports_decode_failure_not_garbage() {
    let mut msg = scratch();
    (1u32,).append_args(&mut msg).unwrap();
    msg.rewind();
    assert_eq!(msg.read_u32().unwrap(), 1);
    assert!(msg.read_u64().is_err());
    assert!(!msg.ok());
    assert!(msg.ensure_ok().is_err());
}
