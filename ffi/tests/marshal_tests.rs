use ffi::{compile, pack, unpack, FfiError, MAX_UNPACK_NAMED, MAX_UNPACK_VALUES};
use memory::{Arena, Value};
use proptest::prelude::*;

fn field(name: &str, ty: &str) -> Value {
    Value::list(vec![Value::str(name), Value::str(ty)])
}

fn array_field(name: &str, ty: &str, count: i64) -> Value {
    Value::list(vec![Value::str(name), Value::str(ty), Value::Int(count)])
}

fn struct_field(name: &str, child: Value) -> Value {
    Value::list(vec![
        Value::str(name),
        Value::str("struct"),
        Value::Int(0),
        child,
    ])
}

#[test]
fn test_scalar_round_trip() {
    let desc = compile(
        &Value::List(vec![field("a", "i4"), field("b", "bool"), field("c", "r8")]),
        false,
    )
    .unwrap();
    let values = vec![Value::Int(7), Value::Bool(true), Value::Float(1.5)];

    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &values, &scope).unwrap();
    assert_eq!(buf.len(), desc.size());

    let out = unsafe { unpack(buf, Some(desc.size()), &desc, false) }.unwrap();
    assert_eq!(out, Value::List(values));
}

#[test]
fn test_pack_arity_mismatch() {
    let desc = compile(&Value::List(vec![field("a", "i4")]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let err = pack(&desc, &[], &scope).unwrap_err();
    assert_eq!(err, FfiError::Arity { expected: 1, got: 0 });
}

#[test]
fn test_short_array_is_range_error() {
    let desc = compile(&Value::List(vec![array_field("arr", "i4", 3)]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let short = vec![Value::list(vec![Value::Int(1), Value::Int(2)])];
    let err = pack(&desc, &short, &scope).unwrap_err();
    assert!(matches!(err, FfiError::Range(_)));
}

#[test]
fn test_array_round_trip_ignores_extra_elements() {
    let desc = compile(&Value::List(vec![array_field("arr", "i2", 3)]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let input = vec![Value::list(vec![
        Value::Int(10),
        Value::Int(-20),
        Value::Int(30),
        Value::Int(999), // beyond the declared count, ignored
    ])];
    let buf = pack(&desc, &input, &scope).unwrap();
    let out = unsafe { unpack(buf, None, &desc, false) }.unwrap();
    assert_eq!(
        out,
        Value::List(vec![Value::list(vec![
            Value::Int(10),
            Value::Int(-20),
            Value::Int(30),
        ])])
    );
}

#[test]
fn test_cstr_round_trip() {
    let desc = compile(&Value::List(vec![field("s", "cstr"), field("n", "i4")]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(
        &desc,
        &[Value::str("hello"), Value::Int(5)],
        &scope,
    )
    .unwrap();
    let out = unsafe { unpack(buf, Some(desc.size()), &desc, false) }.unwrap();
    assert_eq!(
        out,
        Value::List(vec![Value::str("hello"), Value::Int(5)])
    );
}

#[test]
fn test_wstr_round_trip_non_ascii() {
    let desc = compile(&Value::List(vec![field("s", "wstr")]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &[Value::str("héllo ✓")], &scope).unwrap();
    let out = unsafe { unpack(buf, None, &desc, false) }.unwrap();
    assert_eq!(out, Value::List(vec![Value::str("héllo ✓")]));
}

#[test]
fn test_nil_string_is_null_pointer() {
    let desc = compile(&Value::List(vec![field("s", "cstr")]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &[Value::Nil], &scope).unwrap();
    assert!(buf.iter().all(|&b| b == 0), "null pointer stored");
    let out = unsafe { unpack(buf, None, &desc, false) }.unwrap();
    assert_eq!(out, Value::List(vec![Value::Nil]));
}

#[test]
fn test_sid_round_trip() {
    let desc = compile(&Value::List(vec![field("owner", "psid")]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &[Value::str("S-1-5-21-1-2-3")], &scope).unwrap();
    let out = unsafe { unpack(buf, None, &desc, false) }.unwrap();
    assert_eq!(out, Value::List(vec![Value::str("S-1-5-21-1-2-3")]));
}

#[test]
fn test_invalid_sid_text_rejected() {
    let desc = compile(&Value::List(vec![field("owner", "psid")]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let err = pack(&desc, &[Value::str("T-1-5")], &scope).unwrap_err();
    assert!(matches!(err, FfiError::Definition(_)));
}

#[test]
fn test_cbsize_defaults_to_struct_size() {
    let desc = compile(
        &Value::List(vec![field("cb", "cbsize"), field("x", "i4")]),
        false,
    )
    .unwrap();
    assert_eq!(desc.size(), 8);

    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &[Value::Int(0), Value::Int(1)], &scope).unwrap();
    let out = unsafe { unpack(buf, None, &desc, false) }.unwrap();
    assert_eq!(out, Value::List(vec![Value::Int(8), Value::Int(1)]));
}

#[test]
fn test_cbsize_accepts_in_range_and_rejects_out_of_range() {
    let desc = compile(
        &Value::List(vec![field("cb", "cbsize"), field("x", "i4")]),
        false,
    )
    .unwrap();
    let mut arena = Arena::new();

    {
        let scope = arena.scope();
        let buf = pack(&desc, &[Value::Int(4), Value::Int(0)], &scope).unwrap();
        let out = unsafe { unpack(buf, None, &desc, false) }.unwrap();
        assert_eq!(out, Value::List(vec![Value::Int(4), Value::Int(0)]));
    }

    let scope = arena.scope();
    for bad in [-1, 9] {
        let err = pack(&desc, &[Value::Int(bad), Value::Int(0)], &scope).unwrap_err();
        assert!(matches!(err, FfiError::Range(_)), "cbsize {}", bad);
    }
}

#[test]
fn test_nested_struct_round_trip() {
    let child = Value::List(vec![field("x", "i4"), field("y", "i4")]);
    let desc = compile(
        &Value::List(vec![field("a", "i1"), struct_field("b", child)]),
        false,
    )
    .unwrap();
    let values = vec![
        Value::Int(7),
        Value::list(vec![Value::Int(-1), Value::Int(2)]),
    ];

    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &values, &scope).unwrap();
    let out = unsafe { unpack(buf, Some(desc.size()), &desc, false) }.unwrap();
    assert_eq!(out, Value::List(values));
}

#[test]
fn test_struct_array_round_trip() {
    let child = Value::List(vec![field("x", "i2"), field("y", "i2")]);
    let desc = compile(
        &Value::List(vec![Value::list(vec![
            Value::str("pts"),
            Value::str("struct"),
            Value::Int(2),
            child,
        ])]),
        false,
    )
    .unwrap();
    let values = vec![Value::list(vec![
        Value::list(vec![Value::Int(1), Value::Int(2)]),
        Value::list(vec![Value::Int(3), Value::Int(4)]),
    ])];

    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &values, &scope).unwrap();
    let out = unsafe { unpack(buf, None, &desc, false) }.unwrap();
    assert_eq!(out, Value::List(values));
}

#[test]
fn test_named_unpack_interleaves_names() {
    let desc = compile(
        &Value::List(vec![field("alpha", "i4"), field("beta", "bool")]),
        false,
    )
    .unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &[Value::Int(9), Value::Bool(false)], &scope).unwrap();
    let out = unsafe { unpack(buf, None, &desc, true) }.unwrap();
    assert_eq!(
        out,
        Value::List(vec![
            Value::str("alpha"),
            Value::Int(9),
            Value::str("beta"),
            Value::Bool(false),
        ])
    );
}

#[test]
fn test_declared_size_checked_unless_sentinel() {
    let desc = compile(&Value::List(vec![field("a", "i4")]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &[Value::Int(1)], &scope).unwrap();

    let err = unsafe { unpack(buf, Some(3), &desc, false) }.unwrap_err();
    assert!(matches!(err, FfiError::Range(_)));

    // Trust-caller sentinel skips the declared-size check.
    assert!(unsafe { unpack(buf, None, &desc, false) }.is_ok());
}

#[test]
fn test_unpack_rejects_short_buffer() {
    let desc = compile(&Value::List(vec![field("a", "i8")]), false).unwrap();
    let err = unsafe { unpack(&[0u8; 4], None, &desc, false) }.unwrap_err();
    assert!(matches!(err, FfiError::Range(_)));
}

fn wide_definition(nfields: usize) -> Value {
    Value::List(
        (0..nfields)
            .map(|i| field(&format!("f{}", i), "i4"))
            .collect(),
    )
}

#[test]
fn test_unpack_capacity_guard_positional() {
    let desc = compile(&wide_definition(MAX_UNPACK_VALUES + 1), false).unwrap();
    let values: Vec<Value> = (0..desc.len() as i64).map(Value::Int).collect();

    let mut arena = Arena::new();
    let scope = arena.scope();
    // Packing is unbounded; only unpack staging is capped.
    let buf = pack(&desc, &values, &scope).unwrap();

    let err = unsafe { unpack(buf, None, &desc, false) }.unwrap_err();
    assert!(matches!(err, FfiError::Range(_)));

    // Exactly at the cap is fine.
    let desc = compile(&wide_definition(MAX_UNPACK_VALUES), false).unwrap();
    let values: Vec<Value> = (0..desc.len() as i64).map(Value::Int).collect();
    let buf = pack(&desc, &values, &scope).unwrap();
    assert!(unsafe { unpack(buf, None, &desc, false) }.is_ok());
}

#[test]
fn test_unpack_capacity_guard_named() {
    let desc = compile(&wide_definition(MAX_UNPACK_NAMED + 1), false).unwrap();
    let values: Vec<Value> = (0..desc.len() as i64).map(Value::Int).collect();

    let mut arena = Arena::new();
    let scope = arena.scope();
    let buf = pack(&desc, &values, &scope).unwrap();

    let err = unsafe { unpack(buf, None, &desc, true) }.unwrap_err();
    assert!(matches!(err, FfiError::Range(_)));

    // The same descriptor still unpacks positionally.
    assert!(unsafe { unpack(buf, None, &desc, false) }.is_ok());
}

#[test]
fn test_type_mismatch_propagates() {
    let desc = compile(&Value::List(vec![field("a", "i4")]), false).unwrap();
    let mut arena = Arena::new();
    let scope = arena.scope();
    let err = pack(&desc, &[Value::str("seven")], &scope).unwrap_err();
    assert!(matches!(err, FfiError::TypeMismatch(_)));
}

proptest! {
    // Round trip over exactly representable primitive fields.
    #[test]
    fn prop_primitive_round_trip(
        a in -128i64..=127,
        b in -32768i64..=32767,
        c in any::<i32>(),
        d in any::<i64>(),
        e in 0i64..=255,
        f in any::<bool>(),
        g in -1e300f64..1e300,
    ) {
        let desc = compile(
            &Value::List(vec![
                field("a", "i1"),
                field("b", "i2"),
                field("c", "i4"),
                field("d", "i8"),
                field("e", "ui1"),
                field("f", "bool"),
                field("g", "r8"),
            ]),
            false,
        )
        .unwrap();
        let values = vec![
            Value::Int(a),
            Value::Int(b),
            Value::Int(c as i64),
            Value::Int(d),
            Value::Int(e),
            Value::Bool(f),
            Value::Float(g),
        ];

        let mut arena = Arena::new();
        let scope = arena.scope();
        let buf = pack(&desc, &values, &scope).unwrap();
        let out = unsafe { unpack(buf, Some(desc.size()), &desc, false) }.unwrap();
        prop_assert_eq!(out, Value::List(values));
    }

    // The raw 64-bit pattern survives ui8 regardless of sign.
    #[test]
    fn prop_ui8_keeps_bit_pattern(d in any::<i64>()) {
        let desc = compile(&Value::List(vec![field("d", "ui8")]), false).unwrap();
        let mut arena = Arena::new();
        let scope = arena.scope();
        let buf = pack(&desc, &[Value::Int(d)], &scope).unwrap();
        let out = unsafe { unpack(buf, None, &desc, false) }.unwrap();
        prop_assert_eq!(out, Value::List(vec![Value::Int(d)]));
    }
}
