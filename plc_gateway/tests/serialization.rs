use plc_gateway::error::GatewayError;
use plc_gateway::tags::structures::{Datatype, PlcName, Quality, TagRecord, Value};
use serde_json::json;

fn record(datatype: Datatype, value: Value) -> TagRecord {
    TagRecord::new("t", PlcName::Mock, "A1", datatype, value, false, 0).expect("record")
}

#[test]
fn decimal_survives_the_round_trip_exactly() {
    // Written as the JSON string "1.2300", read back character for
    // character, trailing zeros included.
    let value = Value::from_json(Datatype::Decimal, &json!("1.2300")).unwrap();
    let encoded = serde_json::to_value(record(Datatype::Decimal, value)).unwrap();

    assert_eq!(encoded["value"], json!("1.2300"));
    assert_eq!(encoded["value"].as_str().unwrap(), "1.2300");
}

#[test]
fn decimal_accepts_json_numbers_too() {
    let value = Value::from_json(Datatype::Decimal, &json!(1.25)).unwrap();
    let encoded = serde_json::to_value(record(Datatype::Decimal, value)).unwrap();
    assert_eq!(encoded["value"], json!("1.25"));

    let value = Value::from_json(Datatype::Decimal, &json!(7)).unwrap();
    let encoded = serde_json::to_value(record(Datatype::Decimal, value)).unwrap();
    assert_eq!(encoded["value"], json!("7"));
}

#[test]
fn decimal_rejects_garbage_text() {
    let err = Value::from_json(Datatype::Decimal, &json!("not a number")).unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));
}

#[test]
fn integers_stay_json_numbers() {
    let value = Value::from_json(Datatype::Int, &json!(7)).unwrap();
    let encoded = serde_json::to_value(record(Datatype::Int, value)).unwrap();

    assert!(encoded["value"].is_number());
    assert_eq!(encoded["value"], json!(7));
}

#[test]
fn reals_stay_json_numbers() {
    let value = Value::from_json(Datatype::Real, &json!(2.5)).unwrap();
    let encoded = serde_json::to_value(record(Datatype::Real, value)).unwrap();

    assert!(encoded["value"].is_number());
    assert_eq!(encoded["value"], json!(2.5));
}

#[test]
fn non_finite_reals_encode_null_with_bad_quality() {
    let encoded = serde_json::to_value(record(Datatype::Real, Value::Real(f64::NAN))).unwrap();
    assert_eq!(encoded["value"], json!(null));
    assert_eq!(encoded["quality"], json!("Bad"));

    let encoded =
        serde_json::to_value(record(Datatype::Real, Value::Real(f64::INFINITY))).unwrap();
    assert_eq!(encoded["value"], json!(null));
    assert_eq!(encoded["quality"], json!("Bad"));

    // A finite real keeps its own quality.
    let encoded = serde_json::to_value(record(Datatype::Real, Value::Real(1.0))).unwrap();
    assert_eq!(encoded["quality"], json!("Good"));
}

#[test]
fn bool_and_string_keep_native_forms() {
    let encoded = serde_json::to_value(record(Datatype::Bool, Value::Bool(true))).unwrap();
    assert_eq!(encoded["value"], json!(true));

    let encoded =
        serde_json::to_value(record(Datatype::String, Value::Text("line 3".into()))).unwrap();
    assert_eq!(encoded["value"], json!("line 3"));
}

#[test]
fn uninitialized_encodes_null() {
    let encoded = serde_json::to_value(record(Datatype::Int, Value::Null)).unwrap();
    assert_eq!(encoded["value"], json!(null));
    assert_eq!(encoded["quality"], json!("Uninitialized"));
    assert_eq!(encoded["last_update_ns"], json!(0));
}

#[test]
fn native_shapes_are_enforced_by_the_parser() {
    // A quoted number is not an Int.
    assert!(matches!(
        Value::from_json(Datatype::Int, &json!("7")),
        Err(GatewayError::TypeMismatch(_))
    ));
    // A fractional number is not an Int.
    assert!(matches!(
        Value::from_json(Datatype::Int, &json!(1.5)),
        Err(GatewayError::TypeMismatch(_))
    ));
    // A number is not a String.
    assert!(matches!(
        Value::from_json(Datatype::String, &json!(1)),
        Err(GatewayError::TypeMismatch(_))
    ));
    // An integer number is a fine Real.
    assert!(Value::from_json(Datatype::Real, &json!(3)).is_ok());
}

#[test]
fn record_wire_shape_is_stable() {
    let tag = TagRecord::new(
        "T",
        PlcName::CompactLogix,
        "Main.Temp",
        Datatype::Decimal,
        Value::from_json(Datatype::Decimal, &json!("21.50")).unwrap(),
        true,
        2,
    )
    .unwrap();
    let encoded = serde_json::to_value(&tag).unwrap();

    assert_eq!(
        encoded,
        json!({
            "id": "T",
            "plc": "compactlogix",
            "address": "Main.Temp",
            "datatype": "Decimal",
            "value": "21.50",
            "quality": "Good",
            "last_update_ns": 0,
            "writable": true,
            "scale": 2,
        })
    );
    assert_eq!(tag.quality, Quality::Good);
}
