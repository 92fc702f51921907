use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::drivers::traits::RawValue;
use crate::error::{GatewayError, Result};

/// Represents the quality of a tag's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Stale,
    Bad,
    Uninitialized,
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Uninitialized
    }
}

/// Declared datatype of a tag. Governs the storage shape of `Value` and the
/// JSON form on the REST boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datatype {
    Bool,
    Int,
    Real,
    Decimal,
    String,
}

/// Logical name of an owning controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlcName {
    CompactLogix,
    Slc500,
    Mock,
}

impl fmt::Display for PlcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlcName::CompactLogix => "compactlogix",
            PlcName::Slc500 => "slc500",
            PlcName::Mock => "mock",
        };
        f.write_str(s)
    }
}

/// A stored tag value. `Null` is the never-written state. `Decimal` carries
/// digits and scale exactly and is never demoted to binary floating point.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Decimal(Decimal),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value has the storage shape the datatype demands.
    /// `Null` is allowed for any datatype (uninitialized tags).
    pub fn matches(&self, datatype: Datatype) -> bool {
        matches!(
            (self, datatype),
            (Value::Null, _)
                | (Value::Bool(_), Datatype::Bool)
                | (Value::Int(_), Datatype::Int)
                | (Value::Real(_), Datatype::Real)
                | (Value::Decimal(_), Datatype::Decimal)
                | (Value::Text(_), Datatype::String)
        )
    }

    /// Parse a JSON value into the storage shape for `datatype`.
    ///
    /// Decimal tags accept both JSON strings and JSON numbers; the textual
    /// form of a string is preserved exactly (digits and scale). The other
    /// datatypes accept only their native JSON shape.
    pub fn from_json(datatype: Datatype, json: &serde_json::Value) -> Result<Value> {
        match (datatype, json) {
            (Datatype::Bool, serde_json::Value::Bool(b)) => Ok(Value::Bool(*b)),
            (Datatype::Int, serde_json::Value::Number(n)) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| GatewayError::TypeMismatch(format!("{n} is not an integer"))),
            (Datatype::Real, serde_json::Value::Number(n)) => n
                .as_f64()
                .map(Value::Real)
                .ok_or_else(|| GatewayError::TypeMismatch(format!("{n} is not a real"))),
            (Datatype::Decimal, serde_json::Value::String(s)) => {
                parse_decimal(s).map(Value::Decimal)
            }
            (Datatype::Decimal, serde_json::Value::Number(n)) => {
                parse_decimal(&n.to_string()).map(Value::Decimal)
            }
            (Datatype::String, serde_json::Value::String(s)) => Ok(Value::Text(s.clone())),
            (dt, other) => Err(GatewayError::TypeMismatch(format!(
                "JSON value {other} does not fit datatype {dt:?}"
            ))),
        }
    }

    /// Coerce a raw driver reading to the declared datatype.
    ///
    /// Decimal tags fed from integer PLC registers apply `scale`
    /// (raw 12300 at scale 4 becomes 1.2300); the resulting scale is never
    /// narrowed below `scale`.
    pub fn coerce(raw: &RawValue, datatype: Datatype, scale: u32) -> Result<Value> {
        match (datatype, raw) {
            (Datatype::Bool, RawValue::Bool(b)) => Ok(Value::Bool(*b)),
            (Datatype::Bool, RawValue::Int(i)) => Ok(Value::Bool(*i != 0)),
            (Datatype::Int, RawValue::Int(i)) => Ok(Value::Int(*i)),
            (Datatype::Int, RawValue::Bool(b)) => Ok(Value::Int(i64::from(*b))),
            (Datatype::Real, RawValue::Real(f)) => Ok(Value::Real(*f)),
            (Datatype::Real, RawValue::Int(i)) => Ok(Value::Real(*i as f64)),
            (Datatype::Decimal, RawValue::Int(i)) => Ok(Value::Decimal(Decimal::new(*i, scale))),
            (Datatype::Decimal, RawValue::Real(f)) => {
                let mut d = parse_decimal(&f.to_string())?;
                if d.scale() < scale {
                    d.rescale(scale);
                }
                Ok(Value::Decimal(d))
            }
            (Datatype::Decimal, RawValue::Text(s)) => {
                let mut d = parse_decimal(s)?;
                if d.scale() < scale {
                    d.rescale(scale);
                }
                Ok(Value::Decimal(d))
            }
            (Datatype::String, raw) => Ok(Value::Text(match raw {
                RawValue::Text(s) => s.clone(),
                RawValue::Bool(b) => b.to_string(),
                RawValue::Int(i) => i.to_string(),
                RawValue::Real(f) => f.to_string(),
            })),
            (dt, raw) => Err(GatewayError::TypeMismatch(format!(
                "driver value {raw:?} does not fit datatype {dt:?}"
            ))),
        }
    }

    /// Convert a stored value into a raw value for a driver write. Decimal
    /// values are rescaled to `scale` and written as the unscaled integer.
    pub fn to_raw(&self, scale: u32) -> Result<RawValue> {
        match self {
            Value::Bool(b) => Ok(RawValue::Bool(*b)),
            Value::Int(i) => Ok(RawValue::Int(*i)),
            Value::Real(f) => Ok(RawValue::Real(*f)),
            Value::Text(s) => Ok(RawValue::Text(s.clone())),
            Value::Decimal(d) => {
                let mut c = *d;
                c.rescale(scale);
                i64::try_from(c.mantissa())
                    .map(RawValue::Int)
                    .map_err(|_| GatewayError::InvalidArgument(format!("{d} out of register range")))
            }
            Value::Null => Err(GatewayError::InvalidArgument(
                "cannot write a null value".to_string(),
            )),
        }
    }

    /// Whether the value degrades quality on the wire (non-finite reals
    /// serialize as null and read back as Bad).
    pub fn is_degraded(&self) -> bool {
        matches!(self, Value::Real(f) if !f.is_finite())
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|_| GatewayError::InvalidArgument(format!("'{s}' is not a decimal")))
}

// The value serialization contract:
//   Int        -> JSON number
//   Real       -> JSON number, NaN/Inf -> null
//   Decimal    -> JSON string, digits and scale exact
//   Bool       -> JSON boolean
//   Text       -> JSON string
//   Null       -> JSON null
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Real(f) if f.is_finite() => serializer.serialize_f64(*f),
            Value::Real(_) => serializer.serialize_unit(),
            Value::Decimal(d) => serializer.serialize_str(&d.to_string()),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// Represents a single tag in the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    /// Opaque identifier, unique within the store. Immutable once set.
    pub id: String,
    /// Owning controller. Immutable once set.
    pub plc: PlcName,
    /// Driver-specific address (e.g. "Main.Temp", "N7:0").
    pub address: String,
    /// Declared datatype; governs coercion and serialization. Immutable.
    pub datatype: Datatype,
    /// Most recent value, shaped per `datatype`.
    pub value: Value,
    pub quality: Quality,
    /// Monotonic nanoseconds of the last driver read; 0 = never read.
    pub last_update_ns: u64,
    /// When false, REST/OPC UA writes fail with InvalidArgument.
    pub writable: bool,
    /// Decimal scale applied when coercing integer registers.
    pub scale: u32,
}

impl TagRecord {
    /// Create a record as `POST /tags` or prepopulation would. A supplied
    /// value starts Good (it came from the creator, not a driver read); no
    /// value starts Uninitialized.
    pub fn new(
        id: impl Into<String>,
        plc: PlcName,
        address: impl Into<String>,
        datatype: Datatype,
        value: Value,
        writable: bool,
        scale: u32,
    ) -> Result<Self> {
        if !value.matches(datatype) {
            return Err(GatewayError::TypeMismatch(format!(
                "value {value:?} does not fit datatype {datatype:?}"
            )));
        }
        let quality = if value.is_null() {
            Quality::Uninitialized
        } else {
            Quality::Good
        };
        Ok(TagRecord {
            id: id.into(),
            plc,
            address: address.into(),
            datatype,
            value,
            quality,
            last_update_ns: 0,
            writable,
            scale,
        })
    }

    /// Quality as seen on the wire: a non-finite real reads Bad.
    pub fn wire_quality(&self) -> Quality {
        if self.value.is_degraded() {
            Quality::Bad
        } else {
            self.quality
        }
    }
}

impl Serialize for TagRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("TagRecord", 9)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("plc", &self.plc)?;
        s.serialize_field("address", &self.address)?;
        s.serialize_field("datatype", &self.datatype)?;
        s.serialize_field("value", &self.value)?;
        s.serialize_field("quality", &self.wire_quality())?;
        s.serialize_field("last_update_ns", &self.last_update_ns)?;
        s.serialize_field("writable", &self.writable)?;
        s.serialize_field("scale", &self.scale)?;
        s.end()
    }
}
