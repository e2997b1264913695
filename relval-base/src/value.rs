use crate::complex::Complex;
use crate::container::{Container, Dict, Tuple};
use crate::rational::{BigRational, Rational};
use crate::state::State;
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// A domain value carried by a point value, either as its value or as its
/// state. The variant set is exactly the set of type codes understood by the
/// binary codec; anything placed into the system must be classifiable here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    BigInteger(BigInt),
    BigDecimal(BigDecimal),
    Rational(Rational),
    BigRational(BigRational),
    Complex(Complex),
    State(State),
    Tuple(Tuple),
    Dict(Dict),
    /// Payload generated elsewhere and carried verbatim; the codec never
    /// produces this for a known variant.
    Opaque(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Coerces to a double. Malformed text is warned about and treated as
    /// an absent value.
    pub fn to_double(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Byte(b) => Some(f64::from(*b)),
            Value::Short(s) => Some(f64::from(*s)),
            Value::Integer(i) => Some(f64::from(*i)),
            Value::Long(l) => Some(*l as f64),
            Value::Float(f) => Some(f64::from(*f)),
            Value::Double(d) => Some(*d),
            Value::BigInteger(i) => i.to_f64(),
            Value::BigDecimal(d) => d.to_f64(),
            Value::Rational(r) => Some(r.to_double()),
            Value::BigRational(r) => Some(r.to_double()),
            Value::Str(text) => match text.trim().parse::<f64>() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    warn!("failed to convert {:?} to a double", text);
                    None
                }
            },
            Value::State(state) => state.code().map(f64::from),
            _ => None,
        }
    }

    /// Coerces to a long. Malformed text is warned about and treated as an
    /// absent value.
    pub fn to_long(&self) -> Option<i64> {
        match self {
            Value::Null => None,
            Value::Boolean(b) => Some(i64::from(*b)),
            Value::Byte(b) => Some(i64::from(*b)),
            Value::Short(s) => Some(i64::from(*s)),
            Value::Integer(i) => Some(i64::from(*i)),
            Value::Long(l) => Some(*l),
            Value::Float(f) => Some(*f as i64),
            Value::Double(d) => Some(*d as i64),
            Value::BigInteger(i) => i.to_i64(),
            Value::BigDecimal(d) => d.to_i64(),
            Value::Rational(r) => Some(r.to_double() as i64),
            Value::BigRational(r) => Some(r.to_double() as i64),
            Value::Str(text) => match text.trim().parse::<i64>() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    warn!("failed to convert {:?} to a long", text);
                    None
                }
            },
            Value::State(state) => state.code().map(i64::from),
            _ => None,
        }
    }

    pub fn to_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Str(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => {
                    warn!("failed to convert {:?} to a boolean", text);
                    None
                }
            },
            Value::Null => None,
            other => other.to_long().map(|l| l != 0),
        }
    }

    /// Freezes any contained container; scalars are immutable already.
    pub fn freeze(&mut self) {
        match self {
            Value::Tuple(tuple) => tuple.freeze(),
            Value::Dict(dict) => dict.freeze(),
            Value::State(state) => state.freeze(),
            _ => {}
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Byte(b) => write!(f, "{b}"),
            Value::Short(s) => write!(f, "{s}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Long(l) => write!(f, "{l}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Double(x) => write!(f, "{x}"),
            Value::Char(c) => write!(f, "{c}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            Value::BigInteger(i) => write!(f, "{i}"),
            Value::BigDecimal(d) => write!(f, "{d}"),
            Value::Rational(r) => write!(f, "{r}"),
            Value::BigRational(r) => write!(f, "{r}"),
            Value::Complex(c) => write!(f, "{c}"),
            Value::State(s) => write!(f, "{s}"),
            Value::Tuple(t) => write!(f, "{t}"),
            Value::Dict(d) => write!(f, "{d}"),
            Value::Opaque(b) => write!(f, "[{} opaque bytes]", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}
