use crate::point_value::PointValue;
use crate::value::Value;
use tracing::warn;

/// Encode/decode/normalize/denormalize plugin attached to a point.
///
/// All hooks are value-to-value: they never mutate their argument and
/// return the replacement payload for the corresponding operation.
pub trait Content: Send + Sync {
    fn encode(&self, value: &PointValue) -> Value {
        value.value().clone()
    }

    fn decode(&self, value: &PointValue) -> Value {
        value.value().clone()
    }

    fn normalize(&self, value: &PointValue) -> Value;

    fn denormalize(&self, value: &PointValue) -> Value {
        value.value().clone()
    }
}

/// Passes everything through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityContent;

impl Content for IdentityContent {
    fn normalize(&self, value: &PointValue) -> Value {
        value.value().clone()
    }
}

/// Normalizes to a double.
#[derive(Clone, Copy, Debug, Default)]
pub struct FloatingContent;

impl Content for FloatingContent {
    fn normalize(&self, value: &PointValue) -> Value {
        match value.value().to_double() {
            Some(double) => Value::Double(double),
            None => {
                if !value.value().is_null() {
                    warn!("value {} does not normalize to a double", value.value());
                }
                Value::Null
            }
        }
    }
}

/// Normalizes to a long.
#[derive(Clone, Copy, Debug, Default)]
pub struct CountContent;

impl Content for CountContent {
    fn normalize(&self, value: &PointValue) -> Value {
        match value.value().to_long() {
            Some(long) => Value::Long(long),
            None => {
                if !value.value().is_null() {
                    warn!("value {} does not normalize to a long", value.value());
                }
                Value::Null
            }
        }
    }
}
