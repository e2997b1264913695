use relval_base::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known parameter keys.
pub const PARAM_NULL_REMOVES: &str = "null_removes";
pub const PARAM_RECALC_LATEST: &str = "recalc_latest";
pub const PARAM_FAIL_RETURNS_NULL: &str = "fail_returns_null";
pub const PARAM_REQUIRED: &str = "required";

/// A typed parameter bag for points, relations, transforms and behaviors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.0
            .get(key)
            .and_then(Value::to_boolean)
            .unwrap_or(default)
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::to_long)
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::to_double)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::Str(text)) => Some(text),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let params = Params::new()
            .with(PARAM_NULL_REMOVES, true)
            .with("limit", 25i64)
            .with("ratio", 0.5)
            .with("mode", "fast");

        assert!(params.get_bool(PARAM_NULL_REMOVES, false));
        assert!(!params.get_bool("missing", false));
        assert_eq!(params.get_long("limit"), Some(25));
        assert_eq!(params.get_double("ratio"), Some(0.5));
        assert_eq!(params.get_str("mode"), Some("fast"));
    }
}
