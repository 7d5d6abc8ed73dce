//! Typed operator parameters
//!
//! Every parameter is declared up front with a kind, a default and an
//! optional valid range. Out-of-range values are clamped unless the
//! parameter is declared strict, in which case they are rejected.
//! Float values are compared with an epsilon so that re-setting the same
//! value from a UI slider does not trigger a recompute.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_FLOAT_EPSILON;
use crate::error::ParamError;

/// A parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Name of the value kind, for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        Self::Float(v.into())
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Declaration of a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    pub name: String,
    pub default: ParamValue,
    /// Inclusive valid range for numeric parameters
    pub range: Option<(f64, f64)>,
    /// Reject out-of-range values instead of clamping
    pub strict: bool,
}

impl ParamSpec {
    fn new(name: impl Into<String>, default: ParamValue) -> Self {
        Self {
            name: name.into(),
            default,
            range: None,
            strict: false,
        }
    }

    pub fn float(name: impl Into<String>, default: f64) -> Self {
        Self::new(name, ParamValue::Float(default))
    }

    pub fn int(name: impl Into<String>, default: i64) -> Self {
        Self::new(name, ParamValue::Int(default))
    }

    pub fn bool(name: impl Into<String>, default: bool) -> Self {
        Self::new(name, ParamValue::Bool(default))
    }

    pub fn text(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self::new(name, ParamValue::Text(default.into()))
    }

    /// Restrict to an inclusive range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min.min(max), min.max(max)));
        self
    }

    /// Reject out-of-range values instead of clamping them
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Validate and normalize a candidate value against this declaration
    pub fn validate(&self, value: ParamValue) -> Result<ParamValue, ParamError> {
        let value = match (&self.default, value) {
            (ParamValue::Float(_), ParamValue::Int(v)) => ParamValue::Float(v as f64),
            (ParamValue::Float(_), ParamValue::Float(v)) => ParamValue::Float(v),
            (ParamValue::Int(_), ParamValue::Int(v)) => ParamValue::Int(v),
            (ParamValue::Bool(_), ParamValue::Bool(v)) => ParamValue::Bool(v),
            (ParamValue::Text(_), ParamValue::Text(v)) => ParamValue::Text(v),
            (expected, actual) => {
                return Err(ParamError::KindMismatch {
                    name: self.name.clone(),
                    expected: expected.kind_name().to_string(),
                    actual: actual.kind_name().to_string(),
                })
            }
        };

        match value {
            ParamValue::Float(v) => {
                if !v.is_finite() {
                    return Err(ParamError::NotFinite(self.name.clone()));
                }
                Ok(ParamValue::Float(self.apply_range(v)?))
            }
            ParamValue::Int(v) => Ok(ParamValue::Int(self.apply_int_range(v)?)),
            other => Ok(other),
        }
    }

    /// Range check in the integer domain, so values past 2^53 stay exact
    fn apply_int_range(&self, v: i64) -> Result<i64, ParamError> {
        let Some((min, max)) = self.range else {
            return Ok(v);
        };
        let (lo, hi) = (min.ceil() as i64, max.floor() as i64);
        if (lo..=hi).contains(&v) {
            return Ok(v);
        }
        if self.strict || lo > hi {
            return Err(ParamError::OutOfRange {
                name: self.name.clone(),
                value: v as f64,
                min,
                max,
            });
        }
        Ok(v.clamp(lo, hi))
    }

    fn apply_range(&self, v: f64) -> Result<f64, ParamError> {
        let Some((min, max)) = self.range else {
            return Ok(v);
        };
        if v >= min && v <= max {
            return Ok(v);
        }
        if self.strict {
            return Err(ParamError::OutOfRange {
                name: self.name.clone(),
                value: v,
                min,
                max,
            });
        }
        Ok(v.clamp(min, max))
    }
}

/// The declared parameters of one operator and their current values
#[derive(Debug, Clone)]
pub struct ParamSet {
    specs: Vec<ParamSpec>,
    values: HashMap<String, ParamValue>,
    epsilon: f64,
}

impl Default for ParamSet {
    fn default() -> Self {
        Self {
            specs: Vec::new(),
            values: HashMap::new(),
            epsilon: DEFAULT_FLOAT_EPSILON,
        }
    }
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon.abs();
        self
    }

    pub(crate) fn set_epsilon(&mut self, epsilon: f64) {
        self.epsilon = epsilon.abs();
    }

    /// Declare a parameter, initializing it to its (normalized) default
    ///
    /// Re-declaring a name replaces the earlier declaration.
    pub fn declare(&mut self, spec: ParamSpec) -> Result<(), ParamError> {
        let initial = spec.validate(spec.default.clone())?;
        self.specs.retain(|s| s.name != spec.name);
        self.values.insert(spec.name.clone(), initial);
        self.specs.push(spec);
        Ok(())
    }

    /// Set a value; returns whether it actually changed
    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) -> Result<bool, ParamError> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))?;
        let value = spec.validate(value.into())?;

        let changed = match (self.values.get(name), &value) {
            (Some(ParamValue::Float(old)), ParamValue::Float(new)) => {
                (old - new).abs() > self.epsilon
            }
            (Some(old), new) => old != new,
            (None, _) => true,
        };
        if changed {
            self.values.insert(name.to_string(), value);
        }
        Ok(changed)
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name)?.as_f64()
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParamValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Declared names, in declaration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
