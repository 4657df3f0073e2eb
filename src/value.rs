//! # Value Model
//!
//! ## Responsibility
//! Coerce loosely typed configuration text (YAML scalars, query result cells,
//! environment entries) into comparable runtime values, and render them back
//! into a form a database session can bind.
//!
//! ## Guarantees
//! - Comparisons never panic: values of unrelated kinds are simply unordered.
//! - `Int` and `Double` compare numerically against each other.
//! - Durations and capacities render in a canonical textual form (`10s`, `2G`)
//!   that the target database accepts back.
//!
//! ## NOT Responsible For
//! - Deciding whether a change is needed (see [`crate::expr::Condition`]).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;

use crate::error::{OptimizeError, Result};

/// Named template parameters and shared environment entries.
pub type Params = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// ValueType
// ---------------------------------------------------------------------------

/// Declared type of a tunable value, used to coerce desired and queried values
/// to the same kind before they are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    Bool,
    Int,
    Double,
    Duration,
    Capacity,
    #[default]
    String,
    List,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Double => write!(f, "double"),
            ValueType::Duration => write!(f, "duration"),
            ValueType::Capacity => write!(f, "capacity"),
            ValueType::String => write!(f, "string"),
            ValueType::List => write!(f, "list"),
        }
    }
}

impl FromStr for ValueType {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(ValueType::Bool),
            "int" | "integer" => Ok(ValueType::Int),
            "double" | "float" => Ok(ValueType::Double),
            "duration" | "time" => Ok(ValueType::Duration),
            "capacity" => Ok(ValueType::Capacity),
            "string" | "str" => Ok(ValueType::String),
            "list" | "string_list" => Ok(ValueType::List),
            other => Err(OptimizeError::Value {
                value: other.to_string(),
                value_type: "value_type".to_string(),
            }),
        }
    }
}

impl ValueType {
    /// Coerce a raw value into this type.
    pub fn coerce(&self, raw: &Value) -> Result<TypedValue> {
        let fail = || OptimizeError::Value {
            value: scalar_text(raw),
            value_type: self.to_string(),
        };
        match self {
            ValueType::Bool => match raw {
                Value::Bool(b) => Ok(TypedValue::Bool(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(TypedValue::Bool(false)),
                    Some(1) => Ok(TypedValue::Bool(true)),
                    _ => Err(fail()),
                },
                Value::String(s) => parse_bool(s).map(TypedValue::Bool).ok_or_else(fail),
                _ => Err(fail()),
            },
            ValueType::Int => match raw {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(TypedValue::Int)
                    .ok_or_else(fail),
                Value::String(s) => s.trim().parse().map(TypedValue::Int).map_err(|_| fail()),
                _ => Err(fail()),
            },
            ValueType::Double => match raw {
                Value::Number(n) => n.as_f64().map(TypedValue::Double).ok_or_else(fail),
                Value::String(s) => s.trim().parse().map(TypedValue::Double).map_err(|_| fail()),
                _ => Err(fail()),
            },
            ValueType::Duration => parse_duration(&scalar_text(raw))
                .map(TypedValue::Duration)
                .ok_or_else(fail),
            ValueType::Capacity => parse_capacity(&scalar_text(raw))
                .map(TypedValue::Capacity)
                .ok_or_else(fail),
            ValueType::String => match raw {
                Value::Null => Ok(TypedValue::None),
                other => Ok(TypedValue::Str(scalar_text(other))),
            },
            ValueType::List => match raw {
                Value::Array(items) => Ok(TypedValue::List(items.iter().map(scalar_text).collect())),
                Value::Null => Ok(TypedValue::List(Vec::new())),
                other => Ok(TypedValue::List(
                    scalar_text(other)
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                )),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// TypedValue
// ---------------------------------------------------------------------------

/// A runtime value after coercion.
#[derive(Debug, Clone)]
pub enum TypedValue {
    None,
    Bool(bool),
    Int(i64),
    Double(f64),
    Duration(Duration),
    /// Size in bytes.
    Capacity(u64),
    Str(String),
    List(Vec<String>),
}

impl TypedValue {
    /// Best-effort conversion of an untyped JSON value, used for environment
    /// entries referenced from expressions.
    pub fn from_json(raw: &Value) -> Self {
        match raw {
            Value::Null => TypedValue::None,
            Value::Bool(b) => TypedValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => TypedValue::Int(i),
                None => TypedValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => TypedValue::Str(s.clone()),
            Value::Array(items) => TypedValue::List(items.iter().map(scalar_text).collect()),
            Value::Object(_) => TypedValue::Str(raw.to_string()),
        }
    }

    /// Render into a value that can be bound as a statement argument.
    pub fn to_json(&self) -> Value {
        match self {
            TypedValue::None => Value::Null,
            TypedValue::Bool(b) => Value::Bool(*b),
            TypedValue::Int(i) => Value::from(*i),
            TypedValue::Double(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            TypedValue::Duration(_) | TypedValue::Capacity(_) => Value::String(self.to_string()),
            TypedValue::Str(s) => Value::String(s.clone()),
            TypedValue::List(items) => Value::String(items.join(",")),
        }
    }

    /// Truthiness used by boolean operators in expressions.
    pub fn is_truthy(&self) -> bool {
        match self {
            TypedValue::None => false,
            TypedValue::Bool(b) => *b,
            TypedValue::Int(i) => *i != 0,
            TypedValue::Double(f) => *f != 0.0,
            TypedValue::Duration(d) => !d.is_zero(),
            TypedValue::Capacity(c) => *c != 0,
            TypedValue::Str(s) => !s.is_empty(),
            TypedValue::List(items) => !items.is_empty(),
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Int(i) => Some(*i as f64),
            TypedValue::Double(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypedValue::None, TypedValue::None) => true,
            (TypedValue::Bool(a), TypedValue::Bool(b)) => a == b,
            (TypedValue::Duration(a), TypedValue::Duration(b)) => a == b,
            (TypedValue::Capacity(a), TypedValue::Capacity(b)) => a == b,
            (TypedValue::Str(a), TypedValue::Str(b)) => a == b,
            (TypedValue::List(a), TypedValue::List(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl PartialOrd for TypedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (TypedValue::None, TypedValue::None) => Some(Ordering::Equal),
            (TypedValue::Bool(a), TypedValue::Bool(b)) => a.partial_cmp(b),
            (TypedValue::Duration(a), TypedValue::Duration(b)) => a.partial_cmp(b),
            (TypedValue::Capacity(a), TypedValue::Capacity(b)) => a.partial_cmp(b),
            (TypedValue::Str(a), TypedValue::Str(b)) => a.partial_cmp(b),
            (TypedValue::List(a), TypedValue::List(b)) => a.partial_cmp(b),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::None => write!(f, "none"),
            TypedValue::Bool(b) => write!(f, "{}", b),
            TypedValue::Int(i) => write!(f, "{}", i),
            TypedValue::Double(d) => write!(f, "{}", d),
            TypedValue::Duration(d) => write!(f, "{}", render_duration(*d)),
            TypedValue::Capacity(c) => write!(f, "{}", render_capacity(*c)),
            TypedValue::Str(s) => write!(f, "{}", s),
            TypedValue::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Plain text form of a JSON scalar (strings without quotes).
pub fn scalar_text(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn split_unit(s: &str) -> (&str, String) {
    let s = s.trim();
    let idx = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    (&s[..idx], s[idx..].trim().to_ascii_lowercase())
}

const DURATION_UNITS: [(&str, u64); 5] = [
    ("d", 86_400_000),
    ("h", 3_600_000),
    ("m", 60_000),
    ("s", 1_000),
    ("ms", 1),
];

/// Parse `100ms`, `10s`, `5m`, `1h`, `2d`, `30us`; bare numbers are seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let (number, unit) = split_unit(s);
    let number: f64 = number.parse().ok()?;
    if number < 0.0 {
        return None;
    }
    let secs = match unit.as_str() {
        "us" => number / 1_000_000.0,
        "ms" => number / 1_000.0,
        "" | "s" => number,
        "m" => number * 60.0,
        "h" => number * 3_600.0,
        "d" => number * 86_400.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

fn render_duration(d: Duration) -> String {
    if d.subsec_nanos() % 1_000_000 != 0 {
        return format!("{}us", d.as_micros());
    }
    let ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }
    for (unit, scale) in DURATION_UNITS {
        if ms % scale == 0 {
            return format!("{}{}", ms / scale, unit);
        }
    }
    format!("{}ms", ms)
}

const CAPACITY_UNITS: [(&str, u64); 5] = [
    ("P", 1 << 50),
    ("T", 1 << 40),
    ("G", 1 << 30),
    ("M", 1 << 20),
    ("K", 1 << 10),
];

/// Parse `1024`, `4K`, `4KB`, `512M`, `1.5G`, `2T` (binary multiples).
pub fn parse_capacity(s: &str) -> Option<u64> {
    let (number, unit) = split_unit(s);
    let number: f64 = number.parse().ok()?;
    if number < 0.0 {
        return None;
    }
    let unit = unit.trim_end_matches('b');
    let scale: u64 = match unit {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        "p" => 1 << 50,
        _ => return None,
    };
    Some((number * scale as f64).round() as u64)
}

fn render_capacity(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (unit, scale) in CAPACITY_UNITS {
        if bytes % scale == 0 {
            return format!("{}{}", bytes / scale, unit);
        }
    }
    bytes.to_string()
}
