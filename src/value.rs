use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A single database value as seen by the mapper: what a column stores, what
/// a placeholder binds, what a snapshot remembers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// UTC instant. Bound as RFC 3339 text.
    DateTime(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::DateTime(_) => "DateTime",
            Value::Json(_) => "Json",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Coerces a raw driver value into the shape declared by a column's
    /// `sql_type`. Unknown types pass through untouched.
    pub fn coerce(self, sql_type: &str) -> Result<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let coerced = match normalized_type(sql_type) {
            TypeClass::Int => match &self {
                Value::Int(_) => Some(self.clone()),
                Value::Float(f) => Some(Value::Int(*f as i64)),
                Value::Bool(b) => Some(Value::Int(*b as i64)),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::Int),
                _ => None,
            },
            TypeClass::Float => match &self {
                Value::Float(_) => Some(self.clone()),
                Value::Int(i) => Some(Value::Float(*i as f64)),
                Value::String(s) => s.trim().parse::<f64>().ok().map(Value::Float),
                _ => None,
            },
            TypeClass::Bool => match &self {
                Value::Bool(_) => Some(self.clone()),
                Value::Int(i) => Some(Value::Bool(*i != 0)),
                Value::String(s) => match s.as_str() {
                    "0" | "false" => Some(Value::Bool(false)),
                    "1" | "true" => Some(Value::Bool(true)),
                    _ => None,
                },
                _ => None,
            },
            TypeClass::DateTime => match &self {
                Value::DateTime(_) => Some(self.clone()),
                Value::Int(secs) => Utc.timestamp_opt(*secs, 0).single().map(Value::DateTime),
                Value::String(s) => parse_datetime(s).map(Value::DateTime),
                _ => None,
            },
            TypeClass::Json => match &self {
                Value::Json(_) => Some(self.clone()),
                Value::String(s) => serde_json::from_str(s).ok().map(Value::Json),
                _ => None,
            },
            TypeClass::Other => Some(self.clone()),
        };
        coerced.ok_or_else(|| {
            Error::hydration(format!("cannot coerce {self:?} to `{sql_type}`"))
        })
    }
}

enum TypeClass {
    Int,
    Float,
    Bool,
    DateTime,
    Json,
    Other,
}

fn normalized_type(sql_type: &str) -> TypeClass {
    // Length suffixes like `varchar(255)` are irrelevant to coercion.
    let base = sql_type
        .split('(')
        .next()
        .unwrap_or(sql_type)
        .trim()
        .to_ascii_lowercase();
    match base.as_str() {
        "int" | "integer" | "smallint" | "bigint" | "serial" | "bigserial" => TypeClass::Int,
        "float" | "double" | "real" | "decimal" | "numeric" => TypeClass::Float,
        "bool" | "boolean" => TypeClass::Bool,
        "datetime" | "timestamp" | "timestamptz" | "date" => TypeClass::DateTime,
        "json" | "jsonb" => TypeClass::Json,
        _ => TypeClass::Other,
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
