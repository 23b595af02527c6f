//! Closed set of values the cache knows how to store.
//!
//! Payloads are JSON text. Types JSON cannot carry losslessly get a tagged
//! object form:
//!
//! | kind      | encoding                                   |
//! |-----------|--------------------------------------------|
//! | date/time | `{"$date": "2024-03-01T12:00:00+00:00"}` (RFC 3339) |
//! | decimal   | `{"$decimal": "1234.5600"}` (exact string)  |
//!
//! Everything else maps onto the matching JSON type. Objects are kept in key
//! order so the same value always encodes to the same text.
//!
//! Map keys starting with `$` are written with one extra `$` (`$date` becomes
//! `$$date`) and unescaped on read, so a user map can never be mistaken for a
//! tag. Non-finite floats have no JSON form and fail to encode.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::Error as _, ser, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::{collections::BTreeMap, str::FromStr};

const DATE_TAG: &str = "$date";
const DECIMAL_TAG: &str = "$decimal";
const TAG_SIGIL: char = '$';

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(DateTime<Utc>),
    Decimal(Decimal),
    List(Vec<CacheValue>),
    Map(BTreeMap<String, CacheValue>),
}

impl CacheValue {
    /// Lower to a JSON tree, tagging dates and decimals.
    pub fn to_json(&self) -> Result<Value, String> {
        Ok(match self {
            CacheValue::Null => Value::Null,
            CacheValue::Bool(b) => Value::Bool(*b),
            CacheValue::Integer(i) => Value::Number((*i).into()),
            CacheValue::Float(f) => Value::Number(
                Number::from_f64(*f).ok_or_else(|| format!("float {} has no JSON form", f))?,
            ),
            CacheValue::Text(s) => Value::String(s.clone()),
            CacheValue::Date(d) => tagged(DATE_TAG, d.to_rfc3339()),
            CacheValue::Decimal(d) => tagged(DECIMAL_TAG, d.to_string()),
            CacheValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(CacheValue::to_json)
                    .collect::<Result<_, _>>()?,
            ),
            CacheValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| v.to_json().map(|v| (escape_key(k), v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Lift a JSON tree, recognizing the tagged forms.
    pub fn from_json(value: Value) -> Result<Self, String> {
        Ok(match value {
            Value::Null => CacheValue::Null,
            Value::Bool(b) => CacheValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CacheValue::Integer(i),
                None => CacheValue::Float(
                    n.as_f64()
                        .ok_or_else(|| format!("number {} is out of range", n))?,
                ),
            },
            Value::String(s) => CacheValue::Text(s),
            Value::Array(items) => CacheValue::List(
                items
                    .into_iter()
                    .map(CacheValue::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Self::from_object(map)?,
        })
    }

    fn from_object(map: Map<String, Value>) -> Result<Self, String> {
        if map.len() == 1 {
            if let Some(Value::String(raw)) = map.get(DATE_TAG) {
                let date = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| format!("invalid {} '{}': {}", DATE_TAG, raw, e))?;
                return Ok(CacheValue::Date(date.with_timezone(&Utc)));
            }
            if let Some(Value::String(raw)) = map.get(DECIMAL_TAG) {
                let decimal = Decimal::from_str(raw)
                    .map_err(|e| format!("invalid {} '{}': {}", DECIMAL_TAG, raw, e))?;
                return Ok(CacheValue::Decimal(decimal));
            }
        }
        let entries = map
            .into_iter()
            .map(|(k, v)| CacheValue::from_json(v).map(|v| (unescape_key(k), v)))
            .collect::<Result<_, _>>()?;
        Ok(CacheValue::Map(entries))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CacheValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&CacheValue> {
        match self {
            CacheValue::Map(entries) => entries.get(key),
            _ => None,
        }
    }
}

fn tagged(tag: &str, raw: String) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(tag.to_string(), Value::String(raw));
    Value::Object(map)
}

fn escape_key(key: &str) -> String {
    if key.starts_with(TAG_SIGIL) {
        format!("{}{}", TAG_SIGIL, key)
    } else {
        key.to_string()
    }
}

fn unescape_key(key: String) -> String {
    match key.strip_prefix(TAG_SIGIL) {
        Some(rest) if rest.starts_with(TAG_SIGIL) => rest.to_string(),
        _ => key,
    }
}

impl Serialize for CacheValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(<S::Error as ser::Error>::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CacheValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        CacheValue::from_json(value).map_err(D::Error::custom)
    }
}

impl From<bool> for CacheValue {
    fn from(value: bool) -> Self {
        CacheValue::Bool(value)
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        CacheValue::Integer(value)
    }
}

impl From<i32> for CacheValue {
    fn from(value: i32) -> Self {
        CacheValue::Integer(value.into())
    }
}

impl From<u32> for CacheValue {
    fn from(value: u32) -> Self {
        CacheValue::Integer(value.into())
    }
}

impl From<f64> for CacheValue {
    fn from(value: f64) -> Self {
        CacheValue::Float(value)
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        CacheValue::Text(value.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::Text(value)
    }
}

impl From<DateTime<Utc>> for CacheValue {
    fn from(value: DateTime<Utc>) -> Self {
        CacheValue::Date(value)
    }
}

impl From<Decimal> for CacheValue {
    fn from(value: Decimal) -> Self {
        CacheValue::Decimal(value)
    }
}

impl<T: Into<CacheValue>> From<Vec<T>> for CacheValue {
    fn from(items: Vec<T>) -> Self {
        CacheValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<CacheValue>> From<Option<T>> for CacheValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CacheValue::Null)
    }
}

impl<K: Into<String>, V: Into<CacheValue>> FromIterator<(K, V)> for CacheValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        CacheValue::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
