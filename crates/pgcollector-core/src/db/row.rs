//! Typed result rows.
//!
//! Every collector consumes query results as [`Row`]s: an ordered mapping
//! from column name to a [`Value`]. The value type is deliberately small so
//! that the conversions done at the driver boundary (numeric to float,
//! timestamps to UTC, arrays to JSON) are explicit and testable.

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Format used when timestamps are rendered into the payload.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%:z";

/// A single column value.
///
/// `numeric` columns never appear as their own variant: they are coerced to
/// [`Value::Float`] when the row is read, since the payload format has no
/// arbitrary-precision type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as a float, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Text(v) => serializer.serialize_str(v),
            Value::Timestamp(v) => serializer.collect_str(&v.format(TIMESTAMP_FORMAT)),
            Value::Json(v) => v.serialize(serializer),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One result row: column names in server order, no duplicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    /// Sets a column. An existing column keeps its position and gets the new value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    /// Removes a column and returns its value.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        let idx = self.columns.iter().position(|(n, _)| n == name)?;
        Some(self.columns.remove(idx).1)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn take_i64(&mut self, name: &str) -> Option<i64> {
        self.take(name).and_then(|v| v.as_i64())
    }

    pub fn take_string(&mut self, name: &str) -> Option<String> {
        self.take(name).and_then(Value::into_string)
    }

    /// Moves every column starting with `prefix` into a new row, stripping the prefix.
    pub fn take_prefixed(&mut self, prefix: &str) -> Row {
        let mut taken = Row::new();
        let mut kept = Vec::with_capacity(self.columns.len());
        for (name, value) in self.columns.drain(..) {
            match name.strip_prefix(prefix) {
                Some(stripped) => taken.columns.push((stripped.to_string(), value)),
                None => kept.push((name, value)),
            }
        }
        self.columns = kept;
        taken
    }

    /// Copies all columns of `other` into this row; `other` wins on name clashes.
    pub fn merge(&mut self, other: Row) {
        for (name, value) in other.columns {
            self.insert(name, value);
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            row.insert(name, value);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Builds a [`Row`] from `name => value` pairs.
///
/// ```
/// use pgcollector_core::row;
///
/// let row = row! { "relid" => 16384, "name" => "users" };
/// assert_eq!(row.get_i64("relid"), Some(16384));
/// ```
#[macro_export]
macro_rules! row {
    () => { $crate::db::Row::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut row = $crate::db::Row::new();
        $( row.insert($name, $value); )+
        row
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn insert_replaces_in_place() {
        let mut row = row! { "a" => 1, "b" => 2 };
        row.insert("a", 10);
        assert_eq!(row.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(row.get_i64("a"), Some(10));
    }

    #[test]
    fn take_prefixed_splits_columns() {
        let mut row = row! {
            "pq_normalized_query" => "SELECT ?",
            "p_planid" => 7,
            "pq_calls" => 3,
            "p_query" => "SELECT 1",
        };
        let query = row.take_prefixed("pq_");
        let plan = row.take_prefixed("p_");

        assert!(row.is_empty());
        assert_eq!(
            query.names().collect::<Vec<_>>(),
            vec!["normalized_query", "calls"]
        );
        assert_eq!(plan.get_i64("planid"), Some(7));
        assert_eq!(plan.get_str("query"), Some("SELECT 1"));
    }

    #[test]
    fn merge_overwrites_existing_columns() {
        let mut index = row! { "name" => "users_pkey", "idx_scan" => Value::Null };
        index.merge(row! { "idx_scan" => 42, "idx_tup_read" => 100 });
        assert_eq!(index.get_i64("idx_scan"), Some(42));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn serializes_as_ordered_map() {
        let ts = Utc.with_ymd_and_hms(2014, 3, 1, 12, 30, 0).unwrap();
        let row = row! {
            "z" => 1,
            "a" => Value::Null,
            "at" => ts,
            "ratio" => 0.5,
        };
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(
            json,
            r#"{"z":1,"a":null,"at":"2014-03-01 12:30:00+00:00","ratio":0.5}"#
        );
    }

    #[test]
    fn option_converts_to_null() {
        let none: Option<i64> = None;
        assert!(Value::from(none).is_null());
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }
}
