//! # Values, Documents and Arrays
//!
//! [`Value`] is the tagged union of everything a document field can hold.
//! [`Document`] keeps its fields in insertion order, which the codec
//! preserves, so encode/decode is an exact round trip including ordering.
//! [`Array`] is homogeneous: the element type is stored once and every
//! element body is encoded without its own tag.

use eyre::{bail, Result};

/// Type tags as they appear on disk. Also used to describe a B-tree's key
/// type (only `String` and `UInt64` keys are supported there).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Null = 0,
    Double = 1,
    String = 2,
    Document = 3,
    Array = 4,
    Binary = 5,
    Boolean = 6,
    DateTime = 7,
    Int32 = 8,
    Int64 = 9,
    UInt64 = 10,
}

impl DataType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => DataType::Null,
            1 => DataType::Double,
            2 => DataType::String,
            3 => DataType::Document,
            4 => DataType::Array,
            5 => DataType::Binary,
            6 => DataType::Boolean,
            7 => DataType::DateTime,
            8 => DataType::Int32,
            9 => DataType::Int64,
            10 => DataType::UInt64,
            _ => bail!("unknown document type tag: {}", tag),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Double(f64),
    String(String),
    Document(Document),
    Array(Array),
    Binary(Vec<u8>),
    Boolean(bool),
    /// Microseconds since the Unix epoch.
    DateTime(i64),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Double(_) => DataType::Double,
            Value::String(_) => DataType::String,
            Value::Document(_) => DataType::Document,
            Value::Array(_) => DataType::Array,
            Value::Binary(_) => DataType::Binary,
            Value::Boolean(_) => DataType::Boolean,
            Value::DateTime(_) => DataType::DateTime,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt64(_) => DataType::UInt64,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<i64> {
        match self {
            Value::DateTime(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt64(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// Homogeneous array: one element type, bodies encoded without tags.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element_type: DataType,
    values: Vec<Value>,
}

impl Array {
    pub fn new(element_type: DataType) -> Self {
        Self {
            element_type,
            values: Vec::new(),
        }
    }

    pub fn element_type(&self) -> DataType {
        self.element_type
    }

    /// Appends an element; its type must match the array's element type.
    pub fn push(&mut self, value: Value) -> Result<()> {
        ensure_type(&value, self.element_type)?;
        self.values.push(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }
}

fn ensure_type(value: &Value, expected: DataType) -> Result<()> {
    if value.data_type() != expected {
        bail!(
            "array element type mismatch: expected {:?}, got {:?}",
            expected,
            value.data_type()
        );
    }
    Ok(())
}

/// Conversion out of a [`Value`], for the typed document getters. A
/// mismatched value type converts to `None`, never to an error.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_i32()
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_u64()
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_binary().map(<[u8]>::to_vec)
    }
}

/// An ordered collection of named fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Appends a field. Names are not deduplicated; lookups return the
    /// first match.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(Value::as_u64)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        self.get(name).and_then(Value::as_i32)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Generic typed getter over [`FromValue`]:
    /// `doc.get_as::<u64>("pk")`.
    pub fn get_as<T: FromValue>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(T::from_value)
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_name(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|(name, _)| name.as_str())
    }

    pub fn field_type(&self, index: usize) -> Option<DataType> {
        self.fields.get(index).map(|(_, value)| value.data_type())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, Value)> {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_data_types() {
        assert_eq!(Value::Null.data_type(), DataType::Null);
        assert_eq!(Value::from(1.5).data_type(), DataType::Double);
        assert_eq!(Value::from("x").data_type(), DataType::String);
        assert_eq!(Value::from(true).data_type(), DataType::Boolean);
        assert_eq!(Value::from(3i32).data_type(), DataType::Int32);
        assert_eq!(Value::from(3i64).data_type(), DataType::Int64);
        assert_eq!(Value::from(3u64).data_type(), DataType::UInt64);
    }

    #[test]
    fn document_insert_and_get() {
        let mut doc = Document::new();
        doc.insert("name", "George").insert("age", 24i32);

        assert_eq!(doc.get_str("name"), Some("George"));
        assert_eq!(doc.get_i32("age"), Some(24));
        assert_eq!(doc.get("missing"), None);
        assert_eq!(doc.num_fields(), 2);
    }

    #[test]
    fn document_typed_getter_rejects_wrong_type() {
        let mut doc = Document::new();
        doc.insert("age", 24i32);

        assert_eq!(doc.get_u64("age"), None);
        assert_eq!(doc.get_i32("age"), Some(24));
    }

    #[test]
    fn document_preserves_field_order() {
        let mut doc = Document::new();
        doc.insert("z", 1u64).insert("a", 2u64).insert("m", 3u64);

        assert_eq!(doc.field_name(0), Some("z"));
        assert_eq!(doc.field_name(1), Some("a"));
        assert_eq!(doc.field_name(2), Some("m"));
    }

    #[test]
    fn array_enforces_homogeneity() {
        let mut array = Array::new(DataType::Int32);
        array.push(Value::Int32(1)).unwrap();
        array.push(Value::Int32(2)).unwrap();

        assert!(array.push(Value::String("nope".into())).is_err());
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn generic_getter_dispatches_by_type() {
        let mut doc = Document::new();
        doc.insert("pk", 7u64)
            .insert("name", "George")
            .insert("score", 1.5)
            .insert("active", true);

        assert_eq!(doc.get_as::<u64>("pk"), Some(7));
        assert_eq!(doc.get_as::<String>("name"), Some("George".to_owned()));
        assert_eq!(doc.get_as::<f64>("score"), Some(1.5));
        assert_eq!(doc.get_as::<bool>("active"), Some(true));
        // Type mismatches are None, not errors.
        assert_eq!(doc.get_as::<i32>("pk"), None);
        assert_eq!(doc.get_as::<u64>("missing"), None);
    }

    #[test]
    fn nested_document_access() {
        let mut inner = Document::new();
        inner.insert("city", "Athens");
        let mut outer = Document::new();
        outer.insert("address", Value::Document(inner));

        let address = outer.get("address").unwrap().as_document().unwrap();
        assert_eq!(address.get_str("city"), Some("Athens"));
    }
}
