//! Projection of application values into the generic document model.
//!
//! Typed values implement [`ToDocument`]; anything without an impl simply
//! cannot be used as a parameter. The one open position is [`Variant`],
//! which carries dynamically typed parameters: its kinds are checked at
//! runtime, and a kind the document model cannot express is logged and
//! replaced by `null` so the rest of the message still goes out.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::timestamp::format_timestamp;

/// A field-tagged document: the root of every wire message.
pub type Document = Map<String, Value>;

/// Convert an application value into a document value.
pub trait ToDocument {
    fn to_document(&self) -> Value;
}

/// Project a slice into a document list, preserving order.
pub fn project_list<T: ToDocument>(items: &[T]) -> Vec<Value> {
    items.iter().map(ToDocument::to_document).collect()
}

/// Project string-keyed pairs into a document map, preserving order.
pub fn project_map<'a, T, I>(entries: I) -> Document
where
    T: ToDocument + 'a,
    I: IntoIterator<Item = (&'a String, &'a T)>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.clone(), value.to_document()))
        .collect()
}

impl ToDocument for Value {
    fn to_document(&self) -> Value {
        self.clone()
    }
}

impl ToDocument for bool {
    fn to_document(&self) -> Value {
        Value::Bool(*self)
    }
}

macro_rules! integer_to_document {
    ($($ty:ty),*) => {
        $(
            impl ToDocument for $ty {
                fn to_document(&self) -> Value {
                    Value::from(*self)
                }
            }
        )*
    };
}

integer_to_document!(i8, i16, i32, i64, u8, u16, u32, u64);

impl ToDocument for f64 {
    fn to_document(&self) -> Value {
        match Number::from_f64(*self) {
            Some(number) => Value::Number(number),
            None => {
                warn!("Cannot represent non-finite number {} in a document", self);
                Value::Null
            }
        }
    }
}

impl ToDocument for f32 {
    fn to_document(&self) -> Value {
        f64::from(*self).to_document()
    }
}

impl ToDocument for str {
    fn to_document(&self) -> Value {
        Value::String(self.to_string())
    }
}

impl ToDocument for String {
    fn to_document(&self) -> Value {
        Value::String(self.clone())
    }
}

impl ToDocument for DateTime<Utc> {
    fn to_document(&self) -> Value {
        Value::String(format_timestamp(self))
    }
}

impl<T: ToDocument + ?Sized> ToDocument for &T {
    fn to_document(&self) -> Value {
        (**self).to_document()
    }
}

impl<T: ToDocument> ToDocument for Option<T> {
    fn to_document(&self) -> Value {
        match self {
            Some(value) => value.to_document(),
            None => Value::Null,
        }
    }
}

impl<T: ToDocument> ToDocument for Vec<T> {
    fn to_document(&self) -> Value {
        Value::Array(project_list(self))
    }
}

impl<T: ToDocument> ToDocument for [T] {
    fn to_document(&self) -> Value {
        Value::Array(project_list(self))
    }
}

impl<T: ToDocument> ToDocument for BTreeMap<String, T> {
    fn to_document(&self) -> Value {
        Value::Object(project_map(self))
    }
}

impl<T: ToDocument> ToDocument for HashMap<String, T> {
    fn to_document(&self) -> Value {
        // Sort so the same map always produces the same document.
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        Value::Object(project_map(entries))
    }
}

/// A dynamically typed parameter.
///
/// Used where the protocol carries open-ended lists and maps (sync
/// parameters, init data, setup data).
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    List(Vec<Variant>),
    Map(BTreeMap<String, Variant>),
    /// An application type with no document representation.
    Opaque { type_name: String },
}

impl Variant {
    pub fn opaque(type_name: impl Into<String>) -> Self {
        Variant::Opaque {
            type_name: type_name.into(),
        }
    }
}

impl ToDocument for Variant {
    fn to_document(&self) -> Value {
        match self {
            Variant::Null => Value::Null,
            Variant::Bool(b) => Value::Bool(*b),
            Variant::Int(i) => Value::from(*i),
            Variant::UInt(u) => Value::from(*u),
            Variant::Double(d) => d.to_document(),
            Variant::String(s) => Value::String(s.clone()),
            Variant::DateTime(t) => t.to_document(),
            Variant::List(items) => items.to_document(),
            Variant::Map(entries) => entries.to_document(),
            Variant::Opaque { type_name } => {
                warn!("Unknown variant type {}, sending null", type_name);
                Value::Null
            }
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::Bool(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Variant::Int(value.into())
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Variant::Int(value)
    }
}

impl From<u64> for Variant {
    fn from(value: u64) -> Self {
        Variant::UInt(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::Double(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::String(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant::String(value)
    }
}

impl From<DateTime<Utc>> for Variant {
    fn from(value: DateTime<Utc>) -> Self {
        Variant::DateTime(value)
    }
}

impl<T: Into<Variant>> From<Vec<T>> for Variant {
    fn from(value: Vec<T>) -> Self {
        Variant::List(value.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_primitives() {
        assert_eq!(true.to_document(), json!(true));
        assert_eq!(42i32.to_document(), json!(42));
        assert_eq!(i64::MIN.to_document(), json!(i64::MIN));
        assert_eq!(u64::MAX.to_document(), json!(u64::MAX));
        assert_eq!(1.5f64.to_document(), json!(1.5));
        assert_eq!("hi".to_document(), json!("hi"));
    }

    #[test]
    fn test_non_finite_double_becomes_null() {
        assert_eq!(f64::NAN.to_document(), Value::Null);
        assert_eq!(f64::INFINITY.to_document(), Value::Null);
    }

    #[test]
    fn test_nested_collections() {
        let mut inner = BTreeMap::new();
        inner.insert("b".to_string(), vec![1, 2]);
        inner.insert("a".to_string(), vec![]);
        let outer = vec![inner];
        assert_eq!(outer.to_document(), json!([{"a": [], "b": [1, 2]}]));
    }

    #[test]
    fn test_hash_map_is_sorted() {
        let mut map = HashMap::new();
        map.insert("zeta".to_string(), 1);
        map.insert("alpha".to_string(), 2);
        let doc = map.to_document();
        let keys: Vec<_> = doc.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_option() {
        assert_eq!(Some(3u8).to_document(), json!(3));
        assert_eq!(None::<u8>.to_document(), Value::Null);
    }

    #[test]
    fn test_datetime_uses_canonical_format() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap();
        assert_eq!(ts.to_document(), json!("29:02:2024 23:59:58.000"));
    }

    #[test]
    fn test_variant_tree() {
        let mut map = BTreeMap::new();
        map.insert("nick".to_string(), Variant::from("alice"));
        map.insert("away".to_string(), Variant::from(false));
        let params = Variant::List(vec![Variant::from(7i64), Variant::Map(map), Variant::Null]);
        assert_eq!(
            params.to_document(),
            json!([7, {"away": false, "nick": "alice"}, null])
        );
    }

    #[test]
    fn test_opaque_variant_becomes_null_in_place() {
        let params = Variant::List(vec![
            Variant::from("#new"),
            Variant::opaque("QPixmap"),
            Variant::from(1i64),
        ]);
        assert_eq!(params.to_document(), json!(["#new", null, 1]));
    }

    #[test]
    fn test_project_list_keeps_order() {
        let values = project_list(&["c", "a", "b"]);
        assert_eq!(values, vec![json!("c"), json!("a"), json!("b")]);
    }
}
