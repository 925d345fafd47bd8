//! # Query Predicates
//!
//! Single-collection filtered iteration. A predicate is anything
//! implementing `Fn(&Document) -> bool`; [`Filter`] offers the common
//! field comparisons as data so callers do not have to hand-write
//! closures for the usual cases:
//!
//! ```ignore
//! let adults = manager.iter_where("people", |doc| {
//!     Filter::le("age", 40i32).matches(doc)
//! })?;
//! ```
//!
//! A comparison against a field of a different type is simply false, as
//! is a comparison against a missing field.

use std::cmp::Ordering;

use crate::btree::TreeIterator;
use crate::document::{DataType, Document, Value};

use super::manager::document_from_entry;

/// Comparison operators for [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Compare {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Compare::Eq => ordering == Ordering::Equal,
            Compare::Ne => ordering != Ordering::Equal,
            Compare::Lt => ordering == Ordering::Less,
            Compare::Le => ordering != Ordering::Greater,
            Compare::Gt => ordering == Ordering::Greater,
            Compare::Ge => ordering != Ordering::Less,
        }
    }
}

/// A document predicate as data.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches every document.
    True,
    /// The document has the named field, optionally of a specific type.
    HasField {
        field: String,
        expected_type: Option<DataType>,
    },
    /// The named field compares against `value` under `op`. Fields of a
    /// different type never match.
    Cmp {
        field: String,
        op: Compare,
        value: Value,
    },
    /// Every sub-filter matches.
    All(Vec<Filter>),
    /// At least one sub-filter matches.
    Any(Vec<Filter>),
    /// The sub-filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    pub fn has_field(field: impl Into<String>) -> Self {
        Filter::HasField {
            field: field.into(),
            expected_type: None,
        }
    }

    pub fn has_field_of_type(field: impl Into<String>, expected_type: DataType) -> Self {
        Filter::HasField {
            field: field.into(),
            expected_type: Some(expected_type),
        }
    }

    pub fn cmp(field: impl Into<String>, op: Compare, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Compare::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Compare::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Compare::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Compare::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Compare::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Compare::Ge, value)
    }

    /// Conjunction of this filter with another.
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::All(mut filters) => {
                filters.push(other);
                Filter::All(filters)
            }
            this => Filter::All(vec![this, other]),
        }
    }

    /// Disjunction of this filter with another.
    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Any(mut filters) => {
                filters.push(other);
                Filter::Any(filters)
            }
            this => Filter::Any(vec![this, other]),
        }
    }

    /// Negation of this filter.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        match self {
            Filter::Not(inner) => *inner,
            this => Filter::Not(Box::new(this)),
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::True => true,
            Filter::HasField {
                field,
                expected_type,
            } => match document.get(field) {
                Some(value) => match expected_type {
                    Some(expected) => value.data_type() == *expected,
                    None => true,
                },
                None => false,
            },
            Filter::Cmp { field, op, value } => document
                .get(field)
                .and_then(|actual| compare_values(actual, value))
                .is_some_and(|ordering| op.accepts(ordering)),
            Filter::All(filters) => filters.iter().all(|filter| filter.matches(document)),
            Filter::Any(filters) => filters.iter().any(|filter| filter.matches(document)),
            Filter::Not(inner) => !inner.matches(document),
        }
    }
}

/// Orders two values of the same scalar type; `None` for mismatched or
/// unordered types.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Double(x), Value::Double(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::Int32(x), Value::Int32(y)) => Some(x.cmp(y)),
        (Value::Int64(x), Value::Int64(y)) => Some(x.cmp(y)),
        (Value::UInt64(x), Value::UInt64(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Iterator over the documents of a collection that satisfy a predicate.
pub struct FilteredIter<'t, P> {
    inner: TreeIterator<'t>,
    predicate: P,
}

impl<'t, P> FilteredIter<'t, P> {
    pub(crate) fn new(inner: TreeIterator<'t>, predicate: P) -> Self {
        Self { inner, predicate }
    }
}

impl<P> Iterator for FilteredIter<'_, P>
where
    P: Fn(&Document) -> bool,
{
    type Item = eyre::Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.inner.next()?;
            match entry.and_then(document_from_entry) {
                Ok(document) => {
                    if (self.predicate)(&document) {
                        return Some(Ok(document));
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(name: &str, age: i32) -> Document {
        let mut doc = Document::new();
        doc.insert("name", name).insert("age", age);
        doc
    }

    #[test]
    fn filter_true_matches_everything() {
        assert!(Filter::True.matches(&person("a", 1)));
        assert!(Filter::True.matches(&Document::new()));
    }

    #[test]
    fn filter_has_field() {
        let doc = person("George", 24);
        assert!(Filter::has_field("name").matches(&doc));
        assert!(!Filter::has_field("email").matches(&doc));
        assert!(Filter::has_field_of_type("age", DataType::Int32).matches(&doc));
        assert!(!Filter::has_field_of_type("age", DataType::String).matches(&doc));
    }

    #[test]
    fn filter_comparisons() {
        let doc = person("Helen", 25);
        assert!(Filter::le("age", 40i32).matches(&doc));
        assert!(Filter::lt("age", 26i32).matches(&doc));
        assert!(!Filter::gt("age", 25i32).matches(&doc));
        assert!(Filter::ge("age", 25i32).matches(&doc));
        assert!(Filter::eq("name", "Helen").matches(&doc));
        assert!(Filter::ne("name", "Carson").matches(&doc));
    }

    #[test]
    fn filter_type_mismatch_never_matches() {
        let doc = person("Helen", 25);
        // age is Int32, comparing against Int64 is false for every op.
        assert!(!Filter::le("age", 40i64).matches(&doc));
        assert!(!Filter::eq("age", 25i64).matches(&doc));
        assert!(!Filter::ne("age", 25i64).matches(&doc));
    }

    #[test]
    fn filter_missing_field_never_matches() {
        let doc = person("Helen", 25);
        assert!(!Filter::le("height", 180i32).matches(&doc));
        assert!(!Filter::ne("height", 180i32).matches(&doc));
    }

    #[test]
    fn filter_combinators() {
        let helen = person("Helen", 25);
        let carson = person("Carson", 44);

        let young_helen = Filter::eq("name", "Helen").and(Filter::le("age", 40i32));
        assert!(young_helen.matches(&helen));
        assert!(!young_helen.matches(&carson));

        let either = Filter::eq("name", "Helen").or(Filter::eq("name", "Carson"));
        assert!(either.matches(&helen));
        assert!(either.matches(&carson));
        assert!(!either.matches(&person("George", 24)));

        let not_young = Filter::le("age", 40i32).not();
        assert!(!not_young.matches(&helen));
        assert!(not_young.matches(&carson));
        // Double negation unwraps.
        assert!(not_young.clone().not().matches(&helen));
    }

    #[test]
    fn filter_and_chains_flatten() {
        let filter = Filter::ge("age", 10i32)
            .and(Filter::le("age", 40i32))
            .and(Filter::has_field("name"));
        match &filter {
            Filter::All(filters) => assert_eq!(filters.len(), 3),
            other => panic!("expected All, got {:?}", other),
        }
        assert!(filter.matches(&person("Helen", 25)));
        assert!(!filter.matches(&person("Carson", 44)));
    }
}
