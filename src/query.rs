use std::cmp::Ordering;

use serde_json::Value;

/// Dot-separated path into a JSON document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            segments: path
                .as_ref()
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn resolve<'a>(&self, content: &'a Value) -> Option<&'a Value> {
        let mut current = content;
        for segment in &self.segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

/// Typed predicate tree evaluated against document content.
///
/// Per-driver translators may compile this to SQL; the reference driver
/// evaluates it in memory.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(FieldPath, Value),
    Ne(FieldPath, Value),
    Gt(FieldPath, Value),
    Ge(FieldPath, Value),
    Lt(FieldPath, Value),
    Le(FieldPath, Value),
    Contains(FieldPath, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: impl AsRef<str>, value: impl Into<Value>) -> Self {
        Filter::Eq(FieldPath::new(path), value.into())
    }

    pub fn ne(path: impl AsRef<str>, value: impl Into<Value>) -> Self {
        Filter::Ne(FieldPath::new(path), value.into())
    }

    pub fn gt(path: impl AsRef<str>, value: impl Into<Value>) -> Self {
        Filter::Gt(FieldPath::new(path), value.into())
    }

    pub fn ge(path: impl AsRef<str>, value: impl Into<Value>) -> Self {
        Filter::Ge(FieldPath::new(path), value.into())
    }

    pub fn lt(path: impl AsRef<str>, value: impl Into<Value>) -> Self {
        Filter::Lt(FieldPath::new(path), value.into())
    }

    pub fn le(path: impl AsRef<str>, value: impl Into<Value>) -> Self {
        Filter::Le(FieldPath::new(path), value.into())
    }

    pub fn contains(path: impl AsRef<str>, value: impl Into<Value>) -> Self {
        Filter::Contains(FieldPath::new(path), value.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut filters) => {
                filters.push(other);
                Filter::Or(filters)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    /// Evaluates the predicate against document content.
    pub fn matches(&self, content: &Value) -> bool {
        match self {
            Filter::Eq(path, value) => path.resolve(content) == Some(value),
            Filter::Ne(path, value) => path.resolve(content) != Some(value),
            Filter::Gt(path, value) => {
                compare_at(path, content, value) == Some(Ordering::Greater)
            }
            Filter::Ge(path, value) => matches!(
                compare_at(path, content, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(path, value) => compare_at(path, content, value) == Some(Ordering::Less),
            Filter::Le(path, value) => matches!(
                compare_at(path, content, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Contains(path, needle) => match path.resolve(content) {
                Some(Value::Array(items)) => items.contains(needle),
                Some(Value::String(text)) => needle
                    .as_str()
                    .map(|fragment| text.contains(fragment))
                    .unwrap_or(false),
                _ => false,
            },
            Filter::And(filters) => filters.iter().all(|filter| filter.matches(content)),
            Filter::Or(filters) => filters.iter().any(|filter| filter.matches(content)),
        }
    }
}

fn compare_at(path: &FieldPath, content: &Value, against: &Value) -> Option<Ordering> {
    compare_values(path.resolve(content)?, against)
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64()?;
            let b = b.as_f64()?;
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
