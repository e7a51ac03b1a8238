//! Runtime values as the host runtime holds them.
//!
//! Composite values (`HostArray`, `HostObject`) are shared through `Arc` and
//! mutable through interior locks, so a value graph can alias and can form
//! cycles exactly like the host's own heap. Object properties may be backed
//! by accessors that fail when read.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::dom::DomElement;
use super::{display_name, HostError, NodeHandle};
use crate::sync::{read, write};

/// Accessor invoked when a getter-backed property is read.
pub type Getter = Arc<dyn Fn() -> Result<HostValue, HostError> + Send + Sync>;

/// A value living inside the host runtime.
#[derive(Clone)]
pub enum HostValue {
    /// Absent value.
    Undefined,
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Double-precision number.
    Number(f64),
    /// Arbitrary-precision integer, kept as its decimal digits.
    BigInt(String),
    /// String.
    String(String),
    /// Symbol with its description.
    Symbol(String),
    /// Function with its name (empty when anonymous).
    Function(String),
    /// Shared, mutable array.
    Array(Arc<HostArray>),
    /// Shared, mutable object.
    Object(Arc<HostObject>),
    /// Live document element.
    Element(Arc<DomElement>),
    /// Live runtime node.
    Node(NodeHandle),
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shallow on purpose: composites may be cyclic.
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::BigInt(digits) => write!(f, "{digits}n"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Symbol(desc) => write!(f, "Symbol({desc})"),
            Self::Function(name) => write!(f, "fn {name}()"),
            Self::Array(array) => write!(f, "Array({})", array.len()),
            Self::Object(object) => write!(f, "Object{{{}}}", object.len()),
            Self::Element(element) => write!(f, "{}", element.describe()),
            Self::Node(node) => write!(f, "<{} />", display_name(node)),
        }
    }
}

impl HostValue {
    /// Shorthand for a string value.
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Shorthand for a named function value.
    pub fn function(name: impl Into<String>) -> Self {
        Self::Function(name.into())
    }

    /// Build a fresh array from items.
    pub fn array(items: Vec<HostValue>) -> Self {
        Self::Array(HostArray::new(items))
    }

    /// Build a fresh plain object from `(key, value)` pairs.
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        let object = HostObject::new();
        for (key, value) in entries {
            object.set(key, value);
        }
        Self::Object(object)
    }

    /// Identity of a shared composite, used for cycle detection.
    ///
    /// Primitives and live handles have no identity here.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Self::Array(array) => Some(Arc::as_ptr(array) as *const () as usize),
            Self::Object(object) => Some(Arc::as_ptr(object) as *const () as usize),
            _ => None,
        }
    }

    /// Host-level type name (`typeof`-like), for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::BigInt(_) => "bigint",
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Function(_) => "function",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Element(_) => "element",
            Self::Node(_) => "node",
        }
    }

    /// True for `undefined` and `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Read a plain (non-throwing) property of an object value.
    ///
    /// Getter failures and non-object receivers both yield `None`.
    pub fn get(&self, key: &str) -> Option<HostValue> {
        match self {
            Self::Object(object) => object.get(key).and_then(Result::ok),
            _ => None,
        }
    }

    /// Convert wire JSON into a fresh host value (used by prop editing).
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => {
                Self::object(map.iter().map(|(k, v)| (k.clone(), Self::from_json(v))))
            }
        }
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Shared array storage.
#[derive(Default)]
pub struct HostArray {
    items: RwLock<Vec<HostValue>>,
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArray").field("len", &self.len()).finish()
    }
}

impl HostArray {
    /// Create a shared array.
    pub fn new(items: Vec<HostValue>) -> Arc<Self> {
        Arc::new(Self {
            items: RwLock::new(items),
        })
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        read(&self.items).len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current items (composites stay shared).
    pub fn items(&self) -> Vec<HostValue> {
        read(&self.items).clone()
    }

    /// Item at `index`, if any.
    pub fn get(&self, index: usize) -> Option<HostValue> {
        read(&self.items).get(index).cloned()
    }

    /// Append an item.
    pub fn push(&self, value: HostValue) {
        write(&self.items).push(value);
    }
}

/// How a property stores its value.
#[derive(Clone)]
pub enum PropertySlot {
    /// Plain data property.
    Value(HostValue),
    /// Accessor property; reading may fail.
    Getter(Getter),
}

impl PropertySlot {
    /// Read the slot, invoking the accessor if there is one.
    pub fn read(&self) -> Result<HostValue, HostError> {
        match self {
            Self::Value(value) => Ok(value.clone()),
            Self::Getter(getter) => getter(),
        }
    }
}

/// Shared object storage with insertion-ordered keys.
#[derive(Default)]
pub struct HostObject {
    class_name: Option<String>,
    properties: RwLock<Vec<(String, PropertySlot)>>,
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("class_name", &self.class_name)
            .field("keys", &self.keys())
            .finish()
    }
}

impl HostObject {
    /// Create an empty plain object.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an empty object that is an instance of `class_name`.
    pub fn with_class(class_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            class_name: Some(class_name.into()),
            properties: RwLock::new(Vec::new()),
        })
    }

    /// Constructor name, when the object is not a plain object.
    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    /// Set a data property, replacing an existing one in place.
    pub fn set(&self, key: impl Into<String>, value: HostValue) {
        self.put(key.into(), PropertySlot::Value(value));
    }

    /// Define an accessor property.
    pub fn define_getter(&self, key: impl Into<String>, getter: Getter) {
        self.put(key.into(), PropertySlot::Getter(getter));
    }

    fn put(&self, key: String, slot: PropertySlot) {
        let mut properties = write(&self.properties);
        match properties.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = slot,
            None => properties.push((key, slot)),
        }
    }

    /// Read a property; `None` when the key is absent.
    pub fn get(&self, key: &str) -> Option<Result<HostValue, HostError>> {
        let slot = read(&self.properties)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, slot)| slot.clone())?;
        Some(slot.read())
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        read(&self.properties).iter().any(|(k, _)| k == key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        read(&self.properties).iter().map(|(k, _)| k.clone()).collect()
    }

    /// Snapshot of all slots in insertion order, without invoking accessors.
    pub fn entries(&self) -> Vec<(String, PropertySlot)> {
        read(&self.properties).clone()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        read(&self.properties).len()
    }

    /// True when there are no properties.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_set_replaces_in_place() {
        let object = HostObject::new();
        object.set("a", HostValue::from(1.0));
        object.set("b", HostValue::from(2.0));
        object.set("a", HostValue::from(3.0));

        assert_eq!(object.keys(), vec!["a", "b"]);
        assert!(matches!(object.get("a"), Some(Ok(HostValue::Number(n))) if n == 3.0));
    }

    #[test]
    fn test_getter_failure_is_reported_per_property() {
        let object = HostObject::new();
        object.set("ok", HostValue::from(true));
        object.define_getter(
            "boom",
            Arc::new(|| Err(HostError::Thrown("detached".to_string()))),
        );

        assert!(matches!(object.get("ok"), Some(Ok(HostValue::Bool(true)))));
        assert!(matches!(object.get("boom"), Some(Err(HostError::Thrown(_)))));
        assert!(object.get("missing").is_none());
    }

    #[test]
    fn test_identity_is_shared_across_clones() {
        let value = HostValue::object([("x", HostValue::Null)]);
        let alias = value.clone();
        let other = HostValue::object([("x", HostValue::Null)]);

        assert_eq!(value.identity(), alias.identity());
        assert_ne!(value.identity(), other.identity());
        assert_eq!(HostValue::Null.identity(), None);
    }

    #[test]
    fn test_from_json_builds_nested_composites() {
        let value = HostValue::from_json(&json!({"title": "hi", "tags": [1, 2]}));
        let HostValue::Object(object) = &value else {
            panic!("expected object");
        };
        assert_eq!(object.len(), 2);
        assert!(matches!(value.get("title"), Some(HostValue::String(s)) if s == "hi"));
        assert!(matches!(value.get("tags"), Some(HostValue::Array(a)) if a.len() == 2));
    }
}
