//! Bounded, wire-safe rendering of host values.
//!
//! Host values can be huge, deep, cyclic, or booby-trapped with accessors that
//! throw. The serializer always terminates: composites past `max_depth` become
//! summary leaves, revisiting a composite on the current path yields a
//! `circular` leaf, a throwing accessor yields an `error` leaf for that one
//! property, and long strings and wide composites are clipped.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::host::{display_name, HostValue, PropertySlot};

/// Marker appended to clipped text.
pub const ELLIPSIS: &str = "…";

/// Wire-level kind of a serialized value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// String.
    String,
    /// Number.
    Number,
    /// Boolean.
    Boolean,
    /// Null.
    Null,
    /// Undefined.
    Undefined,
    /// Function.
    Function,
    /// Symbol.
    Symbol,
    /// Arbitrary-precision integer.
    Bigint,
    /// Array.
    Array,
    /// Object.
    Object,
    /// Element descriptor or document element.
    Element,
    /// Live runtime node.
    Node,
    /// Back-reference to a composite on the current path.
    Circular,
    /// An accessor threw while being read.
    Error,
    /// Entries dropped for width.
    Truncated,
}

/// Ordered child entries, serialized as a JSON object in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entries(pub Vec<(String, SerializedValue)>);

impl Entries {
    /// Entry by key.
    pub fn get(&self, key: &str) -> Option<&SerializedValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Entries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A host value rendered for the wire.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SerializedValue {
    /// Kind tag.
    pub kind: ValueKind,
    /// Display text.
    pub text: String,
    /// Short inline summary of a composite, or the full length of a clipped
    /// string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Child entries of an expanded composite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Entries>,
}

impl SerializedValue {
    fn leaf(kind: ValueKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            preview: None,
            children: None,
        }
    }

    /// Nesting depth: 0 for a leaf, 1 + deepest child for a composite.
    pub fn depth(&self) -> usize {
        match &self.children {
            Some(entries) => 1 + entries.0.iter().map(|(_, v)| v.depth()).max().unwrap_or(0),
            None => 0,
        }
    }

    /// Child by key.
    pub fn get(&self, key: &str) -> Option<&SerializedValue> {
        self.children.as_ref()?.get(key)
    }
}

/// Limits applied while serializing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializerOptions {
    /// Composites at this depth or deeper become summary leaves.
    pub max_depth: usize,
    /// Strings are clipped to this many characters.
    pub max_string_len: usize,
    /// Children kept per composite.
    pub max_entries: usize,
    /// Children shown in a composite's preview.
    pub preview_items: usize,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_string_len: 500,
            max_entries: 100,
            preview_items: 4,
        }
    }
}

/// Renders [`HostValue`]s as [`SerializedValue`]s.
#[derive(Clone, Debug, Default)]
pub struct ValueSerializer {
    options: SerializerOptions,
}

impl ValueSerializer {
    /// Serializer with `options`.
    pub fn new(options: SerializerOptions) -> Self {
        Self { options }
    }

    /// Limits in effect.
    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    /// Render `value`.
    pub fn serialize(&self, value: &HostValue) -> SerializedValue {
        let mut path = Vec::new();
        self.walk(value, 0, &mut path)
    }

    fn walk(&self, value: &HostValue, depth: usize, path: &mut Vec<usize>) -> SerializedValue {
        match value {
            HostValue::Undefined => SerializedValue::leaf(ValueKind::Undefined, "undefined"),
            HostValue::Null => SerializedValue::leaf(ValueKind::Null, "null"),
            HostValue::Bool(b) => SerializedValue::leaf(ValueKind::Boolean, b.to_string()),
            HostValue::Number(n) => SerializedValue::leaf(ValueKind::Number, format_number(*n)),
            HostValue::BigInt(digits) => SerializedValue::leaf(ValueKind::Bigint, format!("{digits}n")),
            HostValue::String(s) => self.string(s),
            HostValue::Symbol(desc) => SerializedValue::leaf(ValueKind::Symbol, format!("Symbol({desc})")),
            HostValue::Function(name) => SerializedValue::leaf(ValueKind::Function, function_text(name)),
            HostValue::Element(element) => SerializedValue::leaf(ValueKind::Element, element.describe()),
            HostValue::Node(node) => {
                SerializedValue::leaf(ValueKind::Node, format!("<{} />", display_name(node)))
            }
            HostValue::Array(_) | HostValue::Object(_) => self.composite(value, depth, path),
        }
    }

    fn string(&self, s: &str) -> SerializedValue {
        let len = s.chars().count();
        if len <= self.options.max_string_len {
            return SerializedValue::leaf(ValueKind::String, s);
        }
        let clipped: String = s.chars().take(self.options.max_string_len).collect();
        SerializedValue {
            kind: ValueKind::String,
            text: format!("{clipped}{ELLIPSIS}"),
            preview: Some(format!("{len} chars")),
            children: None,
        }
    }

    fn composite(&self, value: &HostValue, depth: usize, path: &mut Vec<usize>) -> SerializedValue {
        if let Some(descriptor) = element_descriptor(value) {
            return SerializedValue::leaf(ValueKind::Element, descriptor);
        }

        let identity = value.identity();
        if identity.is_some_and(|id| path.contains(&id)) {
            return SerializedValue::leaf(ValueKind::Circular, "[Circular]");
        }

        if let Some(id) = identity {
            path.push(id);
        }
        let rendered = match value {
            HostValue::Array(array) => {
                let text = format!("Array({})", array.len());
                if depth >= self.options.max_depth {
                    SerializedValue::leaf(ValueKind::Array, text)
                } else {
                    let entries = self.array_entries(&array.items(), depth, path);
                    self.expanded(ValueKind::Array, text, entries, false)
                }
            }
            HostValue::Object(object) => {
                let class = object.class_name().unwrap_or("Object");
                if depth >= self.options.max_depth {
                    SerializedValue::leaf(ValueKind::Object, format!("{class}{{{}}}", object.len()))
                } else {
                    let entries = self.object_entries(object.entries(), depth, path);
                    self.expanded(ValueKind::Object, class.to_string(), entries, true)
                }
            }
            other => self.walk(other, depth, path),
        };
        if identity.is_some() {
            path.pop();
        }
        rendered
    }

    fn expanded(
        &self,
        kind: ValueKind,
        text: String,
        entries: Vec<(String, SerializedValue)>,
        keyed: bool,
    ) -> SerializedValue {
        let preview = if keyed {
            self.preview(&entries, "{", "}", true)
        } else {
            self.preview(&entries, "[", "]", false)
        };
        SerializedValue {
            kind,
            text,
            preview: Some(preview),
            children: Some(Entries(entries)),
        }
    }

    fn array_entries(
        &self,
        items: &[HostValue],
        depth: usize,
        path: &mut Vec<usize>,
    ) -> Vec<(String, SerializedValue)> {
        let mut out: Vec<_> = items
            .iter()
            .take(self.options.max_entries)
            .enumerate()
            .map(|(index, item)| (index.to_string(), self.walk(item, depth + 1, path)))
            .collect();
        self.push_overflow(&mut out, items.len());
        out
    }

    fn object_entries(
        &self,
        slots: Vec<(String, PropertySlot)>,
        depth: usize,
        path: &mut Vec<usize>,
    ) -> Vec<(String, SerializedValue)> {
        let total = slots.len();
        let mut out: Vec<_> = slots
            .into_iter()
            .take(self.options.max_entries)
            .map(|(key, slot)| {
                let rendered = match slot.read() {
                    Ok(value) => self.walk(&value, depth + 1, path),
                    Err(e) => SerializedValue::leaf(ValueKind::Error, format!("[Exception: {e}]")),
                };
                (key, rendered)
            })
            .collect();
        self.push_overflow(&mut out, total);
        out
    }

    fn push_overflow(&self, out: &mut Vec<(String, SerializedValue)>, total: usize) {
        if total > self.options.max_entries {
            let more = total - self.options.max_entries;
            out.push((
                ELLIPSIS.to_string(),
                SerializedValue::leaf(ValueKind::Truncated, format!("{more} more")),
            ));
        }
    }

    fn preview(
        &self,
        entries: &[(String, SerializedValue)],
        open: &str,
        close: &str,
        keyed: bool,
    ) -> String {
        let mut parts: Vec<String> = entries
            .iter()
            .filter(|(_, v)| v.kind != ValueKind::Truncated)
            .take(self.options.preview_items)
            .map(|(key, v)| {
                let short = short_text(v);
                if keyed {
                    format!("{key}: {short}")
                } else {
                    short
                }
            })
            .collect();
        if entries.len() > parts.len() {
            parts.push(ELLIPSIS.to_string());
        }
        format!("{open}{}{close}", parts.join(", "))
    }
}

fn short_text(value: &SerializedValue) -> String {
    match value.kind {
        ValueKind::String => format!("\"{}\"", value.text),
        ValueKind::Object if value.children.is_some() => "{…}".to_string(),
        _ => value.text.clone(),
    }
}

fn function_text(name: &str) -> String {
    if name.is_empty() {
        "ƒ anonymous()".to_string()
    } else {
        format!("ƒ {name}()")
    }
}

/// Number text the way the host runtime prints it.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        String::from(if n > 0.0 { "Infinity" } else { "-Infinity" })
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

/// One-line rendering of an element descriptor object (`$$typeof` tagged).
fn element_descriptor(value: &HostValue) -> Option<String> {
    let HostValue::Object(object) = value else {
        return None;
    };
    let marker = object.get("$$typeof")?.ok()?;
    match marker {
        HostValue::Symbol(desc) if desc.contains("element") => {}
        _ => return None,
    }
    let type_name = match object.get("type").and_then(Result::ok) {
        Some(HostValue::String(tag)) => tag,
        Some(HostValue::Function(name)) if !name.is_empty() => name,
        Some(HostValue::Object(inner)) => inner
            .get("displayName")
            .and_then(Result::ok)
            .and_then(|v| match v {
                HostValue::String(s) => Some(s),
                _ => None,
            })
            .unwrap_or_else(|| "Anonymous".to_string()),
        _ => "Anonymous".to_string(),
    };
    Some(format!("<{type_name} />"))
}
