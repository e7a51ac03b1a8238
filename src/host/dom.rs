//! Minimal document model used for root discovery.
//!
//! Elements carry their own properties (enumerable or not), which is where a
//! host runtime stashes the association back to its root node.

use std::sync::{Arc, RwLock, Weak};

use super::value::HostValue;
use crate::sync::{read, write};

/// One own property of an element.
#[derive(Clone, Debug)]
pub struct OwnProperty {
    /// Property key.
    pub key: String,
    /// Property value.
    pub value: HostValue,
    /// Whether the key shows up in enumerable key listings.
    pub enumerable: bool,
}

/// A live document element.
#[derive(Debug)]
pub struct DomElement {
    tag: String,
    id: Option<String>,
    properties: RwLock<Vec<OwnProperty>>,
    children: RwLock<Vec<Arc<DomElement>>>,
    parent: RwLock<Weak<DomElement>>,
}

impl DomElement {
    /// Create a detached element.
    pub fn new(tag: impl Into<String>) -> Arc<Self> {
        Self::build(tag.into(), None)
    }

    /// Create a detached element with an `id` attribute.
    pub fn with_id(tag: impl Into<String>, id: impl Into<String>) -> Arc<Self> {
        Self::build(tag.into(), Some(id.into()))
    }

    fn build(tag: String, id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            tag,
            id,
            properties: RwLock::new(Vec::new()),
            children: RwLock::new(Vec::new()),
            parent: RwLock::new(Weak::new()),
        })
    }

    /// Tag name.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Append `child`, detaching it from any previous parent.
    pub fn append_child(self: &Arc<Self>, child: &Arc<DomElement>) {
        if let Some(old_parent) = child.parent() {
            old_parent.remove_child(child);
        }
        *write(&child.parent) = Arc::downgrade(self);
        write(&self.children).push(Arc::clone(child));
    }

    /// Remove `child` if it is a direct child.
    pub fn remove_child(&self, child: &Arc<DomElement>) {
        write(&self.children).retain(|c| !Arc::ptr_eq(c, child));
        *write(&child.parent) = Weak::new();
    }

    /// Direct children in document order.
    pub fn children(&self) -> Vec<Arc<DomElement>> {
        read(&self.children).clone()
    }

    /// Parent element, if attached.
    pub fn parent(&self) -> Option<Arc<DomElement>> {
        read(&self.parent).upgrade()
    }

    /// Define or replace an own property.
    pub fn define_property(&self, key: impl Into<String>, value: HostValue, enumerable: bool) {
        let key = key.into();
        let mut properties = write(&self.properties);
        match properties.iter_mut().find(|p| p.key == key) {
            Some(existing) => {
                existing.value = value;
                existing.enumerable = enumerable;
            }
            None => properties.push(OwnProperty {
                key,
                value,
                enumerable,
            }),
        }
    }

    /// All own property names, enumerable or not.
    pub fn own_property_names(&self) -> Vec<String> {
        read(&self.properties).iter().map(|p| p.key.clone()).collect()
    }

    /// Enumerable own property names only.
    pub fn keys(&self) -> Vec<String> {
        read(&self.properties)
            .iter()
            .filter(|p| p.enumerable)
            .map(|p| p.key.clone())
            .collect()
    }

    /// Value of an own property.
    pub fn property(&self, key: &str) -> Option<HostValue> {
        read(&self.properties)
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.clone())
    }

    /// Whether `other` is this element or one of its descendants.
    pub fn contains(self: &Arc<Self>, other: &Arc<DomElement>) -> bool {
        let mut current = Some(Arc::clone(other));
        while let Some(element) = current {
            if Arc::ptr_eq(self, &element) {
                return true;
            }
            current = element.parent();
        }
        false
    }

    /// One-line description, e.g. `<div id="root">`.
    pub fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("<{} id=\"{}\">", self.tag, id),
            None => format!("<{}>", self.tag),
        }
    }
}

/// The document an inspected page renders into.
#[derive(Debug)]
pub struct Document {
    body: Arc<DomElement>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create a document with an empty `<body>`.
    pub fn new() -> Self {
        Self {
            body: DomElement::new("body"),
        }
    }

    /// The `<body>` element.
    pub fn body(&self) -> &Arc<DomElement> {
        &self.body
    }

    /// First element in document order with the given `id`.
    pub fn get_element_by_id(&self, id: &str) -> Option<Arc<DomElement>> {
        self.walk().into_iter().find(|el| el.id() == Some(id))
    }

    /// Every element in document order (pre-order), starting at `<body>`.
    pub fn walk(&self) -> Vec<Arc<DomElement>> {
        let mut out = Vec::new();
        let mut stack = vec![Arc::clone(&self.body)];
        while let Some(element) = stack.pop() {
            let children = element.children();
            stack.extend(children.into_iter().rev());
            out.push(element);
        }
        out
    }
}
