//! Arena-backed XML document model shared by stanzas and tasks.
//!
//! A [`Document`] owns every node created through it. [`Element`] is a light
//! handle (document + node index) and never owns anything by itself: two
//! handles to the same node compare equal. Elements can only be attached to
//! elements of the same document; content from elsewhere must go through
//! [`Document::import`] first.

mod framing;
mod parser;

pub use framing::{Frame, Framer, StreamHeader, NS_STREAMS};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use quick_xml::escape::escape;
use thiserror::Error;

/// Namespace bound to the reserved `xml` prefix.
pub const NS_XML: &str = "http://www.w3.org/XML/1998/namespace";

/// Errors raised by the document model and the parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("XML input has no root element")]
    NoRoot,

    #[error("element belongs to a different document")]
    ForeignDocument,

    #[error("element cannot be appended to itself or to one of its descendants")]
    HierarchyRequest,

    #[error("stanza has no backing element")]
    NullStanza,
}

/// Split an attribute key into (namespace, local name). Only the reserved
/// `xml` prefix is understood; other prefixes need [`Element::set_attribute_ns`].
fn split_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once(':') {
        None => Some(("", key)),
        Some(("xml", local)) => Some((NS_XML, local)),
        Some(_) => None,
    }
}

#[derive(Debug, Clone)]
struct Attr {
    ns: String,
    /// Prefix seen on input, reused when writing if still free.
    prefix: String,
    name: String,
    value: String,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        name: String,
        ns: String,
        attrs: Vec<Attr>,
    },
    Text(String),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Live `Element` handles pointing at this node.
    handles: Cell<u32>,
    live: bool,
}

/// Node storage with slot reuse. A detached subtree that no [`Element`]
/// handle points into is freed.
#[derive(Debug, Default)]
struct Arena {
    nodes: Vec<Node>,
    free: Vec<usize>,
}

impl Arena {
    fn push(&mut self, kind: NodeKind) -> usize {
        let node = Node {
            kind,
            parent: None,
            children: Vec::new(),
            handles: Cell::new(0),
            live: true,
        };
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.live).count()
    }

    fn new_element(&mut self, ns: &str, name: &str) -> usize {
        self.push(NodeKind::Element {
            name: name.to_string(),
            ns: ns.to_string(),
            attrs: Vec::new(),
        })
    }

    fn new_text(&mut self, text: &str) -> usize {
        self.push(NodeKind::Text(text.to_string()))
    }

    fn detach(&mut self, child: usize) {
        if let Some(parent) = self.nodes[child].parent.take() {
            self.nodes[parent].children.retain(|&c| c != child);
        }
    }

    fn append(&mut self, parent: usize, child: usize) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    fn is_ancestor_or_self(&self, candidate: usize, mut node: usize) -> bool {
        loop {
            if node == candidate {
                return true;
            }
            match self.nodes[node].parent {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    fn top(&self, mut node: usize) -> usize {
        while let Some(parent) = self.nodes[node].parent {
            node = parent;
        }
        node
    }

    fn is_referenced(&self, node: usize) -> bool {
        let n = &self.nodes[node];
        n.handles.get() > 0 || n.children.iter().any(|&c| self.is_referenced(c))
    }

    /// Free the tree containing `node` if nothing references it any more.
    fn collect(&mut self, node: usize) {
        let top = self.top(node);
        if !self.is_referenced(top) {
            self.free_subtree(top);
        }
    }

    fn free_subtree(&mut self, node: usize) {
        self.detach(node);
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let n = &mut self.nodes[current];
            if !n.live {
                continue;
            }
            stack.append(&mut n.children);
            n.kind = NodeKind::Text(String::new());
            n.parent = None;
            n.live = false;
            self.free.push(current);
        }
    }

    fn set_attr(&mut self, node: usize, attr: Attr) {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[node].kind {
            match attrs
                .iter_mut()
                .find(|a| a.ns == attr.ns && a.name == attr.name)
            {
                Some(slot) => slot.value = attr.value,
                None => attrs.push(attr),
            }
        }
    }

    fn remove_attr(&mut self, node: usize, ns: &str, name: &str) {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[node].kind {
            attrs.retain(|a| a.ns != ns || a.name != name);
        }
    }

    fn text_of(&self, node: usize, out: &mut String) {
        for &child in &self.nodes[node].children {
            match &self.nodes[child].kind {
                NodeKind::Text(t) => out.push_str(t),
                NodeKind::Element { .. } => self.text_of(child, out),
            }
        }
    }

    fn snapshot(&self, node: usize) -> Snapshot {
        Snapshot {
            kind: self.nodes[node].kind.clone(),
            children: self.nodes[node]
                .children
                .iter()
                .map(|&c| self.snapshot(c))
                .collect(),
        }
    }

    fn restore(&mut self, snapshot: &Snapshot) -> usize {
        let node = self.push(snapshot.kind.clone());
        for child in &snapshot.children {
            let c = self.restore(child);
            self.append(node, c);
        }
        node
    }

    fn write(&self, node: usize, scope_ns: &str, out: &mut String) {
        match &self.nodes[node].kind {
            NodeKind::Text(t) => out.push_str(&escape(t.as_str())),
            NodeKind::Element { name, ns, attrs } => {
                out.push('<');
                out.push_str(name);
                if ns != scope_ns {
                    out.push_str(" xmlns=\"");
                    out.push_str(&escape(ns.as_str()));
                    out.push('"');
                }

                // Prefixes for namespaced attributes are declared on the
                // element that carries them.
                let mut declared: Vec<(String, &str)> = Vec::new();
                let mut qualified = Vec::with_capacity(attrs.len());
                for attr in attrs {
                    let prefix = if attr.ns.is_empty() {
                        String::new()
                    } else if attr.ns == NS_XML {
                        "xml".to_string()
                    } else if let Some((p, _)) = declared.iter().find(|(_, u)| *u == attr.ns) {
                        p.clone()
                    } else {
                        let taken = |p: &str| {
                            p.is_empty()
                                || p == "xml"
                                || p.starts_with("xmlns")
                                || declared.iter().any(|(d, _)| d == p)
                        };
                        let mut p = attr.prefix.clone();
                        let mut n = 0;
                        while taken(p.as_str()) {
                            p = format!("ns{}", n);
                            n += 1;
                        }
                        declared.push((p.clone(), attr.ns.as_str()));
                        p
                    };
                    qualified.push((prefix, attr));
                }
                for (prefix, uri) in &declared {
                    out.push_str(" xmlns:");
                    out.push_str(prefix);
                    out.push_str("=\"");
                    out.push_str(&escape(*uri));
                    out.push('"');
                }
                for (prefix, attr) in qualified {
                    out.push(' ');
                    if !prefix.is_empty() {
                        out.push_str(&prefix);
                        out.push(':');
                    }
                    out.push_str(&attr.name);
                    out.push_str("=\"");
                    out.push_str(&escape(attr.value.as_str()));
                    out.push('"');
                }

                let children = &self.nodes[node].children;
                if children.is_empty() {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for &child in children {
                    self.write(child, ns, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
    }
}

/// Owned copy of a subtree, used to move content between documents without
/// holding two arena borrows at once.
struct Snapshot {
    kind: NodeKind,
    children: Vec<Snapshot>,
}

/// Shared handle to an XML document. Cloning the handle does not copy the tree.
#[derive(Clone, Default)]
pub struct Document {
    arena: Rc<RefCell<Arena>>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detached element in namespace `ns` (empty for none).
    pub fn create_element(&self, ns: &str, name: &str) -> Element {
        let node = self.arena.borrow_mut().new_element(ns, name);
        Element::from_node(self, node)
    }

    /// Create a detached element holding a single text child.
    pub fn create_text_element(&self, ns: &str, name: &str, text: &str) -> Element {
        let element = self.create_element(ns, name);
        element.append_text(text);
        element
    }

    /// Deep-copy `element` (from any document, this one included) into this
    /// document. The copy is detached.
    pub fn import(&self, element: &Element) -> Element {
        let snapshot = element.doc.arena.borrow().snapshot(element.node);
        let node = self.arena.borrow_mut().restore(&snapshot);
        Element::from_node(self, node)
    }

    /// Parse a standalone XML fragment into a new document.
    pub fn parse(xml: &str) -> Result<Element, XmlError> {
        Self::new().parse_fragment(xml, "")
    }

    /// Parse a fragment whose unprefixed elements inherit `default_ns` when
    /// no `xmlns` is declared, as stanzas cut out of a client stream do.
    pub fn parse_with_default_ns(xml: &str, default_ns: &str) -> Result<Element, XmlError> {
        Self::new().parse_fragment(xml, default_ns)
    }

    /// Parse a fragment into this document. The returned root is detached.
    pub fn parse_fragment(&self, xml: &str, default_ns: &str) -> Result<Element, XmlError> {
        let node = parser::parse_into(&mut self.arena.borrow_mut(), xml, default_ns)?;
        Ok(Element::from_node(self, node))
    }

    pub fn ptr_eq(&self, other: &Document) -> bool {
        Rc::ptr_eq(&self.arena, &other.arena)
    }

    /// Nodes currently allocated, text nodes included.
    pub fn node_count(&self) -> usize {
        self.arena.borrow().live_count()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.node_count())
            .finish()
    }
}

/// Handle to an element node inside a [`Document`].
///
/// A detached subtree is freed once the last handle into it is dropped.
pub struct Element {
    doc: Document,
    node: usize,
}

impl Element {
    fn from_node(doc: &Document, node: usize) -> Self {
        {
            let arena = doc.arena.borrow();
            let handles = &arena.nodes[node].handles;
            handles.set(handles.get() + 1);
        }
        Self {
            doc: doc.clone(),
            node,
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn same_document(&self, other: &Element) -> bool {
        self.doc.ptr_eq(&other.doc)
    }

    fn with_element<R>(&self, f: impl FnOnce(&str, &str, &[Attr]) -> R) -> R {
        let arena = self.doc.arena.borrow();
        match &arena.nodes[self.node].kind {
            NodeKind::Element { name, ns, attrs } => f(name, ns, attrs),
            NodeKind::Text(_) => f("", "", &[]),
        }
    }

    /// Local tag name.
    pub fn name(&self) -> String {
        self.with_element(|name, _, _| name.to_string())
    }

    /// Resolved namespace URI, empty when the element has none.
    pub fn namespace(&self) -> String {
        self.with_element(|_, ns, _| ns.to_string())
    }

    pub fn set_name(&self, new_name: &str) {
        if let NodeKind::Element { name, .. } = &mut self.doc.arena.borrow_mut().nodes[self.node].kind {
            *name = new_name.to_string();
        }
    }

    /// Attribute by key: a plain name, or `xml:`-prefixed.
    pub fn attribute(&self, key: &str) -> Option<String> {
        let (ns, name) = split_key(key)?;
        self.attribute_ns(ns, name)
    }

    pub fn attribute_ns(&self, ns: &str, name: &str) -> Option<String> {
        self.with_element(|_, _, attrs| {
            attrs
                .iter()
                .find(|a| a.ns == ns && a.name == name)
                .map(|a| a.value.clone())
        })
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attribute(key).is_some()
    }

    /// Set `key` to `value`; an empty value removes the attribute. Namespace
    /// declarations are derived when writing and cannot be set, and keys
    /// with a prefix other than `xml:` are ignored.
    pub fn set_attribute(&self, key: &str, value: &str) {
        if key == "xmlns" || key.starts_with("xmlns:") {
            return;
        }
        if let Some((ns, name)) = split_key(key) {
            self.set_attribute_ns(ns, name, value);
        }
    }

    /// Set an attribute in namespace `ns` (empty for none). An empty value
    /// removes it.
    pub fn set_attribute_ns(&self, ns: &str, name: &str, value: &str) {
        let mut arena = self.doc.arena.borrow_mut();
        if value.is_empty() {
            arena.remove_attr(self.node, ns, name);
            return;
        }
        arena.set_attr(
            self.node,
            Attr {
                ns: ns.to_string(),
                prefix: String::new(),
                name: name.to_string(),
                value: value.to_string(),
            },
        );
    }

    pub fn remove_attribute(&self, key: &str) {
        if let Some((ns, name)) = split_key(key) {
            self.doc.arena.borrow_mut().remove_attr(self.node, ns, name);
        }
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.doc.arena.borrow().text_of(self.node, &mut out);
        out
    }

    pub fn append_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut arena = self.doc.arena.borrow_mut();
        let node = arena.new_text(text);
        arena.append(self.node, node);
    }

    /// Create a child element at the end of this element.
    pub fn append_element(&self, ns: &str, name: &str) -> Element {
        let node = {
            let mut arena = self.doc.arena.borrow_mut();
            let node = arena.new_element(ns, name);
            arena.append(self.node, node);
            node
        };
        Element::from_node(&self.doc, node)
    }

    /// Create a child element holding a single text child.
    pub fn append_text_element(&self, ns: &str, name: &str, text: &str) -> Element {
        let element = self.append_element(ns, name);
        element.append_text(text);
        element
    }

    /// Append a deep copy of `element`, which may live in any document.
    pub fn append_copy(&self, element: &Element) -> Element {
        let snapshot = element.doc.arena.borrow().snapshot(element.node);
        let node = {
            let mut arena = self.doc.arena.borrow_mut();
            let node = arena.restore(&snapshot);
            arena.append(self.node, node);
            node
        };
        Element::from_node(&self.doc, node)
    }

    /// Element children in document order (text nodes are skipped).
    pub fn children(&self) -> Vec<Element> {
        let nodes: Vec<usize> = {
            let arena = self.doc.arena.borrow();
            arena.nodes[self.node]
                .children
                .iter()
                .copied()
                .filter(|&c| matches!(arena.nodes[c].kind, NodeKind::Element { .. }))
                .collect()
        };
        nodes
            .into_iter()
            .map(|node| Element::from_node(&self.doc, node))
            .collect()
    }

    pub fn first_element_child(&self) -> Option<Element> {
        self.children().into_iter().next()
    }

    /// First child element with the given local name, in any namespace.
    pub fn first_child(&self, name: &str) -> Option<Element> {
        self.children().into_iter().find(|c| c.name() == name)
    }

    pub fn first_child_ns(&self, ns: &str, name: &str) -> Option<Element> {
        self.children()
            .into_iter()
            .find(|c| c.name() == name && c.namespace() == ns)
    }

    pub fn parent(&self) -> Option<Element> {
        let parent = self.doc.arena.borrow().nodes[self.node].parent?;
        Some(Element::from_node(&self.doc, parent))
    }

    /// Append `child`, moving it if it is already attached somewhere in this
    /// document.
    pub fn append_child(&self, child: &Element) -> Result<(), XmlError> {
        if !self.same_document(child) {
            return Err(XmlError::ForeignDocument);
        }
        let mut arena = self.doc.arena.borrow_mut();
        if arena.is_ancestor_or_self(child.node, self.node) {
            return Err(XmlError::HierarchyRequest);
        }
        let old_top = arena.top(child.node);
        arena.append(self.node, child.node);
        if old_top != child.node {
            arena.collect(old_top);
        }
        Ok(())
    }

    /// Detach `child` if it is a direct child of this element. Returns whether
    /// anything was removed.
    pub fn remove_child(&self, child: &Element) -> bool {
        if !self.same_document(child) {
            return false;
        }
        let mut arena = self.doc.arena.borrow_mut();
        if arena.nodes[child.node].parent != Some(self.node) {
            return false;
        }
        arena.detach(child.node);
        true
    }

    /// Serialize as a standalone fragment.
    pub fn to_xml(&self) -> String {
        self.to_xml_in_scope("")
    }

    /// Serialize assuming `default_ns` is already the default namespace in
    /// scope, which is how stanzas are written inside a stream.
    pub fn to_xml_in_scope(&self, default_ns: &str) -> String {
        let mut out = String::new();
        self.doc.arena.borrow().write(self.node, default_ns, &mut out);
        out
    }
}

impl Clone for Element {
    fn clone(&self) -> Self {
        Element::from_node(&self.doc, self.node)
    }
}

impl Drop for Element {
    fn drop(&mut self) {
        // A drop while the arena is borrowed only releases the handle; the
        // tree is collected with the next handle that goes away.
        match self.doc.arena.try_borrow_mut() {
            Ok(mut arena) => {
                let handles = &arena.nodes[self.node].handles;
                handles.set(handles.get().saturating_sub(1));
                if handles.get() == 0 {
                    arena.collect(self.node);
                }
            }
            Err(_) => {
                if let Ok(arena) = self.doc.arena.try_borrow() {
                    let handles = &arena.nodes[self.node].handles;
                    handles.set(handles.get().saturating_sub(1));
                }
            }
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.same_document(other) && self.node == other.node
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Element({})", self.to_xml())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}
