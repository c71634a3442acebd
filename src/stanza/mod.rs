//! Stanza envelope: a view onto a `<message/>`, `<presence/>` or `<iq/>`
//! element of a shared [`Document`].

mod error;

pub use error::{ErrorCondition, ErrorType, StanzaError, NS_STANZAS};

use std::fmt;

use crate::jid::Jid;
use crate::xml::{Document, Element, XmlError};

/// Default namespace of client-to-server streams.
pub const NS_CLIENT: &str = "jabber:client";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Message,
    Presence,
    Iq,
}

impl Kind {
    pub fn tag_name(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Presence => "presence",
            Self::Iq => "iq",
        }
    }

    pub fn from_tag_name(name: &str) -> Option<Self> {
        match name {
            "message" => Some(Self::Message),
            "presence" => Some(Self::Presence),
            "iq" => Some(Self::Iq),
            _ => None,
        }
    }
}

/// A stanza. `Stanza::default()` is the null stanza with no backing element;
/// accessors on it return empty values and mutators do nothing.
#[derive(Clone, Default)]
pub struct Stanza {
    element: Option<Element>,
    base_ns: String,
}

impl Stanza {
    /// Build a new outbound stanza inside `doc`.
    pub fn new(doc: &Document, base_ns: &str, kind: Kind, to: &Jid, stanza_type: &str, id: &str) -> Self {
        let stanza = Self {
            element: Some(doc.create_element(base_ns, kind.tag_name())),
            base_ns: base_ns.to_string(),
        };
        stanza.set_to(to);
        stanza.set_type(stanza_type);
        stanza.set_id(id);
        stanza
    }

    /// Wrap an inbound element. Returns `None` unless it is a message,
    /// presence or iq qualified by `base_ns`.
    pub fn from_element(element: Element, base_ns: &str) -> Option<Self> {
        Kind::from_tag_name(&element.name())?;
        if element.namespace() != base_ns {
            return None;
        }
        Some(Self {
            element: Some(element),
            base_ns: base_ns.to_string(),
        })
    }

    pub fn is_null(&self) -> bool {
        self.element.is_none()
    }

    pub fn element(&self) -> Option<&Element> {
        self.element.as_ref()
    }

    pub fn doc(&self) -> Option<&Document> {
        self.element.as_ref().map(Element::document)
    }

    pub fn base_ns(&self) -> &str {
        &self.base_ns
    }

    fn backing(&self) -> Result<&Element, XmlError> {
        self.element.as_ref().ok_or(XmlError::NullStanza)
    }

    /// Create a detached element in the stanza's own document.
    pub fn create_element(&self, ns: &str, name: &str) -> Result<Element, XmlError> {
        Ok(self.backing()?.document().create_element(ns, name))
    }

    pub fn create_text_element(&self, ns: &str, name: &str, text: &str) -> Result<Element, XmlError> {
        Ok(self.backing()?.document().create_text_element(ns, name, text))
    }

    /// Append a child created from this stanza's document. Elements of any
    /// other document are rejected with [`XmlError::ForeignDocument`].
    pub fn append_child(&self, child: &Element) -> Result<(), XmlError> {
        self.backing()?.append_child(child)
    }

    pub fn kind(&self) -> Option<Kind> {
        Kind::from_tag_name(&self.element.as_ref()?.name())
    }

    pub fn set_kind(&self, kind: Kind) {
        if let Some(e) = &self.element {
            e.set_name(kind.tag_name());
        }
    }

    fn attr(&self, key: &str) -> String {
        self.element
            .as_ref()
            .and_then(|e| e.attribute(key))
            .unwrap_or_default()
    }

    fn set_attr(&self, key: &str, value: &str) {
        if let Some(e) = &self.element {
            e.set_attribute(key, value);
        }
    }

    pub fn to(&self) -> Jid {
        Jid::new(&self.attr("to"))
    }

    pub fn from(&self) -> Jid {
        Jid::new(&self.attr("from"))
    }

    pub fn id(&self) -> String {
        self.attr("id")
    }

    pub fn stanza_type(&self) -> String {
        self.attr("type")
    }

    pub fn lang(&self) -> String {
        self.attr("xml:lang")
    }

    pub fn set_to(&self, jid: &Jid) {
        self.set_attr("to", &jid.to_string());
    }

    pub fn set_from(&self, jid: &Jid) {
        self.set_attr("from", &jid.to_string());
    }

    pub fn set_id(&self, id: &str) {
        self.set_attr("id", id);
    }

    pub fn set_type(&self, stanza_type: &str) {
        self.set_attr("type", stanza_type);
    }

    pub fn set_lang(&self, lang: &str) {
        self.set_attr("xml:lang", lang);
    }

    fn error_element(&self) -> Option<Element> {
        self.element
            .as_ref()?
            .first_child_ns(&self.base_ns, "error")
    }

    /// Decoded `<error/>` child, if any.
    pub fn error(&self) -> Option<StanzaError> {
        let e = self.error_element()?;
        let mut err = StanzaError::default();
        err.from_xml(&e, &self.base_ns).then_some(err)
    }

    /// Replace any existing `<error/>` child with `err`.
    pub fn set_error(&self, err: &StanzaError) -> Result<(), XmlError> {
        let element = self.backing()?;
        self.clear_error();
        element.append_child(&err.to_xml(element.document(), &self.base_ns))
    }

    pub fn clear_error(&self) {
        if let (Some(element), Some(error)) = (&self.element, self.error_element()) {
            element.remove_child(&error);
        }
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.element {
            Some(e) => f.write_str(&e.to_xml_in_scope(&self.base_ns)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stanza({})", self)
    }
}
