//! Namespace-aware fragment parser on top of `quick-xml`'s `NsReader`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use super::{Arena, Attr, XmlError, NS_XML};

fn parse_error(e: impl std::fmt::Display) -> XmlError {
    XmlError::Parse(e.to_string())
}

/// Resolve the namespace of an element event. Unprefixed elements with no
/// declaration in scope fall back to `default_ns`.
fn resolve_ns(resolved: ResolveResult<'_>, default_ns: &str) -> Result<String, XmlError> {
    match resolved {
        ResolveResult::Bound(ns) => Ok(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        ResolveResult::Unbound => Ok(default_ns.to_string()),
        ResolveResult::Unknown(prefix) => Err(XmlError::Parse(format!(
            "unknown namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn resolve_attr_ns(resolved: ResolveResult<'_>) -> Result<String, XmlError> {
    match resolved {
        ResolveResult::Bound(ns) => Ok(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        // attributes never take the default namespace
        ResolveResult::Unbound => Ok(String::new()),
        ResolveResult::Unknown(prefix) if prefix == b"xml" => Ok(NS_XML.to_string()),
        ResolveResult::Unknown(prefix) => Err(XmlError::Parse(format!(
            "unknown namespace prefix '{}' on attribute",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn open_element(
    arena: &mut Arena,
    reader: &NsReader<&[u8]>,
    start: &BytesStart<'_>,
    ns: &str,
) -> Result<usize, XmlError> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(parse_error)?;
        let key = attr.key;
        // Namespace declarations are folded into element and attribute
        // namespaces
        if key.as_ref() == b"xmlns" || key.as_ref().starts_with(b"xmlns:") {
            continue;
        }
        let (resolved, local) = reader.resolve_attribute(key);
        let attr_ns = resolve_attr_ns(resolved)?;
        let prefix = key
            .prefix()
            .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned())
            .unwrap_or_default();
        attrs.push(Attr {
            ns: attr_ns,
            prefix,
            name: String::from_utf8_lossy(local.as_ref()).into_owned(),
            value: attr.unescape_value().map_err(parse_error)?.into_owned(),
        });
    }

    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let node = arena.new_element(ns, &name);
    for attr in attrs {
        arena.set_attr(node, attr);
    }
    Ok(node)
}

/// Parse exactly one root element from `xml` into `arena` and return its node.
/// Leading declarations, comments and whitespace are skipped; anything other
/// than whitespace or comments after the root is an error. Nothing is left
/// allocated on error.
pub(super) fn parse_into(arena: &mut Arena, xml: &str, default_ns: &str) -> Result<usize, XmlError> {
    let mut root = None;
    let result = parse_tree(arena, xml, default_ns, &mut root);
    if result.is_err() {
        if let Some(root) = root {
            arena.free_subtree(root);
        }
    }
    result
}

fn parse_tree(
    arena: &mut Arena,
    xml: &str,
    default_ns: &str,
    root: &mut Option<usize>,
) -> Result<usize, XmlError> {
    let mut reader = NsReader::from_str(xml);
    let mut stack: Vec<usize> = Vec::new();

    loop {
        let (resolved, event) = reader.read_resolved_event().map_err(parse_error)?;
        match event {
            Event::Start(e) => {
                if root.is_some() && stack.is_empty() {
                    return Err(XmlError::Parse("content after root element".to_string()));
                }
                let ns = resolve_ns(resolved, default_ns)?;
                let node = open_element(arena, &reader, &e, &ns)?;
                match stack.last() {
                    Some(&parent) => arena.append(parent, node),
                    None => *root = Some(node),
                }
                stack.push(node);
            }
            Event::Empty(e) => {
                if root.is_some() && stack.is_empty() {
                    return Err(XmlError::Parse("content after root element".to_string()));
                }
                let ns = resolve_ns(resolved, default_ns)?;
                let node = open_element(arena, &reader, &e, &ns)?;
                match stack.last() {
                    Some(&parent) => arena.append(parent, node),
                    None => *root = Some(node),
                }
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(parse_error)?;
                match stack.last() {
                    Some(&parent) => {
                        let node = arena.new_text(&text);
                        arena.append(parent, node);
                    }
                    None if text.trim().is_empty() => {}
                    None => {
                        return Err(XmlError::Parse("text outside of root element".to_string()))
                    }
                }
            }
            Event::CData(c) => {
                if let Some(&parent) = stack.last() {
                    let text = String::from_utf8_lossy(&c).into_owned();
                    let node = arena.new_text(&text);
                    arena.append(parent, node);
                }
            }
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Parse("unclosed element".to_string()));
    }
    root.ok_or(XmlError::NoRoot)
}

#[cfg(test)]
mod tests {
    use crate::xml::{Document, XmlError};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_resolves_namespaces() {
        let iq = Document::parse(
            r#"<iq xmlns="jabber:client" type="result" id="v1"><query xmlns="jabber:iq:version"><name>fluux</name></query></iq>"#,
        )
        .unwrap();
        assert_eq!(iq.name(), "iq");
        assert_eq!(iq.namespace(), "jabber:client");
        assert_eq!(iq.attribute("type").as_deref(), Some("result"));

        let query = iq.first_child("query").unwrap();
        assert_eq!(query.namespace(), "jabber:iq:version");
        let name = query.first_child("name").unwrap();
        assert_eq!(name.namespace(), "jabber:iq:version");
        assert_eq!(name.text(), "fluux");
    }

    #[test]
    fn test_parse_prefixed_namespace() {
        let e = Document::parse(
            r#"<x:item xmlns:x="urn:example" xmlns="jabber:client"><body/></x:item>"#,
        )
        .unwrap();
        assert_eq!(e.name(), "item");
        assert_eq!(e.namespace(), "urn:example");
        assert_eq!(e.first_child("body").unwrap().namespace(), "jabber:client");
    }

    #[test]
    fn test_default_namespace_for_stream_stanzas() {
        let e = Document::parse_with_default_ns(
            "<iq type='get' id='p1'><ping xmlns='urn:xmpp:ping'/></iq>",
            "jabber:client",
        )
        .unwrap();
        assert_eq!(e.namespace(), "jabber:client");
        assert_eq!(e.first_child("ping").unwrap().namespace(), "urn:xmpp:ping");
        assert_eq!(
            e.to_xml_in_scope("jabber:client"),
            r#"<iq type="get" id="p1"><ping xmlns="urn:xmpp:ping"/></iq>"#
        );
    }

    #[test]
    fn test_parse_keeps_xml_lang_and_entities() {
        let e = Document::parse(
            r#"<message xml:lang="en"><body>Hello &amp; welcome &lt;friend&gt;</body></message>"#,
        )
        .unwrap();
        assert_eq!(e.attribute("xml:lang").as_deref(), Some("en"));
        assert_eq!(e.first_child("body").unwrap().text(), "Hello & welcome <friend>");
    }

    #[test]
    fn test_parse_resolves_prefixed_attributes() {
        let e = Document::parse(
            r#"<item xmlns:p="urn:example:p" p:role="owner" jid="a@b"/>"#,
        )
        .unwrap();
        assert_eq!(e.attribute_ns("urn:example:p", "role").as_deref(), Some("owner"));
        assert_eq!(e.attribute("jid").as_deref(), Some("a@b"));
        assert!(!e.has_attribute("p:role"));
    }

    #[test]
    fn test_parse_rejects_unbound_attribute_prefix() {
        assert!(matches!(
            Document::parse("<item q:role='owner'/>"),
            Err(XmlError::Parse(_))
        ));
    }

    #[test]
    fn test_failed_parse_leaves_no_nodes() {
        let doc = Document::new();
        assert!(doc.parse_fragment("<iq><query><item/>", "").is_err());
        assert!(doc.parse_fragment("<a>text</a><b/>", "").is_err());
        assert_eq!(doc.node_count(), 0);
    }

    #[test]
    fn test_parse_cdata() {
        let e = Document::parse("<body><![CDATA[Some <raw> content]]></body>").unwrap();
        assert_eq!(e.text(), "Some <raw> content");
    }

    #[test]
    fn test_parse_skips_declaration() {
        let e = Document::parse("<?xml version='1.0'?>\n<presence/>").unwrap();
        assert_eq!(e.name(), "presence");
    }

    #[test]
    fn test_parse_rejects_unclosed_element() {
        assert!(matches!(
            Document::parse("<iq><query>"),
            Err(XmlError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_prefix() {
        assert!(matches!(
            Document::parse("<stream:features/>"),
            Err(XmlError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_second_root() {
        assert!(matches!(
            Document::parse("<a/><b/>"),
            Err(XmlError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_empty_input() {
        assert_eq!(Document::parse("  ").unwrap_err(), XmlError::NoRoot);
    }
}
