//! Inbound stream framing.
//!
//! A [`Framer`] buffers raw bytes as they arrive and hands out one
//! [`Frame`] per complete top-level unit: the stream header, stream-level
//! elements (features, errors) and stanzas. Stream-level elements are
//! recognised by the prefix the header bound to the streams namespace.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use tracing::{trace, warn};

pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";

/// Attributes of the `<stream:stream>` opening tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub from: String,
    pub to: String,
    pub id: String,
    pub version: String,
    pub lang: String,
    /// Default namespace of the stream content (`jabber:client`, ...).
    pub default_ns: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    StreamOpen(StreamHeader),
    /// `<stream:features>`, raw.
    Features(String),
    /// `<stream:error>` with its defined condition, empty when missing.
    StreamError { condition: String, xml: String },
    /// Any other element in the streams namespace.
    StreamElement(String),
    /// A top-level element in the content namespace.
    Stanza(String),
    StreamClose,
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn split_qname(name: QName<'_>) -> (String, String) {
    let prefix = name.prefix().map(|p| lossy(p.as_ref())).unwrap_or_default();
    (prefix, lossy(name.local_name().as_ref()))
}

fn is_partial(e: &quick_xml::Error) -> bool {
    matches!(
        e,
        quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedPIOrXmlDecl
        )
    )
}

/// Local name of the first child element of a `<stream:error>`, skipping
/// `<text/>`.
fn stream_error_condition(xml: &[u8]) -> String {
    let mut reader = Reader::from_reader(xml);
    let mut depth = 0u32;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 1 && e.local_name().as_ref() != b"text" {
                    return lossy(e.local_name().as_ref());
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 && e.local_name().as_ref() != b"text" {
                    return lossy(e.local_name().as_ref());
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) | Err(_) => return String::new(),
            Ok(_) => {}
        }
    }
}

/// Incremental framer over one inbound stream.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    /// Prefix bound to [`NS_STREAMS`] by the last stream header.
    stream_prefix: String,
}

impl Default for Framer {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            stream_prefix: "stream".to_string(),
        }
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Whether buffered bytes hold the start of an unfinished frame.
    pub fn has_partial(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete frame off the buffer, or `None` until more
    /// bytes arrive.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let (frame, consumed) = self.scan()?;
        self.buffer.drain(..consumed);
        trace!(consumed, remaining = self.buffer.len(), "frame cut");
        Some(frame)
    }

    /// Length of a closing stream tag at the head of the buffer, if any.
    /// The reader would see it as an end tag without a start.
    fn leading_close(&self) -> Option<usize> {
        let start = self.buffer.iter().position(|b| !b.is_ascii_whitespace())?;
        let mut tag = b"</".to_vec();
        if !self.stream_prefix.is_empty() {
            tag.extend_from_slice(self.stream_prefix.as_bytes());
            tag.push(b':');
        }
        tag.extend_from_slice(b"stream");

        let rest = self.buffer[start..].strip_prefix(tag.as_slice())?;
        let gap = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
        (rest.get(gap) == Some(&b'>')).then_some(start + tag.len() + gap + 1)
    }

    fn header(&mut self, start: &BytesStart<'_>) -> StreamHeader {
        let (prefix, _) = split_qname(start.name());
        self.stream_prefix = prefix;

        let mut header = StreamHeader::default();
        for attr in start.attributes().flatten() {
            let value = match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => lossy(&attr.value),
            };
            match attr.key.as_ref() {
                b"from" => header.from = value,
                b"to" => header.to = value,
                b"id" => header.id = value,
                b"version" => header.version = value,
                b"xml:lang" => header.lang = value,
                b"xmlns" => header.default_ns = value,
                _ => {}
            }
        }
        header
    }

    fn classify(&self, name: QName<'_>, raw: &[u8]) -> Frame {
        let (prefix, local) = split_qname(name);
        if prefix != self.stream_prefix || prefix.is_empty() {
            return Frame::Stanza(lossy(raw));
        }
        match local.as_str() {
            "features" => Frame::Features(lossy(raw)),
            "error" => Frame::StreamError {
                condition: stream_error_condition(raw),
                xml: lossy(raw),
            },
            _ => Frame::StreamElement(lossy(raw)),
        }
    }

    fn scan(&mut self) -> Option<(Frame, usize)> {
        if let Some(len) = self.leading_close() {
            return Some((Frame::StreamClose, len));
        }

        let buffer = std::mem::take(&mut self.buffer);
        let result = self.scan_buffer(&buffer);
        self.buffer = buffer;
        result
    }

    fn scan_buffer(&mut self, buffer: &[u8]) -> Option<(Frame, usize)> {
        let mut reader = Reader::from_reader(buffer);
        reader.config_mut().check_end_names = false;

        let mut depth = 0u32;
        let mut open_at = 0usize;
        loop {
            let before = reader.buffer_position() as usize;
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(e) if is_partial(&e) => return None,
                Err(e) => {
                    warn!(error = %e, "inbound XML cannot be framed");
                    return None;
                }
            };
            let after = reader.buffer_position() as usize;

            match event {
                Event::Start(e) | Event::Empty(e)
                    if depth == 0 && e.local_name().as_ref() == b"stream" =>
                {
                    return Some((Frame::StreamOpen(self.header(&e)), after));
                }
                Event::Start(_) => {
                    if depth == 0 {
                        open_at = before;
                    }
                    depth += 1;
                }
                Event::Empty(e) if depth == 0 => {
                    return Some((self.classify(e.name(), &buffer[before..after]), after));
                }
                Event::End(e) if depth == 0 => {
                    if e.local_name().as_ref() == b"stream" {
                        return Some((Frame::StreamClose, after));
                    }
                    warn!(tag = %lossy(e.name().as_ref()), "stray end tag in inbound stream");
                }
                Event::End(e) => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((self.classify(e.name(), &buffer[open_at..after]), after));
                    }
                }
                Event::Eof => return None,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frames(framer: &mut Framer) -> Vec<Frame> {
        std::iter::from_fn(|| framer.next_frame()).collect()
    }

    const HEADER: &[u8] = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0' xml:lang='en'>";

    #[test]
    fn test_stream_header_fields() {
        let mut framer = Framer::new();
        framer.push(HEADER);
        assert_eq!(
            framer.next_frame(),
            Some(Frame::StreamOpen(StreamHeader {
                from: "example.com".into(),
                to: String::new(),
                id: "s1".into(),
                version: "1.0".into(),
                lang: "en".into(),
                default_ns: "jabber:client".into(),
            }))
        );
        assert!(!framer.has_partial());
    }

    #[test]
    fn test_stanzas_and_stream_level_elements() {
        let mut framer = Framer::new();
        framer.push(HEADER);
        framer.push(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>");
        framer.push(b"<presence/><iq type='result' id='a1'><query xmlns='jabber:iq:roster'/></iq>");
        framer.push(b"<stream:error><text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>bye</text><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>");
        framer.push(b"</stream:stream>");

        let got = frames(&mut framer);
        assert_eq!(got.len(), 6);
        assert!(matches!(got[0], Frame::StreamOpen(_)));
        assert_eq!(
            got[1],
            Frame::Features("<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>".into())
        );
        assert_eq!(got[2], Frame::Stanza("<presence/>".into()));
        assert_eq!(
            got[3],
            Frame::Stanza("<iq type='result' id='a1'><query xmlns='jabber:iq:roster'/></iq>".into())
        );
        match &got[4] {
            Frame::StreamError { condition, xml } => {
                assert_eq!(condition, "conflict");
                assert!(xml.ends_with("</stream:error>"));
            }
            other => panic!("expected stream error, got {:?}", other),
        }
        assert_eq!(got[5], Frame::StreamClose);
        assert!(!framer.has_partial());
    }

    #[test]
    fn test_prefix_comes_from_header() {
        let mut framer = Framer::new();
        framer.push(b"<s:stream xmlns='jabber:client' xmlns:s='http://etherx.jabber.org/streams'>");
        framer.push(b"<s:features/><stream:features/></s:stream>");

        let got = frames(&mut framer);
        assert!(matches!(got[0], Frame::StreamOpen(_)));
        assert_eq!(got[1], Frame::Features("<s:features/>".into()));
        // bound to nothing known here, so it is content
        assert_eq!(got[2], Frame::Stanza("<stream:features/>".into()));
        assert_eq!(got[3], Frame::StreamClose);
    }

    #[test]
    fn test_partial_input_waits_for_more() {
        let mut framer = Framer::new();
        framer.push(b"<iq type='result' id='a1'><query xmlns='jabber:iq:roster'>");
        assert_eq!(framer.next_frame(), None);
        assert!(framer.has_partial());

        framer.push(b"</query></i");
        assert_eq!(framer.next_frame(), None);

        framer.push(b"q>");
        assert_eq!(
            framer.next_frame(),
            Some(Frame::Stanza(
                "<iq type='result' id='a1'><query xmlns='jabber:iq:roster'></query></iq>".into()
            ))
        );
        assert!(!framer.has_partial());
    }

    #[test]
    fn test_close_after_whitespace() {
        let mut framer = Framer::new();
        framer.push(b"  \n</stream:stream >");
        assert_eq!(framer.next_frame(), Some(Frame::StreamClose));
        assert_eq!(framer.next_frame(), None);
        assert!(!framer.has_partial());
    }

    #[test]
    fn test_stream_error_without_condition() {
        let mut framer = Framer::new();
        framer.push(b"<stream:error/>");
        assert_eq!(
            framer.next_frame(),
            Some(Frame::StreamError {
                condition: String::new(),
                xml: "<stream:error/>".into(),
            })
        );
    }

    #[test]
    fn test_empty_and_whitespace_buffers() {
        let mut framer = Framer::new();
        assert_eq!(framer.next_frame(), None);
        framer.push(b"   \n  ");
        assert_eq!(framer.next_frame(), None);
        assert!(!framer.has_partial());
    }
}
