//! Streaming XML decoder for XMPP streams.
//!
//! Consumes resolved [`rxml::Event`]s and assembles them into stream-level
//! events: the opening `<stream:stream>` header, each fully materialized
//! top-level child element (stanza), and the closing tag. The decoder never
//! buffers more than the stanza currently being assembled, so streams can
//! run indefinitely.
//!
//! Profile restrictions (no DOCTYPE, no processing instructions, no entity
//! references, per RFC 6120 §11) are enforced by the rxml tokenizer and
//! surface here as [`DecodeError::RestrictedXml`].

use thiserror::Error;

use crate::ns;
use crate::xml::Element;

/// Errors produced while decoding a stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The byte stream is not well-formed XML. Fatal for the stream.
    #[error("not well-formed: {0}")]
    NotWellFormed(String),

    /// Well-formed XML that the XMPP profile forbids (DOCTYPE, processing
    /// instructions, entity references, ...). Fatal for the stream.
    #[error("restricted XML: {0}")]
    RestrictedXml(String),

    /// Character data directly below the stream root that is not whitespace.
    #[error("unexpected text at stream top level")]
    TextAtTopLevel,

    /// The root element is not `stream:stream` in the streams namespace.
    #[error("invalid stream header: {0}")]
    BadStreamHeader(String),

    /// The underlying transport failed.
    #[error("read error: {0}")]
    Io(#[source] std::io::Error),
}

impl DecodeError {
    /// Classify an error reported by the transport reader.
    ///
    /// rxml reports tokenization failures wrapped in `std::io::Error`;
    /// anything else is a genuine transport failure.
    pub fn from_read(err: std::io::Error) -> DecodeError {
        if let Some(inner) = err.get_ref() {
            if let Some(xml_err) = inner.downcast_ref::<rxml::Error>() {
                return match xml_err {
                    rxml::Error::RestrictedXml(what) => {
                        DecodeError::RestrictedXml((*what).to_string())
                    }
                    other => DecodeError::NotWellFormed(other.to_string()),
                };
            }
        }
        DecodeError::Io(err)
    }

    /// Whether this is a transport failure rather than an XML-level one.
    pub fn is_transport(&self) -> bool {
        matches!(self, DecodeError::Io(_))
    }
}

/// Attributes of a received `<stream:stream>` start tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The `from` attribute, if present.
    pub from: Option<String>,
    /// The `to` attribute, if present.
    pub to: Option<String>,
    /// The stream id (set by the receiving entity).
    pub id: Option<String>,
    /// The `version` attribute, if present.
    pub version: Option<String>,
    /// The `xml:lang` attribute, if present.
    pub lang: Option<String>,
}

/// One decoded stream-level event.
#[derive(Debug)]
pub enum StreamEvent {
    /// The outer `<stream:stream ...>` start tag completed.
    StreamOpen(StreamHeader),
    /// A direct child of the stream root, fully materialized.
    Stanza(Element),
    /// The `</stream:stream>` end tag.
    StreamClose,
}

/// Assembles rxml events into [`StreamEvent`]s.
///
/// [`reset`][StreamDecoder::reset] rewinds to the initial state for a stream
/// restart after STARTTLS or SASL; the caller resets the tokenizer alongside.
#[derive(Default)]
pub struct StreamDecoder {
    header_seen: bool,
    stack: Vec<Element>,
}

impl StreamDecoder {
    /// Create a decoder in the initial (pre-header) state.
    pub fn new() -> StreamDecoder {
        StreamDecoder::default()
    }

    /// Drop all state, expecting a fresh stream header next.
    pub fn reset(&mut self) {
        self.header_seen = false;
        self.stack.clear();
    }

    /// Process one tokenizer event, possibly completing a stream event.
    pub fn process(&mut self, event: rxml::Event) -> Result<Option<StreamEvent>, DecodeError> {
        match event {
            rxml::Event::XmlDeclaration(_, _) => Ok(None),
            rxml::Event::StartElement(_, qname, attrs) => {
                if !self.header_seen {
                    let (namespace, name) = &qname;
                    if namespace.as_str() != ns::STREAM || name.as_str() != "stream" {
                        return Err(DecodeError::BadStreamHeader(format!(
                            "expected stream:stream, got {{{}}}{}",
                            namespace.as_str(),
                            name.as_str()
                        )));
                    }
                    self.header_seen = true;
                    return Ok(Some(StreamEvent::StreamOpen(header_from_attrs(attrs))));
                }
                self.stack.push(element_from_parts(qname, attrs));
                Ok(None)
            }
            rxml::Event::Text(_, text) => {
                match self.stack.last_mut() {
                    Some(top) => {
                        top.append_text(&text);
                        Ok(None)
                    }
                    None => {
                        // Whitespace keep-alives between stanzas are dropped.
                        if text.trim().is_empty() {
                            Ok(None)
                        } else {
                            Err(DecodeError::TextAtTopLevel)
                        }
                    }
                }
            }
            rxml::Event::EndElement(_) => match self.stack.pop() {
                Some(el) => {
                    if let Some(parent) = self.stack.last_mut() {
                        parent.append_child(el);
                        Ok(None)
                    } else {
                        Ok(Some(StreamEvent::Stanza(el)))
                    }
                }
                None => {
                    self.header_seen = false;
                    Ok(Some(StreamEvent::StreamClose))
                }
            },
        }
    }
}

/// Build an [`Element`] shell from a resolved start tag.
fn element_from_parts(qname: rxml::QName, attrs: rxml::AttrMap) -> Element {
    let (namespace, name) = qname;
    let namespace = if namespace.is_none() {
        String::new()
    } else {
        namespace.as_str().to_owned()
    };
    let mut element = Element::new(name.as_str(), namespace);
    for ((attr_ns, attr_name), value) in attrs.into_iter() {
        element.set_attr(attr_key(&attr_ns, attr_name.as_str()), value);
    }
    element
}

fn header_from_attrs(attrs: rxml::AttrMap) -> StreamHeader {
    let mut header = StreamHeader::default();
    for ((attr_ns, attr_name), value) in attrs.into_iter() {
        match attr_key(&attr_ns, attr_name.as_str()).as_str() {
            "from" => header.from = Some(value),
            "to" => header.to = Some(value),
            "id" => header.id = Some(value),
            "version" => header.version = Some(value),
            "xml:lang" => header.lang = Some(value),
            _ => {}
        }
    }
    header
}

fn attr_key(namespace: &rxml::Namespace, name: &str) -> String {
    if namespace.is_none() {
        name.to_owned()
    } else if namespace.as_str() == ns::XML {
        format!("xml:{}", name)
    } else {
        name.to_owned()
    }
}

/// Parse a complete, self-contained XML document into an element tree.
///
/// Used for BOSH request bodies, where the whole `<body/>` wrapper arrives
/// as one HTTP payload.
pub async fn parse_document(bytes: &[u8]) -> Result<Element, DecodeError> {
    let mut reader = super::XmlReader::new(bytes);
    let mut stack: Vec<Element> = Vec::new();
    loop {
        let event = match reader.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                return Err(DecodeError::NotWellFormed(
                    "document ended before the root element closed".to_owned(),
                ))
            }
            Err(err) => return Err(DecodeError::from_read(err)),
        };
        match event {
            rxml::Event::XmlDeclaration(_, _) => {}
            rxml::Event::StartElement(_, qname, attrs) => {
                stack.push(element_from_parts(qname, attrs));
            }
            rxml::Event::Text(_, text) => {
                if let Some(top) = stack.last_mut() {
                    top.append_text(&text);
                }
            }
            rxml::Event::EndElement(_) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| DecodeError::NotWellFormed("unbalanced end tag".to_owned()))?;
                match stack.last_mut() {
                    Some(parent) => parent.append_child(el),
                    None => return Ok(el),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::XmlReader;

    /// Pump `input` through a reader + decoder, collecting stream events.
    async fn decode_all(input: &str) -> Result<Vec<StreamEvent>, DecodeError> {
        let mut reader = XmlReader::new(input.as_bytes());
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        loop {
            match reader.next_event().await {
                Ok(Some(event)) => {
                    if let Some(out) = decoder.process(event)? {
                        events.push(out);
                    }
                }
                Ok(None) => return Ok(events),
                Err(err) => return Err(DecodeError::from_read(err)),
            }
        }
    }

    #[tokio::test]
    async fn emits_header_then_stanzas() {
        let events = decode_all(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='vysper.org' version='1.0'>\
             <message to='user1@vysper.org'><body>hi</body></message>\
             <presence/>\
             </stream:stream>",
        )
        .await
        .unwrap();

        assert_eq!(events.len(), 4);
        match &events[0] {
            StreamEvent::StreamOpen(header) => {
                assert_eq!(header.to.as_deref(), Some("vysper.org"));
                assert_eq!(header.version.as_deref(), Some("1.0"));
            }
            other => panic!("expected StreamOpen, got {:?}", other),
        }
        match &events[1] {
            StreamEvent::Stanza(el) => {
                assert!(el.is("message", crate::ns::CLIENT));
                assert_eq!(
                    el.get_child("body", crate::ns::CLIENT).unwrap().text(),
                    "hi"
                );
            }
            other => panic!("expected Stanza, got {:?}", other),
        }
        assert!(matches!(&events[2], StreamEvent::Stanza(el) if el.name() == "presence"));
        assert!(matches!(&events[3], StreamEvent::StreamClose));
    }

    #[tokio::test]
    async fn whitespace_keepalives_are_dropped() {
        let events = decode_all(
            "<stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams'> \n \
             <presence/> \n </stream:stream>",
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn nonwhitespace_top_level_text_is_rejected() {
        let err = decode_all(
            "<stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams'>bogus<presence/>\
             </stream:stream>",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DecodeError::TextAtTopLevel));
    }

    #[tokio::test]
    async fn wrong_root_namespace_is_rejected() {
        let err = decode_all("<stream xmlns='jabber:client'><presence/></stream>")
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::BadStreamHeader(_)));
    }

    #[tokio::test]
    async fn doctype_is_restricted() {
        let err = decode_all("<!DOCTYPE html><stream:stream xmlns:stream='http://etherx.jabber.org/streams'>")
            .await
            .unwrap_err();
        assert!(
            matches!(err, DecodeError::RestrictedXml(_) | DecodeError::NotWellFormed(_)),
            "got {:?}",
            err
        );
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn processing_instruction_is_restricted() {
        let err = decode_all(
            "<stream:stream xmlns:stream='http://etherx.jabber.org/streams'>\
             <?php evil(); ?>",
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, DecodeError::RestrictedXml(_) | DecodeError::NotWellFormed(_)),
            "got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn nested_children_materialize_fully() {
        let events = decode_all(
            "<stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams'>\
             <iq type='set' id='b1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>tablet</resource></bind></iq></stream:stream>",
        )
        .await
        .unwrap();
        let iq = match &events[1] {
            StreamEvent::Stanza(el) => el,
            other => panic!("expected stanza, got {:?}", other),
        };
        let bind = iq.get_child("bind", crate::ns::BIND).unwrap();
        assert_eq!(
            bind.get_child("resource", crate::ns::BIND).unwrap().text(),
            "tablet"
        );
    }

    #[tokio::test]
    async fn reset_accepts_a_second_header() {
        let mut decoder = StreamDecoder::new();
        let first = "<stream:stream xmlns='jabber:client' \
                     xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let mut reader = XmlReader::new(first.as_bytes());
        let mut opens = 0;
        while let Ok(Some(event)) = reader.next_event().await {
            if let Some(StreamEvent::StreamOpen(_)) = decoder.process(event).unwrap() {
                opens += 1;
            }
        }
        decoder.reset();
        let second = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
                      xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let mut reader = XmlReader::new(second.as_bytes());
        while let Ok(Some(event)) = reader.next_event().await {
            if let Some(StreamEvent::StreamOpen(_)) = decoder.process(event).unwrap() {
                opens += 1;
            }
        }
        assert_eq!(opens, 2);
    }

    #[tokio::test]
    async fn parse_document_roundtrip() {
        let doc = "<body xmlns='http://jabber.org/protocol/httpbind' rid='1' \
                   to='vysper.org' wait='60'><message xmlns='jabber:client'>\
                   <body>hi</body></message></body>";
        let el = parse_document(doc.as_bytes()).await.unwrap();
        assert!(el.is("body", crate::ns::HTTPBIND));
        assert_eq!(el.attr("rid"), Some("1"));
        assert_eq!(el.child_count(), 1);
    }

    #[tokio::test]
    async fn rendering_is_idempotent_through_a_parse() {
        let message = crate::xml::Element::builder("message", crate::ns::CLIENT)
            .attr("from", "user2@vysper.org/phone")
            .attr("id", "m1")
            .attr("to", "user1@vysper.org")
            .attr("type", "chat")
            .append(
                crate::xml::Element::builder("body", crate::ns::CLIENT)
                    .text("three < two & one")
                    .build(),
            )
            .build();
        let rendered = message.to_xml();
        let reparsed = parse_document(rendered.as_bytes()).await.unwrap();
        assert_eq!(reparsed.to_xml(), rendered);
        assert_eq!(reparsed, message);
    }

    #[tokio::test]
    async fn parse_document_rejects_truncation() {
        let err = parse_document(b"<body xmlns='http://jabber.org/protocol/httpbind'>")
            .await
            .unwrap_err();
        assert!(
            matches!(err, DecodeError::NotWellFormed(_)),
            "got {:?}",
            err
        );
    }
}
