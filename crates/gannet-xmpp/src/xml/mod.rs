//! Stanza tree model and canonical renderer.
//!
//! An [`Element`] is a qualified name (namespace URI + local name), an
//! attribute list in insertion order, and an ordered list of child nodes
//! (elements or text). Rendering is deterministic: attributes in insertion
//! order, children in document order, text escaped, and an `xmlns`
//! declaration emitted wherever an element's namespace differs from its
//! parent context.

mod decoder;
mod reader;

pub use decoder::{parse_document, DecodeError, StreamDecoder, StreamEvent, StreamHeader};
pub use reader::XmlReader;

use std::fmt;

/// A child node: nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A nested element.
    Element(Element),
    /// A text node. Adjacent text nodes are coalesced on append.
    Text(String),
}

/// An XML element with resolved namespace, ordered attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Create an empty element with the given local name and namespace URI.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Element {
        Element {
            name: name.into(),
            namespace: namespace.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Start building an element.
    pub fn builder(name: impl Into<String>, namespace: impl Into<String>) -> ElementBuilder {
        ElementBuilder {
            element: Element::new(name, namespace),
        }
    }

    /// The local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace URI ("" when none).
    pub fn ns(&self) -> &str {
        &self.namespace
    }

    /// Whether this element has the given name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    /// Look up an attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing the value in place when the key exists.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    /// Remove an attribute, returning its previous value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(idx).1)
    }

    /// Iterate over attributes in insertion order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// All child nodes in document order.
    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Iterate over child elements only.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// The first child with the given name and namespace.
    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|el| el.is(name, namespace))
    }

    /// Whether a child with the given name and namespace exists.
    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.get_child(name, namespace).is_some()
    }

    /// The first child element regardless of name, if any.
    pub fn first_child(&self) -> Option<&Element> {
        self.children().next()
    }

    /// Number of child elements (text nodes not counted).
    pub fn child_count(&self) -> usize {
        self.children().count()
    }

    /// Append a child element.
    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Append character data, merging with a trailing text node.
    pub fn append_text(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            return;
        }
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_owned()));
        }
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Whether the element has no children at all.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Rewrite this element's namespace and, recursively, every descendant
    /// sharing the old one. Used when a stanza crosses between streams
    /// whose default namespaces differ (`jabber:server` → `jabber:client`).
    pub fn rescope_default_ns(&mut self, from: &str, to: &str) {
        if self.namespace == from {
            self.namespace = to.to_owned();
            for node in &mut self.children {
                if let Node::Element(child) = node {
                    child.rescope_default_ns(from, to);
                }
            }
        }
    }

    /// Serialize into `out`, assuming the surrounding default namespace is
    /// `parent_ns` (pass `""` for no context; the canonical form).
    pub fn serialize(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        out.push_str(&self.name);
        if !self.namespace.is_empty() && self.namespace != parent_ns {
            out.push_str(" xmlns='");
            escape_into(out, &self.namespace);
            out.push('\'');
        }
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            escape_into(out, value);
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.serialize(out, &self.namespace),
                Node::Text(t) => escape_into(out, t),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Canonical rendering with no outer namespace context.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.serialize(&mut out, "");
        out
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Builder for [`Element`], mirroring the construction order on the wire.
pub struct ElementBuilder {
    element: Element,
}

impl ElementBuilder {
    /// Add an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> ElementBuilder {
        self.element.set_attr(name, value);
        self
    }

    /// Add an attribute only when the value is present.
    pub fn attr_opt(
        mut self,
        name: impl Into<String>,
        value: Option<impl Into<String>>,
    ) -> ElementBuilder {
        if let Some(value) = value {
            self.element.set_attr(name, value);
        }
        self
    }

    /// Append a child element.
    pub fn append(mut self, child: Element) -> ElementBuilder {
        self.element.append_child(child);
        self
    }

    /// Append character data.
    pub fn text(mut self, text: impl AsRef<str>) -> ElementBuilder {
        self.element.append_text(text);
        self
    }

    /// Finish the element.
    pub fn build(self) -> Element {
        self.element
    }
}

/// XML-escape `s` into `out` (text and attribute contexts).
pub fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
}

/// XML-escape a string, allocating.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    escape_into(&mut out, s);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    #[test]
    fn build_and_query() {
        let message = Element::builder("message", ns::CLIENT)
            .attr("to", "user1@vysper.org")
            .attr("type", "chat")
            .append(Element::builder("body", ns::CLIENT).text("hello").build())
            .build();

        assert_eq!(message.name(), "message");
        assert_eq!(message.attr("type"), Some("chat"));
        assert_eq!(message.attr("missing"), None);
        let body = message.get_child("body", ns::CLIENT).unwrap();
        assert_eq!(body.text(), "hello");
    }

    #[test]
    fn attrs_render_in_insertion_order() {
        let el = Element::builder("iq", ns::CLIENT)
            .attr("type", "get")
            .attr("id", "a1")
            .attr("to", "vysper.org")
            .build();
        assert_eq!(
            el.to_xml(),
            "<iq xmlns='jabber:client' type='get' id='a1' to='vysper.org'/>"
        );
    }

    #[test]
    fn set_attr_keeps_position() {
        let mut el = Element::builder("iq", ns::CLIENT)
            .attr("type", "get")
            .attr("id", "a1")
            .build();
        el.set_attr("type", "result");
        assert_eq!(
            el.to_xml(),
            "<iq xmlns='jabber:client' type='result' id='a1'/>"
        );
    }

    #[test]
    fn xmlns_emitted_only_on_namespace_change() {
        let iq = Element::builder("iq", ns::CLIENT)
            .attr("type", "set")
            .append(
                Element::builder("bind", ns::BIND)
                    .append(Element::builder("resource", ns::BIND).text("tablet").build())
                    .build(),
            )
            .build();
        let mut out = String::new();
        iq.serialize(&mut out, ns::CLIENT);
        assert_eq!(
            out,
            "<iq type='set'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>tablet</resource>\
             </bind></iq>"
        );
    }

    #[test]
    fn text_is_escaped() {
        let el = Element::builder("body", ns::CLIENT)
            .text("a < b & c > 'd'")
            .build();
        let mut out = String::new();
        el.serialize(&mut out, ns::CLIENT);
        assert_eq!(out, "<body>a &lt; b &amp; c &gt; &apos;d&apos;</body>");
    }

    #[test]
    fn adjacent_text_coalesces() {
        let mut el = Element::new("body", ns::CLIENT);
        el.append_text("hel");
        el.append_text("lo");
        assert_eq!(el.nodes().len(), 1);
        assert_eq!(el.text(), "hello");
    }

    #[test]
    fn empty_element_self_closes() {
        let el = Element::new("ping", ns::PING);
        assert_eq!(el.to_xml(), "<ping xmlns='urn:xmpp:ping'/>");
    }

    #[test]
    fn rescope_rewrites_matching_subtree_only() {
        let mut message = Element::builder("message", ns::SERVER)
            .append(Element::builder("body", ns::SERVER).text("hi").build())
            .append(Element::new("ping", ns::PING))
            .build();
        message.rescope_default_ns(ns::SERVER, ns::CLIENT);
        assert_eq!(message.ns(), ns::CLIENT);
        assert!(message.has_child("body", ns::CLIENT));
        // Foreign-namespace children keep their scope.
        assert!(message.has_child("ping", ns::PING));
    }
}
