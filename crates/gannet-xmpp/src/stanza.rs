//! Typed views over the three stanza kinds and reply builders.
//!
//! Stanzas stay plain [`Element`]s throughout the pipeline; the views here
//! validate the structural invariants on demand (addresses parse as JIDs,
//! `iq` get/set carries exactly one payload child) and the builders produce
//! the standard result/error replies.

use crate::error::{StanzaErrorCondition, XmppError};
use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

/// Whether an element is one of the three stanza kinds.
pub fn is_stanza(el: &Element) -> bool {
    matches!(el.name(), "message" | "presence" | "iq")
}

/// Parse the `to` attribute as a JID, if present.
pub fn to_address(el: &Element) -> Result<Option<Jid>, XmppError> {
    match el.attr("to") {
        Some(raw) => Ok(Some(Jid::new(raw).map_err(|_| {
            XmppError::stanza_with_text(StanzaErrorCondition::BadRequest, "invalid 'to' address")
        })?)),
        None => Ok(None),
    }
}

/// Parse the `from` attribute as a JID, if present.
pub fn from_address(el: &Element) -> Result<Option<Jid>, XmppError> {
    match el.attr("from") {
        Some(raw) => Ok(Some(Jid::new(raw).map_err(|_| {
            XmppError::stanza_with_text(StanzaErrorCondition::BadRequest, "invalid 'from' address")
        })?)),
        None => Ok(None),
    }
}

/// The `type` of a message stanza; `normal` when absent (RFC 6121 §5.2.2).
pub fn message_type(el: &Element) -> &str {
    el.attr("type").unwrap_or("normal")
}

/// The `type` of a presence stanza; `None` means available presence.
pub fn presence_type(el: &Element) -> Option<&str> {
    el.attr("type")
}

/// The priority advertised in a presence stanza, clamped per RFC 6121.
pub fn presence_priority(el: &Element) -> i8 {
    el.get_child("priority", el.ns())
        .and_then(|p| p.text().trim().parse::<i16>().ok())
        .map(|p| p.clamp(-128, 127) as i8)
        .unwrap_or(0)
}

/// The `type` attribute of an iq stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    /// Request for information.
    Get,
    /// Request to change state.
    Set,
    /// Successful response.
    Result,
    /// Error response.
    Error,
}

impl IqType {
    /// Parse the attribute value.
    pub fn from_str(s: &str) -> Option<IqType> {
        match s {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }

    /// The attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

/// A validated view over an `<iq/>` stanza.
#[derive(Debug)]
pub struct IqView<'a> {
    /// The stanza id.
    pub id: &'a str,
    /// The request/response kind.
    pub iq_type: IqType,
    /// Parsed `from` address, if present.
    pub from: Option<Jid>,
    /// Parsed `to` address, if present.
    pub to: Option<Jid>,
    /// The payload child for get/set; first non-error child otherwise.
    pub payload: Option<&'a Element>,
}

impl<'a> IqView<'a> {
    /// Validate and destructure an iq element.
    ///
    /// Enforces: an `id` is present, the `type` is one of get/set/result/
    /// error, addresses parse, get/set carry exactly one payload child, and
    /// at most one `error` child exists.
    pub fn parse(el: &'a Element) -> Result<IqView<'a>, XmppError> {
        let id = el.attr("id").ok_or_else(|| {
            XmppError::stanza_with_text(StanzaErrorCondition::BadRequest, "iq without id")
        })?;
        let iq_type = el
            .attr("type")
            .and_then(IqType::from_str)
            .ok_or_else(|| {
                XmppError::stanza_with_text(StanzaErrorCondition::BadRequest, "bad iq type")
            })?;

        let error_children = el.children().filter(|c| c.name() == "error").count();
        if error_children > 1 {
            return Err(XmppError::stanza_with_text(
                StanzaErrorCondition::BadRequest,
                "multiple error children",
            ));
        }

        let payload_children: Vec<&Element> =
            el.children().filter(|c| c.name() != "error").collect();
        if matches!(iq_type, IqType::Get | IqType::Set) && payload_children.len() != 1 {
            return Err(XmppError::stanza_with_text(
                StanzaErrorCondition::BadRequest,
                "iq get/set requires exactly one payload child",
            ));
        }

        Ok(IqView {
            id,
            iq_type,
            from: from_address(el)?,
            to: to_address(el)?,
            payload: payload_children.first().copied(),
        })
    }
}

/// Build an iq result for `request`, optionally carrying a payload.
pub fn make_iq_result(request: &Element, from: Option<&str>, payload: Option<Element>) -> Element {
    let mut reply = Element::builder("iq", request.ns())
        .attr("type", "result")
        .attr_opt("id", request.attr("id"))
        .attr_opt("to", request.attr("from"))
        .attr_opt("from", from)
        .build();
    if let Some(payload) = payload {
        reply.append_child(payload);
    }
    reply
}

/// If `iq` is a resource-binding set, return the requested resource
/// (`None` inside means the server picks one).
pub fn bind_request(iq: &Element) -> Option<Option<String>> {
    if iq.attr("type") != Some("set") {
        return None;
    }
    let bind = iq.get_child("bind", ns::BIND)?;
    let resource = bind
        .get_child("resource", ns::BIND)
        .map(|r| r.text().trim().to_owned())
        .filter(|r| !r.is_empty());
    Some(resource)
}

/// Build the result for a successful resource binding.
pub fn make_bind_result(iq: &Element, full: &crate::jid::FullJid) -> Element {
    make_iq_result(
        iq,
        None,
        Some(
            Element::builder("bind", ns::BIND)
                .append(
                    Element::builder("jid", ns::BIND)
                        .text(full.to_string())
                        .build(),
                )
                .build(),
        ),
    )
}

/// Build an error reply of the same kind as `original`.
///
/// The reply swaps the addresses, carries `type='error'`, echoes the
/// original payload and appends the `<error/>` description.
pub fn make_error_reply(
    original: &Element,
    condition: StanzaErrorCondition,
    text: Option<&str>,
) -> Element {
    let mut reply = Element::builder(original.name(), original.ns())
        .attr("type", "error")
        .attr_opt("id", original.attr("id"))
        .attr_opt("to", original.attr("from"))
        .attr_opt("from", original.attr("to"))
        .build();

    for child in original.children() {
        if child.name() != "error" {
            reply.append_child(child.clone());
        }
    }

    let mut error = Element::builder("error", original.ns())
        .attr("type", condition.error_type())
        .append(Element::new(condition.as_str(), ns::STANZAS))
        .build();
    if let Some(text) = text {
        error.append_child(
            Element::builder("text", ns::STANZAS).text(text).build(),
        );
    }
    reply.append_child(error);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_iq() -> Element {
        Element::builder("iq", ns::CLIENT)
            .attr("type", "get")
            .attr("id", "p1")
            .attr("from", "user1@vysper.org/tablet")
            .attr("to", "vysper.org")
            .append(Element::new("ping", ns::PING))
            .build()
    }

    #[test]
    fn iq_view_parses_get() {
        let iq = ping_iq();
        let view = IqView::parse(&iq).unwrap();
        assert_eq!(view.id, "p1");
        assert_eq!(view.iq_type, IqType::Get);
        assert_eq!(view.to.unwrap().domain(), "vysper.org");
        assert!(view.payload.unwrap().is("ping", ns::PING));
    }

    #[test]
    fn iq_get_requires_one_payload() {
        let iq = Element::builder("iq", ns::CLIENT)
            .attr("type", "get")
            .attr("id", "p2")
            .build();
        assert!(IqView::parse(&iq).is_err());

        let iq = Element::builder("iq", ns::CLIENT)
            .attr("type", "get")
            .attr("id", "p3")
            .append(Element::new("ping", ns::PING))
            .append(Element::new("ping", ns::PING))
            .build();
        assert!(IqView::parse(&iq).is_err());
    }

    #[test]
    fn iq_rejects_bad_addresses() {
        let iq = Element::builder("iq", ns::CLIENT)
            .attr("type", "get")
            .attr("id", "p4")
            .attr("to", "@bad@")
            .append(Element::new("ping", ns::PING))
            .build();
        assert!(IqView::parse(&iq).is_err());
    }

    #[test]
    fn result_swaps_addresses() {
        let iq = ping_iq();
        let reply = make_iq_result(&iq, Some("vysper.org"), None);
        assert_eq!(reply.attr("type"), Some("result"));
        assert_eq!(reply.attr("id"), Some("p1"));
        assert_eq!(reply.attr("to"), Some("user1@vysper.org/tablet"));
        assert_eq!(reply.attr("from"), Some("vysper.org"));
    }

    #[test]
    fn error_reply_carries_condition_and_payload() {
        let iq = ping_iq();
        let reply = make_error_reply(&iq, StanzaErrorCondition::ServiceUnavailable, None);
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(reply.attr("to"), Some("user1@vysper.org/tablet"));
        assert!(reply.has_child("ping", ns::PING));
        let error = reply.get_child("error", ns::CLIENT).unwrap();
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.has_child("service-unavailable", ns::STANZAS));
    }

    #[test]
    fn message_defaults() {
        let msg = Element::new("message", ns::CLIENT);
        assert_eq!(message_type(&msg), "normal");
        assert_eq!(presence_priority(&msg), 0);
    }

    #[test]
    fn presence_priority_parses() {
        let presence = Element::builder("presence", ns::CLIENT)
            .append(Element::builder("priority", ns::CLIENT).text("7").build())
            .build();
        assert_eq!(presence_priority(&presence), 7);
    }
}
