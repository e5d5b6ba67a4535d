//! SASL server mechanisms.
//!
//! Each mechanism is a state object driven by [`Mechanism::step`] with the
//! raw (base64-decoded) client payloads; the XML framing (`<auth/>`,
//! `<challenge/>`, `<response/>`, `<success/>`, `<failure/>`) lives in the
//! session layer. Credentials come from the [`AccountStore`]; plaintext
//! never appears in logs.

mod digest_md5;
mod plain;
mod scram;

pub use digest_md5::DigestMd5;
pub use plain::Plain;
pub use scram::ScramSha1;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{SaslMechanismKind, XmppConfig};
use crate::error::SaslFailure;
use crate::jid::BareJid;
use crate::storage::AccountStore;

/// The identity established by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslIdentity {
    /// The authenticated bare JID.
    pub jid: BareJid,
}

/// Result of one mechanism step.
#[derive(Debug)]
pub enum SaslOutcome {
    /// Send a `<challenge/>` with this payload and wait for a response.
    Challenge(Vec<u8>),
    /// Authentication succeeded; `additional_data` rides in `<success/>`.
    Success {
        /// Who authenticated.
        identity: SaslIdentity,
        /// Mechanism-final data (e.g. the SCRAM server signature).
        additional_data: Option<Vec<u8>>,
    },
    /// Authentication failed.
    Failure(SaslFailure),
}

/// A server-side SASL mechanism.
#[async_trait]
pub trait Mechanism: Send {
    /// The mechanism name as advertised in stream features.
    fn name(&self) -> &'static str;

    /// Consume one client payload. The initial payload from `<auth/>` may
    /// be empty for mechanisms where the server speaks first.
    async fn step(&mut self, payload: &[u8]) -> SaslOutcome;
}

/// Instantiate a mechanism by kind.
pub fn create_mechanism(
    kind: SaslMechanismKind,
    accounts: Arc<dyn AccountStore>,
    domain: String,
) -> Box<dyn Mechanism> {
    match kind {
        SaslMechanismKind::Plain => Box::new(Plain::new(accounts, domain)),
        SaslMechanismKind::DigestMd5 => Box::new(DigestMd5::new(accounts, domain)),
        SaslMechanismKind::ScramSha1 => Box::new(ScramSha1::new(accounts, domain)),
    }
}

/// The mechanisms offered in the current stream state.
///
/// PLAIN is withheld until the stream is encrypted.
pub fn offered_mechanisms(config: &XmppConfig, encrypted: bool) -> Vec<SaslMechanismKind> {
    config
        .sasl
        .mechanisms
        .iter()
        .copied()
        .filter(|kind| encrypted || *kind != SaslMechanismKind::Plain)
        .collect()
}

/// Parse `<auth mechanism='...'>base64</auth>`, decoding the payload.
///
/// The single `=` placeholder for an empty initial response decodes to an
/// empty payload (RFC 6120 §6.4.2).
pub fn parse_auth(el: &crate::xml::Element) -> Option<(String, Vec<u8>)> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    if !el.is("auth", crate::ns::SASL) {
        return None;
    }
    let mechanism = el.attr("mechanism")?.to_owned();
    let text = el.text();
    let trimmed = text.trim();
    let payload = if trimmed.is_empty() || trimmed == "=" {
        Vec::new()
    } else {
        BASE64.decode(trimmed).ok()?
    };
    Some((mechanism, payload))
}

/// Parse `<response>base64</response>`.
pub fn parse_response(el: &crate::xml::Element) -> Option<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    if !el.is("response", crate::ns::SASL) {
        return None;
    }
    let text = el.text();
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        Some(Vec::new())
    } else {
        BASE64.decode(trimmed).ok()
    }
}

/// Build `<challenge>base64</challenge>`.
pub fn build_challenge(data: &[u8]) -> crate::xml::Element {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    crate::xml::Element::builder("challenge", crate::ns::SASL)
        .text(BASE64.encode(data))
        .build()
}

/// Build `<success/>`, carrying mechanism-final data when present.
pub fn build_success(additional_data: Option<&[u8]>) -> crate::xml::Element {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    let mut success = crate::xml::Element::new("success", crate::ns::SASL);
    if let Some(data) = additional_data {
        success.append_text(BASE64.encode(data));
    }
    success
}

/// Build `<failure><KIND/></failure>`.
pub fn build_failure(failure: SaslFailure) -> crate::xml::Element {
    crate::xml::Element::builder("failure", crate::ns::SASL)
        .append(crate::xml::Element::new(failure.as_str(), crate::ns::SASL))
        .build()
}

/// Build the `<mechanisms/>` feature for the offered mechanism list.
pub fn build_mechanisms_feature(kinds: &[SaslMechanismKind]) -> crate::xml::Element {
    let mut mechanisms = crate::xml::Element::new("mechanisms", crate::ns::SASL);
    for kind in kinds {
        mechanisms.append_child(
            crate::xml::Element::builder("mechanism", crate::ns::SASL)
                .text(kind.as_str())
                .build(),
        );
    }
    mechanisms
}

/// Resolve a SASL username (localpart or full address) against the served
/// domain. Returns `None` for addresses outside the domain.
pub(crate) fn resolve_username(username: &str, domain: &str) -> Option<BareJid> {
    let jid = if username.contains('@') {
        BareJid::new(username).ok()?
    } else {
        BareJid::from_parts(Some(username), domain).ok()?
    };
    if !jid.domain().eq_ignore_ascii_case(domain) {
        return None;
    }
    Some(jid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_is_withheld_without_tls() {
        let config = XmppConfig::for_domain("vysper.org");
        let offered = offered_mechanisms(&config, false);
        assert!(!offered.contains(&SaslMechanismKind::Plain));
        assert!(offered.contains(&SaslMechanismKind::ScramSha1));

        let offered = offered_mechanisms(&config, true);
        assert!(offered.contains(&SaslMechanismKind::Plain));
    }

    #[test]
    fn auth_parsing() {
        let auth = crate::xml::Element::builder("auth", crate::ns::SASL)
            .attr("mechanism", "PLAIN")
            .text("AHVzZXIxAHBhc3N3b3JkMQ==")
            .build();
        let (mechanism, payload) = parse_auth(&auth).unwrap();
        assert_eq!(mechanism, "PLAIN");
        assert_eq!(payload, b"\0user1\0password1");

        let empty = crate::xml::Element::builder("auth", crate::ns::SASL)
            .attr("mechanism", "DIGEST-MD5")
            .text("=")
            .build();
        let (_, payload) = parse_auth(&empty).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn failure_and_mechanisms_rendering() {
        let failure = build_failure(crate::error::SaslFailure::NotAuthorized);
        assert!(failure.has_child("not-authorized", crate::ns::SASL));

        let feature = build_mechanisms_feature(&[
            SaslMechanismKind::ScramSha1,
            SaslMechanismKind::Plain,
        ]);
        let names: Vec<String> = feature.children().map(|m| m.text()).collect();
        assert_eq!(names, ["SCRAM-SHA-1", "PLAIN"]);
    }

    #[test]
    fn username_resolution() {
        let jid = resolve_username("user1", "vysper.org").unwrap();
        assert_eq!(jid.to_string(), "user1@vysper.org");

        let jid = resolve_username("user1@vysper.org", "vysper.org").unwrap();
        assert_eq!(jid.to_string(), "user1@vysper.org");

        assert!(resolve_username("user1@elsewhere.org", "vysper.org").is_none());
        assert!(resolve_username("", "vysper.org").is_none());
    }
}
