//! DIGEST-MD5 server mechanism (RFC 2831), `qop=auth` profile.
//!
//! Three steps: an empty initial response triggers the server challenge;
//! the client's digest response is verified against the stored password;
//! the `rspauth` value is sent back as a final challenge, acknowledged by
//! an empty response. `auth-int`/`auth-conf` are not offered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use rand::RngCore;
use tracing::debug;

use crate::error::SaslFailure;
use crate::sasl::{resolve_username, Mechanism, SaslIdentity, SaslOutcome};
use crate::storage::AccountStore;

enum State {
    Init,
    ChallengeSent,
    RspauthSent(SaslIdentity),
    Done,
}

/// Server-side DIGEST-MD5.
pub struct DigestMd5 {
    accounts: Arc<dyn AccountStore>,
    domain: String,
    state: State,
    nonce: String,
}

impl DigestMd5 {
    /// New mechanism instance for one exchange.
    pub fn new(accounts: Arc<dyn AccountStore>, domain: String) -> DigestMd5 {
        let mut raw = [0u8; 16];
        rand::rng().fill_bytes(&mut raw);
        DigestMd5 {
            accounts,
            domain,
            state: State::Init,
            nonce: hex::encode(raw),
        }
    }

    /// Deterministic nonce, for protocol vector tests.
    #[cfg(test)]
    pub(crate) fn with_nonce(
        accounts: Arc<dyn AccountStore>,
        domain: String,
        nonce: &str,
    ) -> DigestMd5 {
        DigestMd5 {
            accounts,
            domain,
            state: State::Init,
            nonce: nonce.to_owned(),
        }
    }

    fn challenge(&self) -> Vec<u8> {
        format!(
            "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
            self.domain, self.nonce
        )
        .into_bytes()
    }

    async fn verify_response(&mut self, payload: &[u8]) -> SaslOutcome {
        let Ok(message) = std::str::from_utf8(payload) else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let fields = parse_digest_fields(message);

        let (Some(username), Some(nonce), Some(cnonce), Some(nc), Some(digest_uri), Some(response)) = (
            fields.get("username"),
            fields.get("nonce"),
            fields.get("cnonce"),
            fields.get("nc"),
            fields.get("digest-uri"),
            fields.get("response"),
        ) else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };

        if nonce != &self.nonce || nc != "00000001" {
            return SaslOutcome::Failure(SaslFailure::NotAuthorized);
        }
        let qop = fields.get("qop").map(String::as_str).unwrap_or("auth");
        if qop != "auth" {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        }
        if !digest_uri.contains('/') {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        }
        let realm = fields.get("realm").map(String::as_str).unwrap_or("");
        let authzid = fields.get("authzid").map(String::as_str);

        let Some(jid) = resolve_username(username, &self.domain) else {
            return SaslOutcome::Failure(SaslFailure::NotAuthorized);
        };
        if let Some(authzid) = authzid {
            match resolve_username(authzid, &self.domain) {
                Some(authz_jid) if authz_jid == jid => {}
                _ => return SaslOutcome::Failure(SaslFailure::InvalidAuthzid),
            }
        }

        let password = match self.accounts.password_of(&jid).await {
            Ok(Some(password)) => password,
            Ok(None) => return SaslOutcome::Failure(SaslFailure::NotAuthorized),
            Err(_) => return SaslOutcome::Failure(SaslFailure::TemporaryAuthFailure),
        };

        let ha1 = compute_ha1(username, realm, &password, nonce, cnonce, authzid);
        let expected = compute_digest(&ha1, nonce, nc, cnonce, qop, "AUTHENTICATE", digest_uri);
        if &expected != response {
            debug!(jid = %jid, "DIGEST-MD5 response mismatch");
            return SaslOutcome::Failure(SaslFailure::NotAuthorized);
        }

        let rspauth = compute_digest(&ha1, nonce, nc, cnonce, qop, "", digest_uri);
        self.state = State::RspauthSent(SaslIdentity { jid });
        SaslOutcome::Challenge(format!("rspauth={rspauth}").into_bytes())
    }
}

#[async_trait]
impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    async fn step(&mut self, payload: &[u8]) -> SaslOutcome {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Init => {
                if !payload.is_empty() {
                    // DIGEST-MD5 has no client-first message.
                    return SaslOutcome::Failure(SaslFailure::MalformedRequest);
                }
                self.state = State::ChallengeSent;
                SaslOutcome::Challenge(self.challenge())
            }
            State::ChallengeSent => self.verify_response(payload).await,
            State::RspauthSent(identity) => {
                if !payload.is_empty() {
                    return SaslOutcome::Failure(SaslFailure::MalformedRequest);
                }
                debug!(jid = %identity.jid, "DIGEST-MD5 authentication succeeded");
                SaslOutcome::Success {
                    identity,
                    additional_data: None,
                }
            }
            State::Done => SaslOutcome::Failure(SaslFailure::MalformedRequest),
        }
    }
}

/// `HEX(H(H(user:realm:pass):nonce:cnonce[:authzid]))` per RFC 2831 §2.1.2.1.
fn compute_ha1(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    authzid: Option<&str>,
) -> String {
    let inner = Md5::digest(format!("{username}:{realm}:{password}").as_bytes());
    let mut a1: Vec<u8> = inner.to_vec();
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
    if let Some(authzid) = authzid {
        a1.extend_from_slice(format!(":{authzid}").as_bytes());
    }
    hex::encode(Md5::digest(&a1))
}

fn compute_digest(
    ha1: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: &str,
    method: &str,
    digest_uri: &str,
) -> String {
    let ha2 = hex::encode(Md5::digest(format!("{method}:{digest_uri}").as_bytes()));
    hex::encode(Md5::digest(
        format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}").as_bytes(),
    ))
}

/// Parse `key=value` fields separated by commas; values may be quoted and
/// contain escaped characters.
fn parse_digest_fields(message: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = message.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = stripped.char_indices();
            let mut consumed = stripped.len();
            while let Some((idx, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => {
                        consumed = idx + 1;
                        break;
                    }
                    other => out.push(other),
                }
            }
            value = out;
            rest = stripped[consumed..].trim_start().trim_start_matches(',');
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_owned();
            rest = rest[end..].trim_start_matches(',');
        }
        rest = rest.trim_start();
        fields.insert(key, value);
    }
    fields
}
