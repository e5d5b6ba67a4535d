//! Server Dialback key generation and verification (XEP-0220).
//!
//! The key for a stream is
//! `hex(HMAC-SHA256(secret, SHA256(receiving "|" originating "|" streamId)))`
//! where `secret` is process-wide, regenerated at each start unless
//! configured. Generation and verification are deterministic and
//! stateless apart from that secret.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::ns;
use crate::xml::Element;

/// Dialback key generator/verifier around the process secret.
#[derive(Clone)]
pub struct DialbackKey {
    secret: Vec<u8>,
}

impl std::fmt::Debug for DialbackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialbackKey")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl DialbackKey {
    /// Wrap a configured secret.
    pub fn new(secret: &[u8]) -> DialbackKey {
        DialbackKey {
            secret: secret.to_vec(),
        }
    }

    /// Generate a fresh random secret (per process start).
    pub fn generate_secret() -> Vec<u8> {
        let mut secret = vec![0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        secret
    }

    /// Compute the key for `(receiving, originating, stream_id)`.
    pub fn generate(&self, receiving: &str, originating: &str, stream_id: &str) -> String {
        let material = Sha256::digest(
            format!("{receiving}|{originating}|{stream_id}").as_bytes(),
        );
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(&material);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Whether `key` is the valid key for the triple.
    pub fn verify(&self, key: &str, receiving: &str, originating: &str, stream_id: &str) -> bool {
        let expected = self.generate(receiving, originating, stream_id);
        // Hex strings of fixed length; compare without short-circuiting on
        // the first differing byte.
        if expected.len() != key.len() {
            return false;
        }
        expected
            .bytes()
            .zip(key.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Build `<db:result from to>key</db:result>` for the initiating side.
pub fn build_db_result(from: &str, to: &str, key: &str) -> Element {
    Element::builder("result", ns::DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .text(key)
        .build()
}

/// Build the answer to a `db:result`, `type` is `valid` or `invalid`.
pub fn build_db_result_answer(from: &str, to: &str, valid: bool) -> Element {
    Element::builder("result", ns::DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .attr("type", if valid { "valid" } else { "invalid" })
        .build()
}

/// Build `<db:verify from to id>key</db:verify>` for the verify connection.
pub fn build_db_verify(from: &str, to: &str, stream_id: &str, key: &str) -> Element {
    Element::builder("verify", ns::DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .attr("id", stream_id)
        .text(key)
        .build()
}

/// Build the answer to a `db:verify`.
pub fn build_db_verify_answer(from: &str, to: &str, stream_id: &str, valid: bool) -> Element {
    Element::builder("verify", ns::DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .attr("id", stream_id)
        .attr("type", if valid { "valid" } else { "invalid" })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIVING: &str = "xmpp.example.com";
    const ORIGINATING: &str = "example.org";
    const STREAM_ID: &str = "D60000229F";

    #[test]
    fn generate_verify_roundtrip() {
        let dialback = DialbackKey::new(b"some-shared-secret");
        let key = dialback.generate(RECEIVING, ORIGINATING, STREAM_ID);
        assert!(dialback.verify(&key, RECEIVING, ORIGINATING, STREAM_ID));
    }

    #[test]
    fn generation_is_deterministic() {
        let dialback = DialbackKey::new(b"some-shared-secret");
        assert_eq!(
            dialback.generate(RECEIVING, ORIGINATING, STREAM_ID),
            dialback.generate(RECEIVING, ORIGINATING, STREAM_ID)
        );
    }

    #[test]
    fn altering_any_argument_invalidates() {
        let dialback = DialbackKey::new(b"some-shared-secret");
        let key = dialback.generate(RECEIVING, ORIGINATING, STREAM_ID);

        assert!(!dialback.verify(&key, "other.example.com", ORIGINATING, STREAM_ID));
        assert!(!dialback.verify(&key, RECEIVING, "other.org", STREAM_ID));
        assert!(!dialback.verify(&key, RECEIVING, ORIGINATING, "FFFF000000"));
        assert!(!dialback.verify("1234567890", RECEIVING, ORIGINATING, STREAM_ID));
    }

    #[test]
    fn different_secrets_disagree() {
        let a = DialbackKey::new(b"secret-a");
        let b = DialbackKey::new(b"secret-b");
        let key = a.generate(RECEIVING, ORIGINATING, STREAM_ID);
        assert!(!b.verify(&key, RECEIVING, ORIGINATING, STREAM_ID));
    }

    #[test]
    fn wire_elements() {
        let result = build_db_result("example.org", "xmpp.example.com", "abc123");
        assert!(result.is("result", ns::DIALBACK));
        assert_eq!(result.text(), "abc123");

        let verify = build_db_verify("xmpp.example.com", "example.org", STREAM_ID, "abc123");
        assert_eq!(verify.attr("id"), Some(STREAM_ID));

        let answer = build_db_verify_answer("a", "b", STREAM_ID, true);
        assert_eq!(answer.attr("type"), Some("valid"));
    }
}
