//! SCRAM-SHA-1 server mechanism (RFC 5802).
//!
//! Two round trips: client-first → server-first (salt + iterations +
//! combined nonce), client-final → proof verification and the server
//! signature returned as additional data in `<success/>`. Channel binding
//! is not supported; the `n` and `y` gs2 flags are accepted, `p` is
//! rejected.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::SaslFailure;
use crate::sasl::{resolve_username, Mechanism, SaslIdentity, SaslOutcome};
use crate::storage::AccountStore;

enum State {
    Init,
    SentChallenge {
        gs2_header: Vec<u8>,
        client_first_bare: String,
        server_first: String,
        full_nonce: String,
        identity: SaslIdentity,
        salted_password: Vec<u8>,
    },
    Done,
}

/// Server-side SCRAM-SHA-1.
pub struct ScramSha1 {
    accounts: Arc<dyn AccountStore>,
    domain: String,
    state: State,
    nonce_suffix: String,
}

impl ScramSha1 {
    /// New mechanism instance for one exchange.
    pub fn new(accounts: Arc<dyn AccountStore>, domain: String) -> ScramSha1 {
        let mut raw = [0u8; 18];
        rand::rng().fill_bytes(&mut raw);
        ScramSha1 {
            accounts,
            domain,
            state: State::Init,
            nonce_suffix: BASE64.encode(raw),
        }
    }

    /// Deterministic server nonce, for protocol vector tests.
    #[cfg(test)]
    pub(crate) fn with_nonce_suffix(
        accounts: Arc<dyn AccountStore>,
        domain: String,
        nonce_suffix: &str,
    ) -> ScramSha1 {
        ScramSha1 {
            accounts,
            domain,
            state: State::Init,
            nonce_suffix: nonce_suffix.to_owned(),
        }
    }

    async fn client_first(&mut self, payload: &[u8]) -> SaslOutcome {
        let Ok(message) = std::str::from_utf8(payload) else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };

        // gs2-header is everything through the second comma.
        let mut commas = 0usize;
        let mut split = None;
        for (idx, b) in message.bytes().enumerate() {
            if b == b',' {
                commas += 1;
                if commas == 2 {
                    split = Some(idx + 1);
                    break;
                }
            }
        }
        let Some(split) = split else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let (gs2_header, client_first_bare) = message.split_at(split);

        match gs2_header.as_bytes().first() {
            Some(b'n') | Some(b'y') => {}
            Some(b'p') => return SaslOutcome::Failure(SaslFailure::MalformedRequest),
            _ => return SaslOutcome::Failure(SaslFailure::MalformedRequest),
        }

        let attrs = parse_scram_attrs(client_first_bare);
        if attrs.iter().any(|(k, _)| *k == "m") {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        }
        let Some(username) = attr_value(&attrs, "n") else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let Some(client_nonce) = attr_value(&attrs, "r") else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };

        let username = unescape_username(username);
        let Some(jid) = resolve_username(&username, &self.domain) else {
            return SaslOutcome::Failure(SaslFailure::NotAuthorized);
        };

        let credentials = match self.accounts.scram_credentials(&jid).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return SaslOutcome::Failure(SaslFailure::NotAuthorized),
            Err(_) => return SaslOutcome::Failure(SaslFailure::TemporaryAuthFailure),
        };

        let full_nonce = format!("{}{}", client_nonce, self.nonce_suffix);
        let server_first = format!(
            "r={},s={},i={}",
            full_nonce,
            BASE64.encode(&credentials.salt),
            credentials.iterations
        );

        self.state = State::SentChallenge {
            gs2_header: gs2_header.as_bytes().to_vec(),
            client_first_bare: client_first_bare.to_owned(),
            server_first: server_first.clone(),
            full_nonce,
            identity: SaslIdentity { jid },
            salted_password: credentials.salted_password,
        };
        SaslOutcome::Challenge(server_first.into_bytes())
    }

    fn client_final(
        payload: &[u8],
        gs2_header: &[u8],
        client_first_bare: &str,
        server_first: &str,
        full_nonce: &str,
        identity: &SaslIdentity,
        salted_password: &[u8],
    ) -> SaslOutcome {
        let Ok(message) = std::str::from_utf8(payload) else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let attrs = parse_scram_attrs(message);

        let Some(channel_binding) = attr_value(&attrs, "c") else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };
        match BASE64.decode(channel_binding) {
            Ok(decoded) if decoded == gs2_header => {}
            _ => return SaslOutcome::Failure(SaslFailure::MalformedRequest),
        }

        match attr_value(&attrs, "r") {
            Some(nonce) if nonce == full_nonce => {}
            _ => return SaslOutcome::Failure(SaslFailure::NotAuthorized),
        }

        let Some(sent_proof) = attr_value(&attrs, "p") else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let Ok(sent_proof) = BASE64.decode(sent_proof) else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };

        let client_final_without_proof = match message.rfind(",p=") {
            Some(idx) => &message[..idx],
            None => return SaslOutcome::Failure(SaslFailure::MalformedRequest),
        };
        let auth_message = format!(
            "{},{},{}",
            client_first_bare, server_first, client_final_without_proof
        );

        let client_key = hmac_sha1(salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key).to_vec();
        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        if proof != sent_proof {
            debug!(jid = %identity.jid, "SCRAM proof mismatch");
            return SaslOutcome::Failure(SaslFailure::NotAuthorized);
        }

        let server_key = hmac_sha1(salted_password, b"Server Key");
        let server_signature = hmac_sha1(&server_key, auth_message.as_bytes());
        let mut additional = b"v=".to_vec();
        additional.extend(BASE64.encode(server_signature).into_bytes());

        debug!(jid = %identity.jid, "SCRAM authentication succeeded");
        SaslOutcome::Success {
            identity: identity.clone(),
            additional_data: Some(additional),
        }
    }
}

#[async_trait]
impl Mechanism for ScramSha1 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    async fn step(&mut self, payload: &[u8]) -> SaslOutcome {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Init => {
                let outcome = self.client_first(payload).await;
                if matches!(outcome, SaslOutcome::Failure(_)) {
                    self.state = State::Done;
                }
                outcome
            }
            State::SentChallenge {
                gs2_header,
                client_first_bare,
                server_first,
                full_nonce,
                identity,
                salted_password,
            } => Self::client_final(
                payload,
                &gs2_header,
                &client_first_bare,
                &server_first,
                &full_nonce,
                &identity,
                &salted_password,
            ),
            State::Done => SaslOutcome::Failure(SaslFailure::MalformedRequest),
        }
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha1> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Split `k1=v1,k2=v2` into pairs; values may contain `=`.
fn parse_scram_attrs(message: &str) -> Vec<(&str, &str)> {
    message
        .split(',')
        .filter_map(|field| field.split_once('='))
        .collect()
}

fn attr_value<'a>(attrs: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Undo the `=2C` / `=3D` escapes in saslname.
fn unescape_username(name: &str) -> String {
    name.replace("=2C", ",").replace("=3D", "=")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XmppError;
    use crate::jid::BareJid;
    use crate::storage::ScramCredentials;

    /// Store serving the RFC 5802 §5 test vector for `user`/`pencil`.
    struct VectorStore;

    #[async_trait]
    impl AccountStore for VectorStore {
        async fn exists(&self, _jid: &BareJid) -> Result<bool, XmppError> {
            Ok(true)
        }
        async fn add(&self, _jid: &BareJid, _password: &str) -> Result<(), XmppError> {
            Ok(())
        }
        async fn verify(&self, _jid: &BareJid, _password: &str) -> Result<bool, XmppError> {
            Ok(false)
        }
        async fn password_of(&self, _jid: &BareJid) -> Result<Option<String>, XmppError> {
            Ok(None)
        }
        async fn scram_credentials(
            &self,
            jid: &BareJid,
        ) -> Result<Option<ScramCredentials>, XmppError> {
            if jid.node() != Some("user") {
                return Ok(None);
            }
            let salt = BASE64.decode("QSXCR+Q6sek8bf92").unwrap();
            let mut salted_password = vec![0u8; 20];
            pbkdf2::pbkdf2_hmac::<Sha1>(b"pencil", &salt, 4096, &mut salted_password);
            Ok(Some(ScramCredentials {
                salt,
                iterations: 4096,
                salted_password,
            }))
        }
    }

    fn vector_mechanism() -> ScramSha1 {
        ScramSha1::with_nonce_suffix(
            Arc::new(VectorStore),
            "example.org".to_owned(),
            "3rfcNHYJY1ZVvWVs7j",
        )
    }

    #[tokio::test]
    async fn rfc5802_vector_succeeds() {
        let mut mech = vector_mechanism();

        let challenge = match mech
            .step(b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL")
            .await
        {
            SaslOutcome::Challenge(data) => String::from_utf8(data).unwrap(),
            other => panic!("expected challenge, got {:?}", other),
        };
        assert_eq!(
            challenge,
            "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096"
        );

        let client_final = "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,\
                            p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=";
        match mech.step(client_final.as_bytes()).await {
            SaslOutcome::Success {
                identity,
                additional_data,
            } => {
                assert_eq!(identity.jid.node(), Some("user"));
                assert_eq!(
                    String::from_utf8(additional_data.unwrap()).unwrap(),
                    "v=rmF9pqV8S7suAoZWja4dJRkFsKQ="
                );
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_proof_fails() {
        let mut mech = vector_mechanism();
        let _ = mech.step(b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL").await;
        let client_final = "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,\
                            p=AAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        match mech.step(client_final.as_bytes()).await {
            SaslOutcome::Failure(SaslFailure::NotAuthorized) => {}
            other => panic!("expected not-authorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tampered_nonce_fails() {
        let mut mech = vector_mechanism();
        let _ = mech.step(b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL").await;
        let client_final =
            "c=biws,r=DIFFERENTNONCE,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=";
        match mech.step(client_final.as_bytes()).await {
            SaslOutcome::Failure(SaslFailure::NotAuthorized) => {}
            other => panic!("expected not-authorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn channel_binding_required_flag_is_rejected() {
        let mut mech = vector_mechanism();
        match mech
            .step(b"p=tls-unique,,n=user,r=fyko+d2lbbFgONRv9qkxdawL")
            .await
        {
            SaslOutcome::Failure(SaslFailure::MalformedRequest) => {}
            other => panic!("expected malformed-request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_user_fails() {
        let mut mech = vector_mechanism();
        match mech.step(b"n,,n=ghost,r=abcdef").await {
            SaslOutcome::Failure(SaslFailure::NotAuthorized) => {}
            other => panic!("expected not-authorized, got {:?}", other),
        }
    }

    #[test]
    fn username_unescaping() {
        assert_eq!(unescape_username("a=2Cb"), "a,b");
        assert_eq!(unescape_username("a=3Db"), "a=b");
        assert_eq!(unescape_username("plain"), "plain");
    }
}
