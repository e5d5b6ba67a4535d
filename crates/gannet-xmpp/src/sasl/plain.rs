//! PLAIN mechanism (RFC 4616). Only offered over TLS.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::SaslFailure;
use crate::sasl::{resolve_username, Mechanism, SaslIdentity, SaslOutcome};
use crate::storage::AccountStore;

/// Server-side PLAIN: one message, `authzid NUL authcid NUL passwd`.
pub struct Plain {
    accounts: Arc<dyn AccountStore>,
    domain: String,
    done: bool,
}

impl Plain {
    /// New mechanism instance for one exchange.
    pub fn new(accounts: Arc<dyn AccountStore>, domain: String) -> Plain {
        Plain {
            accounts,
            domain,
            done: false,
        }
    }
}

#[async_trait]
impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    async fn step(&mut self, payload: &[u8]) -> SaslOutcome {
        if self.done {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        }
        self.done = true;

        let Ok(message) = std::str::from_utf8(payload) else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let mut parts = message.split('\0');
        let (Some(authzid), Some(authcid), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        };
        if authcid.is_empty() || password.is_empty() {
            return SaslOutcome::Failure(SaslFailure::MalformedRequest);
        }

        let Some(jid) = resolve_username(authcid, &self.domain) else {
            return SaslOutcome::Failure(SaslFailure::NotAuthorized);
        };

        // A non-empty authzid must name the authenticated identity itself;
        // acting on behalf of other entities is not supported.
        if !authzid.is_empty() {
            match resolve_username(authzid, &self.domain) {
                Some(authz_jid) if authz_jid == jid => {}
                _ => return SaslOutcome::Failure(SaslFailure::InvalidAuthzid),
            }
        }

        match self.accounts.verify(&jid, password).await {
            Ok(true) => {
                debug!(jid = %jid, "PLAIN authentication succeeded");
                SaslOutcome::Success {
                    identity: SaslIdentity { jid },
                    additional_data: None,
                }
            }
            Ok(false) => {
                debug!(jid = %jid, "PLAIN authentication rejected");
                SaslOutcome::Failure(SaslFailure::NotAuthorized)
            }
            Err(_) => SaslOutcome::Failure(SaslFailure::TemporaryAuthFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::BareJid;
    use crate::storage::MemoryAccountStore;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    async fn store_with_user1() -> Arc<dyn AccountStore> {
        let store = MemoryAccountStore::new();
        store
            .add(&BareJid::new("user1@vysper.org").unwrap(), "password1")
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn accepts_the_documented_exchange() {
        // `AHVzZXIxAHBhc3N3b3JkMQ==` = \0user1\0password1
        let payload = BASE64.decode("AHVzZXIxAHBhc3N3b3JkMQ==").unwrap();
        let mut mech = Plain::new(store_with_user1().await, "vysper.org".to_owned());
        match mech.step(&payload).await {
            SaslOutcome::Success { identity, .. } => {
                assert_eq!(identity.jid.to_string(), "user1@vysper.org");
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let mut mech = Plain::new(store_with_user1().await, "vysper.org".to_owned());
        match mech.step(b"\0user1\0wrong").await {
            SaslOutcome::Failure(SaslFailure::NotAuthorized) => {}
            other => panic!("expected not-authorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_unknown_user() {
        let mut mech = Plain::new(store_with_user1().await, "vysper.org".to_owned());
        match mech.step(b"\0nobody\0password1").await {
            SaslOutcome::Failure(SaslFailure::NotAuthorized) => {}
            other => panic!("expected not-authorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_foreign_authzid() {
        let mut mech = Plain::new(store_with_user1().await, "vysper.org".to_owned());
        match mech.step(b"someoneelse\0user1\0password1").await {
            SaslOutcome::Failure(SaslFailure::InvalidAuthzid) => {}
            other => panic!("expected invalid-authzid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accepts_matching_authzid_and_full_authcid() {
        let mut mech = Plain::new(store_with_user1().await, "vysper.org".to_owned());
        match mech.step(b"user1\0user1@vysper.org\0password1").await {
            SaslOutcome::Success { identity, .. } => {
                assert_eq!(identity.jid.node(), Some("user1"));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_malformed_payloads() {
        let mut mech = Plain::new(store_with_user1().await, "vysper.org".to_owned());
        match mech.step(b"no separators here").await {
            SaslOutcome::Failure(SaslFailure::MalformedRequest) => {}
            other => panic!("expected malformed-request, got {:?}", other),
        }

        let mut mech = Plain::new(store_with_user1().await, "vysper.org".to_owned());
        match mech.step(b"\0a\0b\0c").await {
            SaslOutcome::Failure(SaslFailure::MalformedRequest) => {}
            other => panic!("expected malformed-request, got {:?}", other),
        }
    }
}
