//! Storage provider interfaces.
//!
//! The core never persists anything itself; accounts, offline messages and
//! rosters are consumed through these traits. The in-memory implementations
//! back tests and single-node development use; production deployments plug
//! in their own backends.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use rand::RngCore;

use crate::error::XmppError;
use crate::jid::BareJid;
use crate::xml::Element;

/// PBKDF2 iteration count for freshly derived SCRAM credentials.
const SCRAM_ITERATIONS: u32 = 4096;

/// Salted credentials for SCRAM mechanisms.
///
/// Verifiers derive proofs from these; the plaintext never reaches the
/// SASL layer for SCRAM.
#[derive(Debug, Clone)]
pub struct ScramCredentials {
    /// Per-account random salt.
    pub salt: Vec<u8>,
    /// PBKDF2 iteration count.
    pub iterations: u32,
    /// `Hi(password, salt, iterations)` with HMAC-SHA-1.
    pub salted_password: Vec<u8>,
}

/// Account management provider.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Whether an account exists.
    async fn exists(&self, jid: &BareJid) -> Result<bool, XmppError>;

    /// Create an account with the given password.
    async fn add(&self, jid: &BareJid, password: &str) -> Result<(), XmppError>;

    /// Verify a plaintext password (PLAIN).
    async fn verify(&self, jid: &BareJid, password: &str) -> Result<bool, XmppError>;

    /// The stored plaintext password, for mechanisms that need to compute
    /// digests over it (DIGEST-MD5). Backends that refuse plaintext
    /// exposure return `None` and the mechanism fails closed.
    async fn password_of(&self, jid: &BareJid) -> Result<Option<String>, XmppError>;

    /// Salted SCRAM-SHA-1 credentials for the account.
    async fn scram_credentials(
        &self,
        jid: &BareJid,
    ) -> Result<Option<ScramCredentials>, XmppError>;
}

/// Offline message store.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Keep a message for a user with no available resource.
    async fn store(&self, to: &BareJid, message: Element) -> Result<(), XmppError>;

    /// Take all stored messages for a user, oldest first.
    async fn drain(&self, jid: &BareJid) -> Result<Vec<Element>, XmppError>;
}

/// Derive SCRAM-SHA-1 salted credentials from a plaintext password.
pub fn derive_scram_credentials(password: &str) -> ScramCredentials {
    let mut salt = vec![0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let mut salted_password = vec![0u8; 20];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(
        password.as_bytes(),
        &salt,
        SCRAM_ITERATIONS,
        &mut salted_password,
    );
    ScramCredentials {
        salt,
        iterations: SCRAM_ITERATIONS,
        salted_password,
    }
}

struct AccountRecord {
    password: String,
    scram: ScramCredentials,
}

/// In-memory account store.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<BareJid, AccountRecord>>,
}

impl MemoryAccountStore {
    /// Empty store.
    pub fn new() -> MemoryAccountStore {
        MemoryAccountStore::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn exists(&self, jid: &BareJid) -> Result<bool, XmppError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| XmppError::internal("account store poisoned"))?;
        Ok(accounts.contains_key(jid))
    }

    async fn add(&self, jid: &BareJid, password: &str) -> Result<(), XmppError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| XmppError::internal("account store poisoned"))?;
        accounts.insert(
            jid.clone(),
            AccountRecord {
                password: password.to_owned(),
                scram: derive_scram_credentials(password),
            },
        );
        Ok(())
    }

    async fn verify(&self, jid: &BareJid, password: &str) -> Result<bool, XmppError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| XmppError::internal("account store poisoned"))?;
        Ok(accounts
            .get(jid)
            .map(|record| record.password == password)
            .unwrap_or(false))
    }

    async fn password_of(&self, jid: &BareJid) -> Result<Option<String>, XmppError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| XmppError::internal("account store poisoned"))?;
        Ok(accounts.get(jid).map(|record| record.password.clone()))
    }

    async fn scram_credentials(
        &self,
        jid: &BareJid,
    ) -> Result<Option<ScramCredentials>, XmppError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| XmppError::internal("account store poisoned"))?;
        Ok(accounts.get(jid).map(|record| record.scram.clone()))
    }
}

/// In-memory offline message store.
#[derive(Default)]
pub struct MemoryOfflineStore {
    messages: RwLock<HashMap<BareJid, Vec<Element>>>,
}

impl MemoryOfflineStore {
    /// Empty store.
    pub fn new() -> MemoryOfflineStore {
        MemoryOfflineStore::default()
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn store(&self, to: &BareJid, message: Element) -> Result<(), XmppError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|_| XmppError::internal("offline store poisoned"))?;
        messages.entry(to.clone()).or_default().push(message);
        Ok(())
    }

    async fn drain(&self, jid: &BareJid) -> Result<Vec<Element>, XmppError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|_| XmppError::internal("offline store poisoned"))?;
        Ok(messages.remove(jid).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    fn jid(s: &str) -> BareJid {
        BareJid::new(s).unwrap()
    }

    #[tokio::test]
    async fn account_lifecycle() {
        let store = MemoryAccountStore::new();
        let user = jid("user1@vysper.org");

        assert!(!store.exists(&user).await.unwrap());
        store.add(&user, "password1").await.unwrap();
        assert!(store.exists(&user).await.unwrap());

        assert!(store.verify(&user, "password1").await.unwrap());
        assert!(!store.verify(&user, "wrong").await.unwrap());
        assert!(!store
            .verify(&jid("nobody@vysper.org"), "password1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scram_credentials_are_derivable() {
        let store = MemoryAccountStore::new();
        let user = jid("user1@vysper.org");
        store.add(&user, "password1").await.unwrap();

        let creds = store.scram_credentials(&user).await.unwrap().unwrap();
        assert_eq!(creds.iterations, SCRAM_ITERATIONS);
        assert_eq!(creds.salted_password.len(), 20);

        // Deriving with the same salt reproduces the stored key.
        let mut check = vec![0u8; 20];
        pbkdf2::pbkdf2_hmac::<sha1::Sha1>(
            b"password1",
            &creds.salt,
            creds.iterations,
            &mut check,
        );
        assert_eq!(check, creds.salted_password);
    }

    #[tokio::test]
    async fn offline_store_drains_in_order() {
        let store = MemoryOfflineStore::new();
        let user = jid("user1@vysper.org");

        for i in 0..3 {
            let msg = Element::builder("message", ns::CLIENT)
                .attr("id", format!("m{i}"))
                .build();
            store.store(&user, msg).await.unwrap();
        }

        let drained = store.drain(&user).await.unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].attr("id"), Some("m0"));
        assert_eq!(drained[2].attr("id"), Some("m2"));
        assert!(store.drain(&user).await.unwrap().is_empty());
    }
}
