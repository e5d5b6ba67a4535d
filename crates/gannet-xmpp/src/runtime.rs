//! The server runtime context.
//!
//! Everything handlers need — configuration, the routing table, module
//! registry, storage providers, S2S links, the dialback secret — travels
//! through one explicitly passed [`ServerRuntimeContext`]. There are no
//! process-wide singletons; tests build as many independent runtimes as
//! they like.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::XmppConfig;
use crate::modules::ModuleRegistry;
use crate::roster::RosterStore;
use crate::router::RoutingTable;
use crate::s2s::{DialbackKey, S2sManager};
use crate::storage::{AccountStore, OfflineStore};

/// Shared, immutable-after-startup server state.
pub struct ServerRuntimeContext {
    config: XmppConfig,
    routing: RoutingTable,
    modules: ModuleRegistry,
    accounts: Arc<dyn AccountStore>,
    roster: Arc<dyn RosterStore>,
    offline: Arc<dyn OfflineStore>,
    s2s: S2sManager,
    dialback: DialbackKey,
    bind_seq: AtomicU64,
}

impl ServerRuntimeContext {
    /// Assemble a runtime with the default module registry.
    pub fn new(
        config: XmppConfig,
        accounts: Arc<dyn AccountStore>,
        roster: Arc<dyn RosterStore>,
        offline: Arc<dyn OfflineStore>,
    ) -> Arc<ServerRuntimeContext> {
        Self::with_parts(
            config,
            accounts,
            roster,
            offline,
            ModuleRegistry::with_defaults(),
            S2sManager::new(),
        )
    }

    /// Assemble a runtime from explicit parts (custom modules, S2S TLS).
    pub fn with_parts(
        config: XmppConfig,
        accounts: Arc<dyn AccountStore>,
        roster: Arc<dyn RosterStore>,
        offline: Arc<dyn OfflineStore>,
        modules: ModuleRegistry,
        s2s: S2sManager,
    ) -> Arc<ServerRuntimeContext> {
        let secret = config
            .s2s
            .secret
            .as_ref()
            .map(|secret| secret.as_bytes().to_vec())
            .unwrap_or_else(DialbackKey::generate_secret);
        Arc::new(ServerRuntimeContext {
            dialback: DialbackKey::new(&secret),
            routing: RoutingTable::new(),
            modules,
            accounts,
            roster,
            offline,
            s2s,
            config,
            bind_seq: AtomicU64::new(1),
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &XmppConfig {
        &self.config
    }

    /// The routing table.
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// The module registry.
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Account management provider.
    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    /// Roster provider.
    pub fn roster(&self) -> &Arc<dyn RosterStore> {
        &self.roster
    }

    /// Offline message store.
    pub fn offline(&self) -> &Arc<dyn OfflineStore> {
        &self.offline
    }

    /// Outbound S2S link registry.
    pub fn s2s(&self) -> &S2sManager {
        &self.s2s
    }

    /// The dialback key for this process.
    pub fn dialback(&self) -> &DialbackKey {
        &self.dialback
    }

    /// Next bind sequence number (monotonic, for routing tie-breaks).
    pub fn next_bind_seq(&self) -> u64 {
        self.bind_seq.fetch_add(1, Ordering::Relaxed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use test_support::test_runtime;

    #[test]
    fn bind_seq_is_monotonic() {
        let ctx = test_runtime("vysper.org");
        let a = ctx.next_bind_seq();
        let b = ctx.next_bind_seq();
        assert!(b > a);
    }

    #[test]
    fn secret_is_generated_when_absent() {
        let ctx = test_runtime("vysper.org");
        // Two runtimes must not share an auto-generated secret.
        let other = test_runtime("vysper.org");
        let key_a = ctx.dialback().generate("r.example", "o.example", "id1");
        let key_b = other.dialback().generate("r.example", "o.example", "id1");
        assert_ne!(key_a, key_b);
    }
}
