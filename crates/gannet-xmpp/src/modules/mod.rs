//! Server feature modules.
//!
//! A module claims one or more payload namespaces; the router hands it
//! every `<iq/>` whose payload child lives in one of them, before any local
//! delivery. Modules are registered explicitly at startup into the
//! [`ModuleRegistry`]; a module returns its reply synchronously or spawns
//! its own continuation and returns `None`.
//!
//! Shipped modules:
//! - **XEP-0199**: XMPP Ping - liveness checks.
//! - **XEP-0202**: Entity Time - server clock and timezone offset.
//! - **XEP-0092**: Software Version - name/version/os triple.
//! - **RFC 6121**: Roster get/set with pushes to interested resources.

pub mod ping;
pub mod roster_module;
pub mod time;
pub mod version;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::XmppError;
use crate::jid::FullJid;
use crate::runtime::ServerRuntimeContext;
use crate::xml::Element;

/// A handler for iq payloads in a set of namespaces.
#[async_trait]
pub trait Module: Send + Sync {
    /// Module name for logs.
    fn name(&self) -> &'static str;

    /// Payload namespaces this module claims.
    fn namespaces(&self) -> &'static [&'static str];

    /// Handle an iq whose payload is in one of the claimed namespaces.
    ///
    /// `from` is the bound JID of the local session the stanza came from,
    /// when it came from one. Returning `Ok(Some(reply))` sends the reply
    /// back to the sender; `Ok(None)` means the module handles any response
    /// itself (or there is nothing to say).
    async fn handle_iq(
        &self,
        ctx: &Arc<ServerRuntimeContext>,
        iq: &Element,
        from: Option<&FullJid>,
    ) -> Result<Option<Element>, XmppError>;
}

/// Namespace → module dispatch map, filled at startup.
#[derive(Default)]
pub struct ModuleRegistry {
    by_namespace: HashMap<&'static str, Arc<dyn Module>>,
}

impl ModuleRegistry {
    /// Empty registry.
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    /// Registry with all shipped modules.
    pub fn with_defaults() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(ping::PingModule));
        registry.register(Arc::new(time::EntityTimeModule));
        registry.register(Arc::new(version::SoftwareVersionModule));
        registry.register(Arc::new(roster_module::RosterModule));
        registry
    }

    /// Register a module for all namespaces it declares.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        for namespace in module.namespaces().iter().copied() {
            self.by_namespace.insert(namespace, Arc::clone(&module));
        }
    }

    /// The module claiming `namespace`, if any.
    pub fn module_for(&self, namespace: &str) -> Option<&Arc<dyn Module>> {
        self.by_namespace.get(namespace)
    }

    /// Number of distinct namespace registrations.
    pub fn len(&self) -> usize {
        self.by_namespace.len()
    }

    /// Whether no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.by_namespace.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    #[test]
    fn defaults_cover_the_shipped_namespaces() {
        let registry = ModuleRegistry::with_defaults();
        assert!(registry.module_for(ns::PING).is_some());
        assert!(registry.module_for(ns::TIME).is_some());
        assert!(registry.module_for(ns::VERSION).is_some());
        assert!(registry.module_for(ns::ROSTER).is_some());
        assert!(registry.module_for("urn:unclaimed").is_none());
    }
}
