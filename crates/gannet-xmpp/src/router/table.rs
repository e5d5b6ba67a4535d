//! Process-wide routing table: bare JID → bound sessions.
//!
//! Reads vastly outnumber writes (every stanza consults the table, writes
//! happen on bind/unbind), so entries live in a sharded concurrent map.
//! A bare JID maps to all resources bound for that user; full-JID lookups
//! resolve within the bare entry.

use dashmap::DashMap;

use crate::jid::{BareJid, FullJid};
use crate::session::SessionHandle;

/// One bound resource.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// The bound full JID.
    pub full: FullJid,
    /// Handle to the owning session.
    pub handle: SessionHandle,
    /// Priority from the last presence broadcast.
    pub priority: i8,
    /// Whether the resource announced available presence.
    pub available: bool,
    /// Monotonic bind order, used as the recency tie-break.
    pub bind_seq: u64,
}

/// Error binding a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    /// The full JID is already bound by another session.
    Conflict,
}

/// The routing table.
#[derive(Default)]
pub struct RoutingTable {
    by_bare: DashMap<BareJid, Vec<RouteEntry>>,
}

impl RoutingTable {
    /// Empty table.
    pub fn new() -> RoutingTable {
        RoutingTable::default()
    }

    /// Register a bound session.
    ///
    /// Fails when the full JID is taken; no two concurrently bound sessions
    /// may share one.
    pub fn bind(
        &self,
        full: FullJid,
        handle: SessionHandle,
        bind_seq: u64,
    ) -> Result<(), BindError> {
        let mut entry = self.by_bare.entry(full.to_bare()).or_default();
        if entry
            .iter()
            .any(|existing| existing.full.resource() == full.resource())
        {
            return Err(BindError::Conflict);
        }
        entry.push(RouteEntry {
            full,
            handle,
            priority: 0,
            available: false,
            bind_seq,
        });
        Ok(())
    }

    /// Remove a bound session; empty bare entries are dropped.
    pub fn unbind(&self, full: &FullJid) {
        let bare = full.to_bare();
        let mut remove_bare = false;
        if let Some(mut entry) = self.by_bare.get_mut(&bare) {
            entry.retain(|existing| existing.full.resource() != full.resource());
            remove_bare = entry.is_empty();
        }
        if remove_bare {
            self.by_bare
                .remove_if(&bare, |_, entries| entries.is_empty());
        }
    }

    /// The session bound to a full JID, available or not.
    pub fn lookup_full(&self, full: &FullJid) -> Option<SessionHandle> {
        self.by_bare.get(&full.to_bare()).and_then(|entries| {
            entries
                .iter()
                .find(|entry| entry.full.resource() == full.resource())
                .map(|entry| entry.handle.clone())
        })
    }

    /// Snapshot of all resources bound for a bare JID.
    pub fn entries_for(&self, bare: &BareJid) -> Vec<RouteEntry> {
        self.by_bare
            .get(bare)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the available resources for a bare JID.
    pub fn available_for(&self, bare: &BareJid) -> Vec<RouteEntry> {
        self.entries_for(bare)
            .into_iter()
            .filter(|entry| entry.available)
            .collect()
    }

    /// The delivery target for a bare-addressed chat message: highest
    /// priority among available resources, most recently bound on ties.
    pub fn best_for(&self, bare: &BareJid) -> Option<RouteEntry> {
        self.available_for(bare)
            .into_iter()
            .max_by_key(|entry| (entry.priority, entry.bind_seq))
    }

    /// Record the availability and priority a resource announced.
    pub fn set_presence(&self, full: &FullJid, available: bool, priority: i8) {
        if let Some(mut entries) = self.by_bare.get_mut(&full.to_bare()) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|entry| entry.full.resource() == full.resource())
            {
                entry.available = available;
                entry.priority = priority;
            }
        }
    }

    /// Total number of bound sessions.
    pub fn session_count(&self) -> usize {
        self.by_bare.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(s: &str) -> FullJid {
        FullJid::new(s).unwrap()
    }

    fn bare(s: &str) -> BareJid {
        BareJid::new(s).unwrap()
    }

    fn handle(id: &str) -> SessionHandle {
        let (handle, _rx, _ctrl) = SessionHandle::channel(id);
        handle
    }

    #[test]
    fn bind_and_lookup() {
        let table = RoutingTable::new();
        table
            .bind(full("user1@vysper.org/tablet"), handle("s1"), 1)
            .unwrap();

        assert!(table.lookup_full(&full("user1@vysper.org/tablet")).is_some());
        assert!(table.lookup_full(&full("user1@vysper.org/phone")).is_none());
        assert_eq!(table.entries_for(&bare("user1@vysper.org")).len(), 1);
        assert_eq!(table.session_count(), 1);
    }

    #[test]
    fn duplicate_full_jid_conflicts() {
        let table = RoutingTable::new();
        table
            .bind(full("user1@vysper.org/tablet"), handle("s1"), 1)
            .unwrap();
        assert_eq!(
            table.bind(full("user1@vysper.org/tablet"), handle("s2"), 2),
            Err(BindError::Conflict)
        );
        // A different resource for the same user is fine.
        table
            .bind(full("user1@vysper.org/phone"), handle("s3"), 3)
            .unwrap();
        assert_eq!(table.session_count(), 2);
    }

    #[test]
    fn unbind_clears_entries() {
        let table = RoutingTable::new();
        table
            .bind(full("user1@vysper.org/tablet"), handle("s1"), 1)
            .unwrap();
        table.unbind(&full("user1@vysper.org/tablet"));
        assert!(table.lookup_full(&full("user1@vysper.org/tablet")).is_none());
        assert_eq!(table.session_count(), 0);
    }

    #[test]
    fn best_for_prefers_priority_then_recency() {
        let table = RoutingTable::new();
        table
            .bind(full("user1@vysper.org/tablet"), handle("s1"), 1)
            .unwrap();
        table
            .bind(full("user1@vysper.org/phone"), handle("s2"), 2)
            .unwrap();
        table
            .bind(full("user1@vysper.org/desk"), handle("s3"), 3)
            .unwrap();

        // Nothing available yet.
        assert!(table.best_for(&bare("user1@vysper.org")).is_none());

        table.set_presence(&full("user1@vysper.org/tablet"), true, 5);
        table.set_presence(&full("user1@vysper.org/phone"), true, 10);
        table.set_presence(&full("user1@vysper.org/desk"), true, 10);

        // Highest priority wins; on the tie the most recent bind does.
        let best = table.best_for(&bare("user1@vysper.org")).unwrap();
        assert_eq!(best.full.resource(), "desk");

        table.set_presence(&full("user1@vysper.org/desk"), false, 10);
        let best = table.best_for(&bare("user1@vysper.org")).unwrap();
        assert_eq!(best.full.resource(), "phone");
    }
}
