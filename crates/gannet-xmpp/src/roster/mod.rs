//! Roster management and presence subscriptions (RFC 6121).
//!
//! Rosters are consumed through the [`RosterStore`] trait so different
//! backends can be used interchangeably; the in-memory implementation backs
//! tests and single-node use.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::XmppError;
use crate::jid::BareJid;
use crate::ns;
use crate::xml::Element;

/// Subscription state of a roster item (RFC 6121 §2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    /// No presence flows either way.
    #[default]
    None,
    /// We see the contact's presence.
    To,
    /// The contact sees our presence.
    From,
    /// Presence flows both ways.
    Both,
    /// Pending removal.
    Remove,
}

impl Subscription {
    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    /// Parse the wire value.
    pub fn from_str(s: &str) -> Option<Subscription> {
        match s {
            "none" => Some(Subscription::None),
            "to" => Some(Subscription::To),
            "from" => Some(Subscription::From),
            "both" => Some(Subscription::Both),
            "remove" => Some(Subscription::Remove),
            _ => None,
        }
    }

    /// Whether the contact is subscribed to our presence.
    pub fn from_side(&self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }

    /// Whether we are subscribed to the contact's presence.
    pub fn to_side(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending subscription request direction (`ask` attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskType {
    /// Outbound subscribe awaiting the contact's answer.
    Subscribe,
}

impl AskType {
    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        "subscribe"
    }
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    /// The contact.
    pub jid: BareJid,
    /// User-assigned handle.
    pub name: Option<String>,
    /// Subscription state.
    pub subscription: Subscription,
    /// Pending outbound request, if any.
    pub ask: Option<AskType>,
    /// Roster groups.
    pub groups: Vec<String>,
}

impl RosterItem {
    /// A fresh entry with no subscription.
    pub fn new(jid: BareJid) -> RosterItem {
        RosterItem {
            jid,
            name: None,
            subscription: Subscription::None,
            ask: None,
            groups: Vec::new(),
        }
    }

    /// Render as a `<item/>` for `jabber:iq:roster` payloads.
    pub fn to_element(&self) -> Element {
        let mut item = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str())
            .attr_opt("name", self.name.clone())
            .attr_opt("ask", self.ask.map(|a| a.as_str()))
            .build();
        for group in &self.groups {
            item.append_child(Element::builder("group", ns::ROSTER).text(group).build());
        }
        item
    }
}

/// Result of a roster mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterSetResult {
    /// A new item was created.
    Added(RosterItem),
    /// An existing item was updated.
    Updated(RosterItem),
    /// The item was removed.
    Removed,
}

/// Roster persistence provider.
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// All roster items of a user.
    async fn get(&self, user: &BareJid) -> Result<Vec<RosterItem>, XmppError>;

    /// One roster item, if present.
    async fn get_item(
        &self,
        user: &BareJid,
        contact: &BareJid,
    ) -> Result<Option<RosterItem>, XmppError>;

    /// Create or update an item.
    async fn set_item(
        &self,
        user: &BareJid,
        item: RosterItem,
    ) -> Result<RosterSetResult, XmppError>;

    /// Remove an item; `Ok(false)` when it did not exist.
    async fn remove_item(&self, user: &BareJid, contact: &BareJid) -> Result<bool, XmppError>;

    /// Update the subscription state of an item, creating it when missing.
    async fn update_subscription(
        &self,
        user: &BareJid,
        contact: &BareJid,
        subscription: Subscription,
        ask: Option<AskType>,
    ) -> Result<RosterItem, XmppError>;

    /// Contacts that receive this user's presence (`from`/`both`).
    async fn presence_subscribers(&self, user: &BareJid) -> Result<Vec<BareJid>, XmppError>;

    /// Contacts whose presence this user receives (`to`/`both`).
    async fn presence_subscriptions(&self, user: &BareJid) -> Result<Vec<BareJid>, XmppError>;
}

/// In-memory roster store.
#[derive(Default)]
pub struct MemoryRosterStore {
    rosters: RwLock<HashMap<BareJid, Vec<RosterItem>>>,
}

impl MemoryRosterStore {
    /// Empty store.
    pub fn new() -> MemoryRosterStore {
        MemoryRosterStore::default()
    }

    fn with_roster<T>(
        &self,
        user: &BareJid,
        f: impl FnOnce(&Vec<RosterItem>) -> T,
    ) -> Result<T, XmppError> {
        let rosters = self
            .rosters
            .read()
            .map_err(|_| XmppError::internal("roster store poisoned"))?;
        let empty = Vec::new();
        Ok(f(rosters.get(user).unwrap_or(&empty)))
    }
}

#[async_trait]
impl RosterStore for MemoryRosterStore {
    async fn get(&self, user: &BareJid) -> Result<Vec<RosterItem>, XmppError> {
        self.with_roster(user, |items| items.clone())
    }

    async fn get_item(
        &self,
        user: &BareJid,
        contact: &BareJid,
    ) -> Result<Option<RosterItem>, XmppError> {
        self.with_roster(user, |items| {
            items.iter().find(|item| &item.jid == contact).cloned()
        })
    }

    async fn set_item(
        &self,
        user: &BareJid,
        item: RosterItem,
    ) -> Result<RosterSetResult, XmppError> {
        let mut rosters = self
            .rosters
            .write()
            .map_err(|_| XmppError::internal("roster store poisoned"))?;
        let roster = rosters.entry(user.clone()).or_default();
        match roster.iter_mut().find(|existing| existing.jid == item.jid) {
            Some(existing) => {
                // Subscription state is server-managed; a roster set only
                // touches name and groups (RFC 6121 §2.3.3).
                existing.name = item.name;
                existing.groups = item.groups;
                Ok(RosterSetResult::Updated(existing.clone()))
            }
            None => {
                roster.push(item.clone());
                Ok(RosterSetResult::Added(item))
            }
        }
    }

    async fn remove_item(&self, user: &BareJid, contact: &BareJid) -> Result<bool, XmppError> {
        let mut rosters = self
            .rosters
            .write()
            .map_err(|_| XmppError::internal("roster store poisoned"))?;
        let roster = rosters.entry(user.clone()).or_default();
        let before = roster.len();
        roster.retain(|item| &item.jid != contact);
        Ok(roster.len() < before)
    }

    async fn update_subscription(
        &self,
        user: &BareJid,
        contact: &BareJid,
        subscription: Subscription,
        ask: Option<AskType>,
    ) -> Result<RosterItem, XmppError> {
        let mut rosters = self
            .rosters
            .write()
            .map_err(|_| XmppError::internal("roster store poisoned"))?;
        let roster = rosters.entry(user.clone()).or_default();
        match roster.iter_mut().find(|item| &item.jid == contact) {
            Some(item) => {
                item.subscription = subscription;
                item.ask = ask;
                Ok(item.clone())
            }
            None => {
                let mut item = RosterItem::new(contact.clone());
                item.subscription = subscription;
                item.ask = ask;
                roster.push(item.clone());
                Ok(item)
            }
        }
    }

    async fn presence_subscribers(&self, user: &BareJid) -> Result<Vec<BareJid>, XmppError> {
        self.with_roster(user, |items| {
            items
                .iter()
                .filter(|item| item.subscription.from_side())
                .map(|item| item.jid.clone())
                .collect()
        })
    }

    async fn presence_subscriptions(&self, user: &BareJid) -> Result<Vec<BareJid>, XmppError> {
        self.with_roster(user, |items| {
            items
                .iter()
                .filter(|item| item.subscription.to_side())
                .map(|item| item.jid.clone())
                .collect()
        })
    }
}
