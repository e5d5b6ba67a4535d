//! Roster get/set handling (RFC 6121 §2) with pushes to bound resources.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{StanzaErrorCondition, XmppError};
use crate::jid::{BareJid, FullJid};
use crate::modules::Module;
use crate::ns;
use crate::roster::{RosterItem, Subscription};
use crate::runtime::ServerRuntimeContext;
use crate::stanza::{make_error_reply, make_iq_result, IqType, IqView};
use crate::xml::Element;

/// Handles `jabber:iq:roster` queries from bound sessions.
pub struct RosterModule;

#[async_trait]
impl Module for RosterModule {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::ROSTER]
    }

    async fn handle_iq(
        &self,
        ctx: &Arc<ServerRuntimeContext>,
        iq: &Element,
        from: Option<&FullJid>,
    ) -> Result<Option<Element>, XmppError> {
        let view = IqView::parse(iq)?;
        let Some(user) = from else {
            // Rosters are only addressable by their owner's session.
            return Ok(Some(make_error_reply(
                iq,
                StanzaErrorCondition::Forbidden,
                None,
            )));
        };
        let bare = user.to_bare();

        match view.iq_type {
            IqType::Get => {
                let items = ctx.roster().get(&bare).await?;
                let mut query = Element::new("query", ns::ROSTER);
                for item in &items {
                    query.append_child(item.to_element());
                }
                debug!(user = %bare, items = items.len(), "Roster get");
                Ok(Some(make_iq_result(
                    iq,
                    Some(&ctx.config().server_domain),
                    Some(query),
                )))
            }
            IqType::Set => {
                let Some(payload) = view.payload else {
                    return Ok(Some(make_error_reply(
                        iq,
                        StanzaErrorCondition::BadRequest,
                        None,
                    )));
                };
                let items: Vec<&Element> = payload.children().collect();
                // A roster set contains exactly one item (RFC 6121 §2.3.3).
                let [item_el] = items.as_slice() else {
                    return Ok(Some(make_error_reply(
                        iq,
                        StanzaErrorCondition::BadRequest,
                        None,
                    )));
                };
                let Some(contact) = item_el.attr("jid").and_then(|raw| BareJid::new(raw).ok())
                else {
                    return Ok(Some(make_error_reply(
                        iq,
                        StanzaErrorCondition::BadRequest,
                        None,
                    )));
                };

                if item_el.attr("subscription") == Some(Subscription::Remove.as_str()) {
                    let existed = ctx.roster().remove_item(&bare, &contact).await?;
                    if !existed {
                        return Ok(Some(make_error_reply(
                            iq,
                            StanzaErrorCondition::ItemNotFound,
                            None,
                        )));
                    }
                    let mut removed = RosterItem::new(contact);
                    removed.subscription = Subscription::Remove;
                    push_to_resources(ctx, &bare, &removed);
                    return Ok(Some(make_iq_result(
                        iq,
                        Some(&ctx.config().server_domain),
                        None,
                    )));
                }

                let mut item = RosterItem::new(contact);
                item.name = item_el.attr("name").map(str::to_owned);
                item.groups = item_el
                    .children()
                    .filter(|c| c.name() == "group")
                    .map(|c| c.text())
                    .collect();

                let result = ctx.roster().set_item(&bare, item).await?;
                let stored = match &result {
                    crate::roster::RosterSetResult::Added(item)
                    | crate::roster::RosterSetResult::Updated(item) => item.clone(),
                    crate::roster::RosterSetResult::Removed => unreachable!("set never removes"),
                };
                push_to_resources(ctx, &bare, &stored);
                Ok(Some(make_iq_result(
                    iq,
                    Some(&ctx.config().server_domain),
                    None,
                )))
            }
            _ => Ok(None),
        }
    }
}

/// Push a roster change to every bound resource of `user`.
pub fn push_to_resources(ctx: &Arc<ServerRuntimeContext>, user: &BareJid, item: &RosterItem) {
    for entry in ctx.routing().entries_for(user) {
        let push = Element::builder("iq", ns::CLIENT)
            .attr("type", "set")
            .attr("id", uuid::Uuid::new_v4().simple().to_string())
            .attr("to", entry.full.to_string())
            .append(
                Element::builder("query", ns::ROSTER)
                    .append(item.to_element())
                    .build(),
            )
            .build();
        if let Err(err) = entry.handle.deliver(push) {
            warn!(to = %entry.full, error = ?err, "Failed to deliver roster push");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::test_runtime;

    fn roster_get(from: &str) -> Element {
        Element::builder("iq", ns::CLIENT)
            .attr("type", "get")
            .attr("id", "r1")
            .attr("from", from)
            .append(Element::new("query", ns::ROSTER))
            .build()
    }

    fn roster_set(from: &str, contact: &str) -> Element {
        Element::builder("iq", ns::CLIENT)
            .attr("type", "set")
            .attr("id", "r2")
            .attr("from", from)
            .append(
                Element::builder("query", ns::ROSTER)
                    .append(
                        Element::builder("item", ns::ROSTER)
                            .attr("jid", contact)
                            .attr("name", "Deux")
                            .build(),
                    )
                    .build(),
            )
            .build()
    }

    #[tokio::test]
    async fn get_without_session_is_forbidden() {
        let ctx = test_runtime("vysper.org");
        let reply = RosterModule
            .handle_iq(&ctx, &roster_get("user1@vysper.org/tablet"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.attr("type"), Some("error"));
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let ctx = test_runtime("vysper.org");
        let user = FullJid::new("user1@vysper.org/tablet").unwrap();

        let reply = RosterModule
            .handle_iq(
                &ctx,
                &roster_set("user1@vysper.org/tablet", "user2@vysper.org"),
                Some(&user),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.attr("type"), Some("result"));

        let reply = RosterModule
            .handle_iq(&ctx, &roster_get("user1@vysper.org/tablet"), Some(&user))
            .await
            .unwrap()
            .unwrap();
        let query = reply.get_child("query", ns::ROSTER).unwrap();
        let item = query.get_child("item", ns::ROSTER).unwrap();
        assert_eq!(item.attr("jid"), Some("user2@vysper.org"));
        assert_eq!(item.attr("name"), Some("Deux"));
    }

    #[tokio::test]
    async fn removing_missing_item_is_item_not_found() {
        let ctx = test_runtime("vysper.org");
        let user = FullJid::new("user1@vysper.org/tablet").unwrap();
        let iq = Element::builder("iq", ns::CLIENT)
            .attr("type", "set")
            .attr("id", "r3")
            .attr("from", "user1@vysper.org/tablet")
            .append(
                Element::builder("query", ns::ROSTER)
                    .append(
                        Element::builder("item", ns::ROSTER)
                            .attr("jid", "ghost@vysper.org")
                            .attr("subscription", "remove")
                            .build(),
                    )
                    .build(),
            )
            .build();
        let reply = RosterModule
            .handle_iq(&ctx, &iq, Some(&user))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.attr("type"), Some("error"));
        let error = reply.get_child("error", ns::CLIENT).unwrap();
        assert!(error.has_child("item-not-found", ns::STANZAS));
    }
}
