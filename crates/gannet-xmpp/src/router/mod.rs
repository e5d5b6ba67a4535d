//! Stanza routing.
//!
//! Given an accepted stanza, decides between local delivery, module
//! dispatch, offline storage and S2S forwarding. The router is invoked
//! sequentially per session (preserving per-sender order) but concurrently
//! across sessions; shared state lives in the [`RoutingTable`].

mod table;

pub use table::{BindError, RouteEntry, RoutingTable};

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{StanzaErrorCondition, StreamErrorCondition, XmppError};
use crate::jid::{BareJid, FullJid, Jid};
use crate::metrics;
use crate::roster::Subscription;
use crate::runtime::ServerRuntimeContext;
use crate::session::{DeliverError, SessionHandle};
use crate::stanza::{
    self, make_error_reply, message_type, presence_priority, presence_type, IqType, IqView,
};
use crate::xml::Element;

/// Route one message or iq stanza from a session (or from a peer server).
///
/// `sender` is the bound JID of the originating local session; its address
/// is stamped as `from`, overriding whatever the client claimed. Stanzas
/// arriving over verified S2S links pass `None` and keep their `from`.
pub async fn route_stanza(
    ctx: &Arc<ServerRuntimeContext>,
    mut stanza: Element,
    sender: Option<&FullJid>,
) -> Result<(), XmppError> {
    if let Some(sender) = sender {
        stanza.set_attr("from", sender.to_string());
    }
    metrics::record_stanza_routed();

    let to = match stanza::to_address(&stanza) {
        Ok(to) => to,
        Err(_) => {
            reply_to_sender(
                ctx,
                sender,
                make_error_reply(&stanza, StanzaErrorCondition::BadRequest, None),
            );
            return Ok(());
        }
    };

    match to {
        Some(to) if !ctx.config().is_local_domain(to.domain()) => {
            forward_remote(ctx, stanza, to.domain(), sender).await
        }
        Some(to) => route_local(ctx, stanza, to, sender).await,
        None => route_to_server(ctx, stanza, sender).await,
    }
}

/// Stanzas without a `to` are handled on the sender's behalf.
async fn route_to_server(
    ctx: &Arc<ServerRuntimeContext>,
    stanza: Element,
    sender: Option<&FullJid>,
) -> Result<(), XmppError> {
    match stanza.name() {
        "iq" => dispatch_server_iq(ctx, stanza, sender).await,
        "message" => {
            // A message with no address goes back to the sender's bare JID.
            match sender {
                Some(sender) => {
                    let to = Jid::from(sender.to_bare());
                    route_local(ctx, stanza, to, Some(sender)).await
                }
                None => Ok(()),
            }
        }
        "presence" => {
            // Broadcast presence is handled before routing; nothing to do.
            Ok(())
        }
        other => {
            debug!(name = other, "Dropping unroutable top-level element");
            Ok(())
        }
    }
}

async fn route_local(
    ctx: &Arc<ServerRuntimeContext>,
    stanza: Element,
    to: Jid,
    sender: Option<&FullJid>,
) -> Result<(), XmppError> {
    match stanza.name() {
        "iq" => route_local_iq(ctx, stanza, to, sender).await,
        "message" => route_local_message(ctx, stanza, to, sender).await,
        "presence" => route_local_presence(ctx, stanza, to).await,
        other => {
            debug!(name = other, "Dropping unroutable top-level element");
            Ok(())
        }
    }
}

async fn route_local_iq(
    ctx: &Arc<ServerRuntimeContext>,
    stanza: Element,
    to: Jid,
    sender: Option<&FullJid>,
) -> Result<(), XmppError> {
    if let Some(resource) = to.resource() {
        // Addressed to a specific resource: deliver or report absence.
        let bare = to.to_bare();
        match bare.with_resource(resource) {
            Ok(full) => match ctx.routing().lookup_full(&full) {
                Some(handle) => {
                    deliver(&full, &handle, stanza);
                    Ok(())
                }
                None => {
                    reply_iq_unavailable(ctx, &stanza, sender);
                    Ok(())
                }
            },
            Err(_) => {
                reply_to_sender(
                    ctx,
                    sender,
                    make_error_reply(&stanza, StanzaErrorCondition::BadRequest, None),
                );
                Ok(())
            }
        }
    } else {
        // Bare or domain addressed: modules intercept before local delivery.
        dispatch_server_iq(ctx, stanza, sender).await
    }
}

/// Feed an iq to the module claiming its payload namespace.
async fn dispatch_server_iq(
    ctx: &Arc<ServerRuntimeContext>,
    stanza: Element,
    sender: Option<&FullJid>,
) -> Result<(), XmppError> {
    let payload_ns = stanza
        .children()
        .find(|child| child.name() != "error")
        .map(|child| child.ns().to_owned());

    if let Some(module) = payload_ns
        .as_deref()
        .and_then(|namespace| ctx.modules().module_for(namespace))
    {
        let module = Arc::clone(module);
        match module.handle_iq(ctx, &stanza, sender).await {
            Ok(Some(reply)) => {
                reply_to_sender(ctx, sender, reply);
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Err(XmppError::Stanza { condition, text }) => {
                reply_to_sender(
                    ctx,
                    sender,
                    make_error_reply(&stanza, condition, text.as_deref()),
                );
                return Ok(());
            }
            Err(err) => {
                // Unexpected module failure: log and tell the sender the
                // service is unavailable (§7 policy).
                error!(module = module.name(), error = %err, "Module failed");
                reply_to_sender(
                    ctx,
                    sender,
                    make_error_reply(&stanza, StanzaErrorCondition::ServiceUnavailable, None),
                );
                return Ok(());
            }
        }
    }

    reply_iq_unavailable(ctx, &stanza, sender);
    Ok(())
}

/// Unknown iq requests get `service-unavailable`; responses are dropped.
fn reply_iq_unavailable(
    ctx: &Arc<ServerRuntimeContext>,
    stanza: &Element,
    sender: Option<&FullJid>,
) {
    let is_request = matches!(
        IqView::parse(stanza).map(|view| view.iq_type),
        Ok(IqType::Get) | Ok(IqType::Set)
    );
    if is_request {
        reply_to_sender(
            ctx,
            sender,
            make_error_reply(stanza, StanzaErrorCondition::ServiceUnavailable, None),
        );
    }
}

async fn route_local_message(
    ctx: &Arc<ServerRuntimeContext>,
    stanza: Element,
    to: Jid,
    sender: Option<&FullJid>,
) -> Result<(), XmppError> {
    let bare = to.to_bare();

    // Full-JID match delivers to that session; a vanished resource falls
    // back to bare-JID semantics.
    if let Some(resource) = to.resource() {
        if let Ok(full) = bare.with_resource(resource) {
            if let Some(handle) = ctx.routing().lookup_full(&full) {
                deliver(&full, &handle, stanza);
                return Ok(());
            }
        }
    }

    match message_type(&stanza) {
        "chat" | "normal" => match ctx.routing().best_for(&bare) {
            Some(entry) => {
                deliver(&entry.full, &entry.handle, stanza);
                Ok(())
            }
            None => {
                debug!(to = %bare, "No available resource, storing offline");
                metrics::record_offline_stored();
                ctx.offline().store(&bare, stanza).await
            }
        },
        "headline" => {
            for entry in ctx.routing().available_for(&bare) {
                deliver(&entry.full, &entry.handle, stanza.clone());
            }
            Ok(())
        }
        "groupchat" => {
            reply_to_sender(
                ctx,
                sender,
                make_error_reply(&stanza, StanzaErrorCondition::ServiceUnavailable, None),
            );
            Ok(())
        }
        // Error messages that cannot be delivered are dropped.
        _ => Ok(()),
    }
}

async fn route_local_presence(
    ctx: &Arc<ServerRuntimeContext>,
    stanza: Element,
    to: Jid,
) -> Result<(), XmppError> {
    let bare = to.to_bare();
    match presence_type(&stanza) {
        Some("subscribe") => {
            let available = ctx.routing().available_for(&bare);
            if available.is_empty() {
                // Materialize the request so it is replayed at next login.
                metrics::record_offline_stored();
                ctx.offline().store(&bare, stanza).await
            } else {
                for entry in available {
                    deliver(&entry.full, &entry.handle, stanza.clone());
                }
                Ok(())
            }
        }
        Some("subscribed") | Some("unsubscribed") => {
            let grant = presence_type(&stanza) == Some("subscribed");
            if let Ok(Some(from)) = stanza::from_address(&stanza) {
                merge_inbound_subscription(ctx, &bare, &from.to_bare(), grant).await?;
            }
            for entry in ctx.routing().available_for(&bare) {
                deliver(&entry.full, &entry.handle, stanza.clone());
            }
            Ok(())
        }
        _ => {
            // Available/unavailable/directed presence: deliver to the
            // addressed resource, or all available ones; silent otherwise.
            if let Some(resource) = to.resource() {
                if let Ok(full) = bare.with_resource(resource) {
                    if let Some(handle) = ctx.routing().lookup_full(&full) {
                        deliver(&full, &handle, stanza);
                    }
                }
                return Ok(());
            }
            for entry in ctx.routing().available_for(&bare) {
                deliver(&entry.full, &entry.handle, stanza.clone());
            }
            Ok(())
        }
    }
}

/// A local user's `subscribed`/`unsubscribed` answer arrived for `user`:
/// their to-side subscription state changes.
async fn merge_inbound_subscription(
    ctx: &Arc<ServerRuntimeContext>,
    user: &BareJid,
    contact: &BareJid,
    grant: bool,
) -> Result<(), XmppError> {
    let current = ctx
        .roster()
        .get_item(user, contact)
        .await?
        .map(|item| item.subscription)
        .unwrap_or_default();
    let next = if grant {
        match current {
            Subscription::From | Subscription::Both => Subscription::Both,
            _ => Subscription::To,
        }
    } else {
        match current {
            Subscription::From | Subscription::Both => Subscription::From,
            _ => Subscription::None,
        }
    };
    ctx.roster()
        .update_subscription(user, contact, next, None)
        .await?;
    Ok(())
}

/// Handle presence sent by a bound local session: broadcast, subscription
/// state changes, and directed presence.
pub async fn handle_outbound_presence(
    ctx: &Arc<ServerRuntimeContext>,
    sender: &FullJid,
    mut presence: Element,
) -> Result<(), XmppError> {
    let ptype = presence_type(&presence).map(str::to_owned);
    let to = stanza::to_address(&presence)?;
    let bare = sender.to_bare();

    match (ptype.as_deref(), to) {
        (None, None) | (Some("unavailable"), None) => {
            let available = ptype.is_none();
            let was_available = ctx
                .routing()
                .entries_for(&bare)
                .iter()
                .any(|entry| entry.full == *sender && entry.available);
            ctx.routing()
                .set_presence(sender, available, presence_priority(&presence));
            presence.set_attr("from", sender.to_string());

            // Broadcast to everyone subscribed to this user's presence.
            for subscriber in ctx.roster().presence_subscribers(&bare).await? {
                let mut copy = presence.clone();
                copy.set_attr("to", subscriber.to_string());
                if ctx.config().is_local_domain(subscriber.domain()) {
                    route_local_presence(ctx, copy, Jid::from(subscriber)).await?;
                } else {
                    forward_remote(ctx, copy, &subscriber.domain().to_owned(), Some(sender))
                        .await?;
                }
            }

            // Mirror to the user's other resources.
            for entry in ctx.routing().available_for(&bare) {
                if entry.full != *sender {
                    let mut copy = presence.clone();
                    copy.set_attr("to", entry.full.to_string());
                    deliver(&entry.full, &entry.handle, copy);
                }
            }

            // Initial presence releases stored offline traffic.
            if available && !was_available {
                let pending = ctx.offline().drain(&bare).await?;
                if !pending.is_empty() {
                    debug!(user = %sender, count = pending.len(), "Draining offline messages");
                    if let Some(handle) = ctx.routing().lookup_full(sender) {
                        for message in pending {
                            deliver(sender, &handle, message);
                        }
                    }
                }
            }
            Ok(())
        }
        (Some(sub), Some(to))
            if matches!(sub, "subscribe" | "subscribed" | "unsubscribe" | "unsubscribed") =>
        {
            let contact = to.to_bare();
            apply_outbound_subscription(ctx, &bare, &contact, sub).await?;
            presence.set_attr("from", bare.to_string());
            presence.set_attr("to", contact.to_string());
            if ctx.config().is_local_domain(contact.domain()) {
                route_local_presence(ctx, presence, Jid::from(contact)).await
            } else {
                forward_remote(ctx, presence, &contact.domain().to_owned(), Some(sender)).await
            }
        }
        (_, Some(to)) => {
            // Directed presence.
            presence.set_attr("from", sender.to_string());
            if ctx.config().is_local_domain(to.domain()) {
                route_local_presence(ctx, presence, to).await
            } else {
                forward_remote(ctx, presence, &to.domain().to_owned(), Some(sender)).await
            }
        }
        _ => Ok(()),
    }
}

/// Update the sender-side roster state for an outbound subscription stanza.
async fn apply_outbound_subscription(
    ctx: &Arc<ServerRuntimeContext>,
    user: &BareJid,
    contact: &BareJid,
    kind: &str,
) -> Result<(), XmppError> {
    let current = ctx
        .roster()
        .get_item(user, contact)
        .await?
        .map(|item| item.subscription)
        .unwrap_or_default();
    let (next, ask) = match kind {
        "subscribe" => (current, Some(crate::roster::AskType::Subscribe)),
        "subscribed" => match current {
            Subscription::To | Subscription::Both => (Subscription::Both, None),
            _ => (Subscription::From, None),
        },
        "unsubscribe" => match current {
            Subscription::Both | Subscription::From => (Subscription::From, None),
            _ => (Subscription::None, None),
        },
        "unsubscribed" => match current {
            Subscription::Both | Subscription::To => (Subscription::To, None),
            _ => (Subscription::None, None),
        },
        _ => return Ok(()),
    };
    ctx.roster()
        .update_subscription(user, contact, next, ask)
        .await?;
    Ok(())
}

/// Hand a stanza to the S2S layer for a remote domain.
async fn forward_remote(
    ctx: &Arc<ServerRuntimeContext>,
    stanza: Element,
    domain: &str,
    sender: Option<&FullJid>,
) -> Result<(), XmppError> {
    if !ctx.config().s2s.enabled {
        debug!(domain = domain, "S2S disabled, refusing remote stanza");
        reply_to_sender(
            ctx,
            sender,
            make_error_reply(&stanza, StanzaErrorCondition::ServiceUnavailable, None),
        );
        return Ok(());
    }
    metrics::record_s2s_forwarded();
    ctx.s2s().enqueue(ctx, domain, stanza)
}

/// Deliver into a session's outbound lane, closing it on overflow.
fn deliver(target: &FullJid, handle: &SessionHandle, stanza: Element) {
    match handle.deliver(stanza) {
        Ok(()) => metrics::record_stanza_delivered(),
        Err(DeliverError::Overflow) => {
            warn!(to = %target, "Outbound queue overflow, closing session");
            handle.close(Some(StreamErrorCondition::PolicyViolation));
        }
        Err(DeliverError::Closed) => {
            debug!(to = %target, "Dropping stanza for closed session");
        }
    }
}

/// Send an error reply back to the originating local session.
fn reply_to_sender(ctx: &Arc<ServerRuntimeContext>, sender: Option<&FullJid>, reply: Element) {
    let Some(sender) = sender else {
        debug!("No local sender for reply, dropping");
        return;
    };
    match ctx.routing().lookup_full(sender) {
        Some(handle) => deliver(sender, &handle, reply),
        None => debug!(sender = %sender, "Sender session gone, dropping reply"),
    }
}
