//! XEP-0199: XMPP Ping.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{StanzaErrorCondition, XmppError};
use crate::jid::FullJid;
use crate::modules::Module;
use crate::ns;
use crate::runtime::ServerRuntimeContext;
use crate::stanza::{make_error_reply, make_iq_result, IqType, IqView};
use crate::xml::Element;

/// Answers `<ping/>` iq gets with an empty result.
pub struct PingModule;

/// Whether an iq is a ping request.
pub fn is_ping(iq: &Element) -> bool {
    iq.attr("type") == Some("get") && iq.has_child("ping", ns::PING)
}

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::PING]
    }

    async fn handle_iq(
        &self,
        ctx: &Arc<ServerRuntimeContext>,
        iq: &Element,
        _from: Option<&FullJid>,
    ) -> Result<Option<Element>, XmppError> {
        let view = IqView::parse(iq)?;
        match view.iq_type {
            IqType::Get => Ok(Some(make_iq_result(
                iq,
                Some(&ctx.config().server_domain),
                None,
            ))),
            IqType::Set => Ok(Some(make_error_reply(
                iq,
                StanzaErrorCondition::BadRequest,
                None,
            ))),
            // Results/errors to a ping we never sent are dropped.
            _ => Ok(None),
        }
    }
}
