//! XEP-0202: Entity Time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};

use crate::error::{StanzaErrorCondition, XmppError};
use crate::jid::FullJid;
use crate::modules::Module;
use crate::ns;
use crate::runtime::ServerRuntimeContext;
use crate::stanza::{make_error_reply, make_iq_result, IqType, IqView};
use crate::xml::Element;

/// Answers `<time/>` iq gets with the server clock in UTC.
pub struct EntityTimeModule;

/// Build the `<time/>` payload for the current instant.
pub fn build_time_payload() -> Element {
    Element::builder("time", ns::TIME)
        .append(Element::builder("tzo", ns::TIME).text("+00:00").build())
        .append(
            Element::builder("utc", ns::TIME)
                .text(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
                .build(),
        )
        .build()
}

#[async_trait]
impl Module for EntityTimeModule {
    fn name(&self) -> &'static str {
        "entity-time"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::TIME]
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
                Some(build_time_payload()),
            ))),
            IqType::Set => Ok(Some(make_error_reply(
                iq,
                StanzaErrorCondition::BadRequest,
                None,
            ))),
            _ => Ok(None),
        }
    }
}
