//! XEP-0092: Software Version.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{StanzaErrorCondition, XmppError};
use crate::jid::FullJid;
use crate::modules::Module;
use crate::ns;
use crate::runtime::ServerRuntimeContext;
use crate::stanza::{make_error_reply, make_iq_result, IqType, IqView};
use crate::xml::Element;

/// Answers `jabber:iq:version` queries.
pub struct SoftwareVersionModule;

/// Build the version query payload.
pub fn build_version_payload() -> Element {
    Element::builder("query", ns::VERSION)
        .append(Element::builder("name", ns::VERSION).text("gannet").build())
        .append(
            Element::builder("version", ns::VERSION)
                .text(env!("CARGO_PKG_VERSION"))
                .build(),
        )
        .append(
            Element::builder("os", ns::VERSION)
                .text(std::env::consts::OS)
                .build(),
        )
        .build()
}

#[async_trait]
impl Module for SoftwareVersionModule {
    fn name(&self) -> &'static str {
        "software-version"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::VERSION]
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
                Some(build_version_payload()),
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
