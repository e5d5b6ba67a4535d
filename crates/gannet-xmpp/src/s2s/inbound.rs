//! Inbound S2S connections from remote servers.
//!
//! Two jobs (XEP-0220):
//! - answer `<db:verify>` probes where we are the authoritative server,
//!   by recomputing the key for the claimed stream;
//! - authenticate peers that send `<db:result>`, by opening our own
//!   verify connection back to the claimed originating domain.
//!
//! Stanzas are only routed once the peer's domain is verified; anything
//! with a foreign or unverified `from` is dropped.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info, instrument, warn};

use crate::metrics;
use crate::ns;
use crate::router;
use crate::runtime::ServerRuntimeContext;
use crate::s2s::dialback::{build_db_result_answer, build_db_verify, build_db_verify_answer};
use crate::s2s::dns::SrvResolver;
use crate::s2s::outbound::{OutboundError, S2sOutboundConnection};
use crate::s2s::DIALBACK_TIMEOUT;
use crate::session::BoxTransport;
use crate::stanza;
use crate::xml::{DecodeError, StreamDecoder, StreamEvent, XmlReader};

/// Drive one accepted S2S connection until it closes.
#[instrument(name = "s2s.inbound", skip(ctx, transport))]
pub async fn run_inbound_link(ctx: Arc<ServerRuntimeContext>, transport: BoxTransport) {
    let (read_half, write_half) = tokio::io::split(transport);
    let mut link = InboundLink {
        ctx,
        reader: XmlReader::new(read_half),
        writer: write_half,
        decoder: StreamDecoder::new(),
        stream_id: uuid::Uuid::new_v4().simple().to_string(),
        verified_domain: None,
    };
    if let Err(err) = link.run().await {
        debug!(error = %err, "Inbound S2S link ended");
    }
    if link.verified_domain.is_some() {
        metrics::record_s2s_link_closed();
    }
}

struct InboundLink {
    ctx: Arc<ServerRuntimeContext>,
    reader: XmlReader<ReadHalf<BoxTransport>>,
    writer: WriteHalf<BoxTransport>,
    decoder: StreamDecoder,
    stream_id: String,
    verified_domain: Option<String>,
}

impl InboundLink {
    async fn run(&mut self) -> Result<(), OutboundError> {
        self.expect_stream_open().await?;
        self.send_stream_header().await?;

        loop {
            match self.next_stream_event().await? {
                StreamEvent::Stanza(el) if el.is("result", ns::DIALBACK) && el.attr("type").is_none() => {
                    self.answer_db_result(el).await?;
                }
                StreamEvent::Stanza(el) if el.is("verify", ns::DIALBACK) => {
                    self.answer_db_verify(el).await?;
                }
                StreamEvent::Stanza(el) if stanza::is_stanza(&el) => {
                    self.route_verified(el).await;
                }
                StreamEvent::Stanza(other) => {
                    debug!(name = other.name(), "Ignoring element on inbound S2S link");
                }
                StreamEvent::StreamClose => {
                    let _ = self.writer.write_all(b"</stream:stream>").await;
                    let _ = self.writer.flush().await;
                    return Ok(());
                }
                StreamEvent::StreamOpen(_) => {
                    return Err(OutboundError::StreamNegotiation(
                        "unexpected stream restart".to_owned(),
                    ))
                }
            }
        }
    }

    async fn expect_stream_open(&mut self) -> Result<(), OutboundError> {
        match self.next_stream_event().await? {
            StreamEvent::StreamOpen(header) => {
                debug!(from = ?header.from, "Inbound S2S stream opened");
                Ok(())
            }
            _ => Err(OutboundError::StreamNegotiation(
                "expected stream header".to_owned(),
            )),
        }
    }

    async fn send_stream_header(&mut self) -> Result<(), OutboundError> {
        let header = format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:server' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             xmlns:db='jabber:server:dialback' \
             from='{}' id='{}' version='1.0'>\
             <stream:features/>",
            self.ctx.config().server_domain,
            self.stream_id
        );
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// The peer wants this stream authenticated: dial the authoritative
    /// server for the claimed domain and verify the key it sent us.
    async fn answer_db_result(&mut self, el: crate::xml::Element) -> Result<(), OutboundError> {
        let local_domain = self.ctx.config().server_domain.clone();
        let (Some(originating), Some(receiving)) = (el.attr("from"), el.attr("to")) else {
            warn!("db:result without addresses");
            return Ok(());
        };
        let originating = originating.to_owned();
        let key = el.text();

        let valid = if !receiving.eq_ignore_ascii_case(&local_domain) {
            warn!(to = receiving, "db:result for a domain we do not serve");
            false
        } else {
            match tokio::time::timeout(
                DIALBACK_TIMEOUT,
                verify_with_authoritative(&local_domain, &originating, &self.stream_id, &key),
            )
            .await
            {
                Ok(Ok(valid)) => valid,
                Ok(Err(err)) => {
                    warn!(domain = %originating, error = %err, "Verify connection failed");
                    false
                }
                Err(_) => {
                    warn!(domain = %originating, "Verify connection timed out");
                    false
                }
            }
        };

        let answer = build_db_result_answer(&local_domain, &originating, valid);
        self.write_element(&answer).await?;

        if valid {
            info!(domain = %originating, "Inbound S2S link verified");
            if self.verified_domain.is_none() {
                metrics::record_s2s_link_opened();
            }
            self.verified_domain = Some(originating.to_lowercase());
        }
        Ok(())
    }

    /// We are the authoritative server: recompute the key for the claimed
    /// stream and report whether it matches.
    async fn answer_db_verify(&mut self, el: crate::xml::Element) -> Result<(), OutboundError> {
        let local_domain = self.ctx.config().server_domain.clone();
        let (Some(receiving), Some(stream_id)) = (el.attr("from"), el.attr("id")) else {
            warn!("db:verify without from/id");
            return Ok(());
        };
        let key = el.text();
        let valid = self
            .ctx
            .dialback()
            .verify(&key, receiving, &local_domain, stream_id);
        debug!(receiving = receiving, stream_id = stream_id, valid = valid, "Answered db:verify");
        let answer = build_db_verify_answer(&local_domain, receiving, stream_id, valid);
        self.write_element(&answer).await
    }

    async fn route_verified(&mut self, el: crate::xml::Element) {
        let Some(verified) = self.verified_domain.as_deref() else {
            warn!(name = el.name(), "Dropping stanza on unverified S2S link");
            return;
        };
        let from_ok = el
            .attr("from")
            .and_then(|raw| crate::jid::Jid::new(raw).ok())
            .map(|jid| jid.domain().eq_ignore_ascii_case(verified))
            .unwrap_or(false);
        if !from_ok {
            warn!(from = ?el.attr("from"), "Dropping stanza with foreign from on S2S link");
            return;
        }
        if let Err(err) = router::route_stanza(&self.ctx, el, None).await {
            warn!(error = %err, "Failed to route inbound S2S stanza");
        }
    }

    async fn next_stream_event(&mut self) -> Result<StreamEvent, OutboundError> {
        loop {
            let event = match self.reader.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(OutboundError::ConnectionClosed),
                Err(err) => return Err(OutboundError::Decode(DecodeError::from_read(err))),
            };
            if let Some(stream_event) = self.decoder.process(event)? {
                return Ok(stream_event);
            }
        }
    }

    async fn write_element(&mut self, el: &crate::xml::Element) -> Result<(), OutboundError> {
        let mut buf = String::new();
        el.serialize(&mut buf, ns::SERVER);
        self.writer.write_all(buf.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Open a verify connection to the authoritative server for `originating`
/// and ask whether `key` is valid for `(local, originating, stream_id)`.
async fn verify_with_authoritative(
    local_domain: &str,
    originating: &str,
    stream_id: &str,
    key: &str,
) -> Result<bool, OutboundError> {
    let resolver = SrvResolver::new()?;
    let targets = resolver.resolve_xmpp_server(originating).await?;
    let (tcp, _host) = S2sOutboundConnection::connect_targets(&resolver, targets).await?;

    let transport: BoxTransport = Box::new(tcp);
    let (read_half, write_half) = tokio::io::split(transport);
    let mut reader = XmlReader::new(read_half);
    let mut writer = write_half;
    let mut decoder = StreamDecoder::new();

    let header = format!(
        "<?xml version='1.0'?>\
         <stream:stream xmlns='jabber:server' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         xmlns:db='jabber:server:dialback' \
         to='{originating}' from='{local_domain}' version='1.0'>"
    );
    writer.write_all(header.as_bytes()).await?;
    writer.flush().await?;

    let verify = build_db_verify(local_domain, originating, stream_id, key);
    let mut header_seen = false;
    let mut verify_sent = false;

    loop {
        let event = match reader.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(OutboundError::ConnectionClosed),
            Err(err) => return Err(OutboundError::Decode(DecodeError::from_read(err))),
        };
        let Some(stream_event) = decoder.process(event)? else {
            continue;
        };
        match stream_event {
            StreamEvent::StreamOpen(_) if !header_seen => {
                header_seen = true;
                let mut buf = String::new();
                verify.serialize(&mut buf, ns::SERVER);
                writer.write_all(buf.as_bytes()).await?;
                writer.flush().await?;
                verify_sent = true;
            }
            StreamEvent::Stanza(el)
                if el.is("verify", ns::DIALBACK) && el.attr("id") == Some(stream_id) =>
            {
                let valid = el.attr("type") == Some("valid");
                let _ = writer.write_all(b"</stream:stream>").await;
                let _ = writer.flush().await;
                return Ok(valid);
            }
            StreamEvent::Stanza(other) => {
                debug!(name = other.name(), "Ignoring stanza on verify connection");
            }
            StreamEvent::StreamClose => return Err(OutboundError::ConnectionClosed),
            StreamEvent::StreamOpen(_) => {
                if !verify_sent {
                    return Err(OutboundError::StreamNegotiation(
                        "unexpected stream restart on verify connection".to_owned(),
                    ));
                }
            }
        }
    }
}
