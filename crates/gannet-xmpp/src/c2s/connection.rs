//! The per-connection actor for client sessions.
//!
//! One task owns the socket for the whole session lifetime. Negotiation is
//! sequential request/response (header → features → STARTTLS → SASL →
//! restart → bind); once bound, the actor selects between inbound socket
//! events, its outbound stanza lane and the control lane, so reads and
//! writes never interleave with another task's.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::error::{SaslFailure, StreamErrorCondition, XmppError};
use crate::jid::BareJid;
use crate::metrics;
use crate::ns;
use crate::router;
use crate::runtime::ServerRuntimeContext;
use crate::sasl::{self, Mechanism, SaslOutcome};
use crate::session::{
    BoxTransport, SessionContext, SessionControl, SessionHandle, SessionState,
};
use crate::stanza;
use crate::xml::{DecodeError, Element, StreamDecoder, StreamEvent, XmlReader};

/// Per-step budget for negotiation reads (stream header, SASL, bind).
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum consecutive SASL failures before the transport is closed.
const MAX_SASL_FAILURES: u8 = 5;

/// Drive one accepted client connection to completion.
#[instrument(name = "c2s.connection", skip(ctx, transport, tls), fields(peer = %peer))]
pub async fn run_client_connection(
    ctx: Arc<ServerRuntimeContext>,
    transport: BoxTransport,
    tls: Option<TlsAcceptor>,
    peer: SocketAddr,
) {
    let (read_half, write_half) = tokio::io::split(transport);
    let session = SessionContext::new_client();
    debug!(session_id = %session.session_id, "Client connected");

    let mut conn = ClientConnection {
        ctx,
        session,
        reader: XmlReader::new(read_half),
        writer: write_half,
        decoder: StreamDecoder::new(),
        tls,
        authenticated_as: None,
        mechanism: None,
    };

    match conn.negotiate().await {
        Ok(Some(bound)) => conn.run_bound(bound).await,
        Ok(None) => {
            debug!("Connection closed during negotiation");
        }
        Err(err) => {
            conn.fail_stream(&err).await;
        }
    }
}

/// Everything established by a successful bind.
struct BoundSession {
    full: crate::jid::FullJid,
    handle: SessionHandle,
    stanza_rx: mpsc::Receiver<Element>,
    control_rx: mpsc::UnboundedReceiver<SessionControl>,
}

struct ClientConnection {
    ctx: Arc<ServerRuntimeContext>,
    session: SessionContext,
    reader: XmlReader<ReadHalf<BoxTransport>>,
    writer: WriteHalf<BoxTransport>,
    decoder: StreamDecoder,
    tls: Option<TlsAcceptor>,
    authenticated_as: Option<BareJid>,
    mechanism: Option<Box<dyn Mechanism>>,
}

impl ClientConnection {
    /// Drive the handshake; `Ok(None)` means the peer went away politely.
    async fn negotiate(&mut self) -> Result<Option<BoundSession>, XmppError> {
        loop {
            let event = match self.next_event_timed().await? {
                Some(event) => event,
                None => return Ok(None),
            };
            match (self.session.state, event) {
                (
                    SessionState::Initiated | SessionState::Encrypted,
                    StreamEvent::StreamOpen(header),
                ) => {
                    if let Some(to) = &header.to {
                        if !self.ctx.config().is_local_domain(to) {
                            return Err(XmppError::Stream(StreamErrorCondition::HostUnknown));
                        }
                    }
                    self.send_stream_header().await?;
                    self.send_negotiation_features().await?;
                    if self.session.state == SessionState::Initiated {
                        self.session.state = SessionState::Opened;
                    }
                }
                (SessionState::Opened, StreamEvent::Stanza(el))
                    if el.is("starttls", ns::TLS) =>
                {
                    self.start_tls().await?;
                }
                (SessionState::Opened | SessionState::Encrypted, StreamEvent::Stanza(el))
                    if el.is("auth", ns::SASL) || el.is("response", ns::SASL) =>
                {
                    if self.ctx.config().tls.required && !self.session.encrypted {
                        return Err(XmppError::Stream(StreamErrorCondition::PolicyViolation));
                    }
                    self.handle_sasl(&el).await?;
                }
                (
                    SessionState::Opened | SessionState::Encrypted,
                    StreamEvent::Stanza(el),
                ) if el.is("abort", ns::SASL) => {
                    self.mechanism = None;
                    self.write_element(&sasl::build_failure(SaslFailure::Aborted))
                        .await?;
                }
                (SessionState::Authenticated, StreamEvent::StreamOpen(_)) => {
                    // Post-SASL stream restart.
                    self.send_stream_header().await?;
                    self.send_bind_features().await?;
                }
                (SessionState::Authenticated, StreamEvent::Stanza(el))
                    if el.name() == "iq" =>
                {
                    if let Some(requested) = stanza::bind_request(&el) {
                        if let Some(bound) = self.bind(&el, requested).await? {
                            return Ok(Some(bound));
                        }
                    } else {
                        self.write_element(&stanza::make_error_reply(
                            &el,
                            crate::error::StanzaErrorCondition::NotAuthorized,
                            None,
                        ))
                        .await?;
                    }
                }
                (_, StreamEvent::StreamClose) => {
                    self.write_raw("</stream:stream>").await?;
                    self.close_transport().await;
                    return Ok(None);
                }
                (state, StreamEvent::Stanza(el)) => {
                    debug!(state = ?state, name = el.name(), "Stanza out of order during negotiation");
                    return Err(XmppError::Stream(StreamErrorCondition::PolicyViolation));
                }
                (state, StreamEvent::StreamOpen(_)) => {
                    debug!(state = ?state, "Unexpected stream header");
                    return Err(XmppError::Stream(StreamErrorCondition::BadFormat));
                }
            }
        }
    }

    /// Answer `<starttls/>`: proceed, handshake, restart the stream.
    async fn start_tls(&mut self) -> Result<(), XmppError> {
        if !self.session.state.may_start_tls() || self.session.encrypted {
            return Err(XmppError::Stream(StreamErrorCondition::PolicyViolation));
        }
        let Some(acceptor) = self.tls.clone() else {
            self.write_raw(&format!("<failure xmlns='{}'/>", ns::TLS))
                .await?;
            return Err(XmppError::Tls("STARTTLS without configured certificate".into()));
        };

        self.write_raw(&format!("<proceed xmlns='{}'/>", ns::TLS))
            .await?;
        self.session.state = SessionState::EncryptionStarted;

        // Recombine the halves for the handshake, then split the encrypted
        // stream and restart the XML layer.
        let reader = std::mem::replace(
            &mut self.reader,
            XmlReader::new(tokio::io::split(placeholder_transport()).0),
        );
        let writer = std::mem::replace(
            &mut self.writer,
            tokio::io::split(placeholder_transport()).1,
        );
        let transport = reader.into_inner().unsplit(writer);

        let tls_stream = acceptor
            .accept(transport)
            .await
            .map_err(|err| XmppError::Tls(err.to_string()))?;
        let transport: BoxTransport = Box::new(tls_stream);
        let (read_half, write_half) = tokio::io::split(transport);
        self.reader = XmlReader::new(read_half);
        self.writer = write_half;
        self.decoder.reset();
        self.session.state = SessionState::Encrypted;
        self.session.encrypted = true;
        info!(session_id = %self.session.session_id, "TLS established");
        Ok(())
    }

    /// One SASL step: `<auth/>` starts a mechanism, `<response/>` feeds it.
    async fn handle_sasl(&mut self, el: &Element) -> Result<(), XmppError> {
        let outcome = if let Some((mechanism_name, payload)) = sasl::parse_auth(el) {
            let offered =
                sasl::offered_mechanisms(self.ctx.config(), self.session.encrypted);
            match offered
                .into_iter()
                .find(|kind| kind.as_str() == mechanism_name)
            {
                Some(kind) => {
                    let mut mechanism = sasl::create_mechanism(
                        kind,
                        Arc::clone(self.ctx.accounts()),
                        self.ctx.config().server_domain.clone(),
                    );
                    let outcome = mechanism.step(&payload).await;
                    self.mechanism = Some(mechanism);
                    outcome
                }
                None => SaslOutcome::Failure(SaslFailure::InvalidMechanism),
            }
        } else if let Some(payload) = sasl::parse_response(el) {
            match self.mechanism.as_mut() {
                Some(mechanism) => mechanism.step(&payload).await,
                None => SaslOutcome::Failure(SaslFailure::MalformedRequest),
            }
        } else {
            SaslOutcome::Failure(SaslFailure::MalformedRequest)
        };

        match outcome {
            SaslOutcome::Challenge(data) => {
                self.write_element(&sasl::build_challenge(&data)).await?;
            }
            SaslOutcome::Success {
                identity,
                additional_data,
            } => {
                self.mechanism = None;
                self.session.authenticated = true;
                self.session.sasl_failures = 0;
                self.authenticated_as = Some(identity.jid.clone());
                self.write_element(&sasl::build_success(additional_data.as_deref()))
                    .await?;
                // Stream restart: fresh parser state, keep buffered bytes.
                self.reader.restart();
                self.decoder.reset();
                self.session.state = SessionState::Authenticated;
                info!(session_id = %self.session.session_id, jid = %identity.jid, "Authenticated");
            }
            SaslOutcome::Failure(failure) => {
                self.mechanism = None;
                self.session.sasl_failures += 1;
                metrics::record_sasl_failure();
                self.write_element(&sasl::build_failure(failure)).await?;
                if self.session.sasl_failures >= MAX_SASL_FAILURES {
                    warn!(session_id = %self.session.session_id, "Too many SASL failures");
                    return Err(XmppError::Stream(StreamErrorCondition::PolicyViolation));
                }
            }
        }
        Ok(())
    }

    /// Bind a resource; `Ok(None)` keeps negotiating (e.g. on conflict).
    async fn bind(
        &mut self,
        iq: &Element,
        requested: Option<String>,
    ) -> Result<Option<BoundSession>, XmppError> {
        let Some(bare) = self.authenticated_as.clone() else {
            return Err(XmppError::Stream(StreamErrorCondition::PolicyViolation));
        };
        let resource =
            requested.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let full = match bare.with_resource(&resource) {
            Ok(full) => full,
            Err(_) => {
                self.write_element(&stanza::make_error_reply(
                    iq,
                    crate::error::StanzaErrorCondition::BadRequest,
                    None,
                ))
                .await?;
                return Ok(None);
            }
        };

        let (handle, stanza_rx, control_rx) =
            SessionHandle::channel(&self.session.session_id);
        match self
            .ctx
            .routing()
            .bind(full.clone(), handle.clone(), self.ctx.next_bind_seq())
        {
            Ok(()) => {
                self.session.bound = Some(full.clone());
                self.session.state = SessionState::Bound;
                self.write_element(&stanza::make_bind_result(iq, &full)).await?;
                info!(session_id = %self.session.session_id, jid = %full, "Resource bound");
                Ok(Some(BoundSession {
                    full,
                    handle,
                    stanza_rx,
                    control_rx,
                }))
            }
            Err(router::BindError::Conflict) => {
                self.write_element(&stanza::make_error_reply(
                    iq,
                    crate::error::StanzaErrorCondition::Conflict,
                    None,
                ))
                .await?;
                Ok(None)
            }
        }
    }

    /// The established-session pump: socket in, outbound lane out.
    async fn run_bound(mut self, mut bound: BoundSession) {
        metrics::record_session_opened();
        let mut close_reason: Option<StreamErrorCondition> = None;
        let full = bound.full.clone();

        // The reader moves out of `self` so the select arms below borrow
        // disjoint state (reader/decoder vs. writer).
        let mut reader = std::mem::replace(
            &mut self.reader,
            XmlReader::new(tokio::io::split(placeholder_transport()).0),
        );
        let mut decoder = std::mem::replace(&mut self.decoder, StreamDecoder::new());

        loop {
            tokio::select! {
                event = Self::read_stream_event(&mut reader, &mut decoder) => {
                    match event {
                        Ok(Some(StreamEvent::Stanza(el))) => {
                            self.handle_inbound_stanza(&full, el).await;
                        }
                        Ok(Some(StreamEvent::StreamClose)) | Ok(None) => break,
                        Ok(Some(StreamEvent::StreamOpen(_))) => {
                            close_reason = Some(StreamErrorCondition::BadFormat);
                            break;
                        }
                        Err(err) => {
                            if !err.is_transport() {
                                close_reason = Some(match err {
                                    DecodeError::RestrictedXml(_) => {
                                        StreamErrorCondition::BadFormat
                                    }
                                    _ => StreamErrorCondition::NotWellFormed,
                                });
                            }
                            break;
                        }
                    }
                }
                outbound = bound.stanza_rx.recv() => match outbound {
                    Some(el) => {
                        if let Err(err) = self.write_element(&el).await {
                            debug!(error = %err, "Write failed, closing session");
                            break;
                        }
                    }
                    None => break,
                },
                control = bound.control_rx.recv() => match control {
                    Some(SessionControl::Close(reason)) => {
                        close_reason = reason;
                        break;
                    }
                    None => break,
                },
            }
        }

        // Teardown: stop accepting deliveries, leave the routing table,
        // announce unavailability, close the stream.
        bound.handle.mark_closed();
        self.ctx.routing().unbind(&bound.full);
        let unavailable = Element::builder("presence", ns::CLIENT)
            .attr("type", "unavailable")
            .build();
        if let Err(err) =
            router::handle_outbound_presence(&self.ctx, &bound.full, unavailable).await
        {
            debug!(error = %err, "Failed to broadcast closing presence");
        }

        if let Some(condition) = close_reason {
            let _ = self.write_stream_error(condition).await;
        }
        let _ = self.write_raw("</stream:stream>").await;
        self.close_transport().await;
        self.session.state = SessionState::Closed;
        metrics::record_session_closed();
        info!(session_id = %self.session.session_id, jid = %bound.full, "Session closed");
    }

    /// Dispatch one stanza received from the bound client.
    async fn handle_inbound_stanza(&mut self, full: &crate::jid::FullJid, el: Element) {
        let result = match el.name() {
            "presence" => {
                router::handle_outbound_presence(&self.ctx, full, el).await
            }
            "iq" if el.has_child("session", ns::SESSION) => {
                // Legacy session establishment is a no-op.
                let reply = stanza::make_iq_result(
                    &el,
                    Some(&self.ctx.config().server_domain),
                    None,
                );
                self.write_element(&reply).await.map_err(XmppError::from)
            }
            "message" | "iq" => {
                router::route_stanza(&self.ctx, el, Some(full)).await
            }
            other => {
                debug!(name = other, "Dropping unknown top-level element");
                Ok(())
            }
        };
        if let Err(err) = result {
            // Stanza handling failures are logged; stream-fatal conditions
            // are surfaced through the control lane by the router.
            warn!(error = %err, "Failed to process inbound stanza");
        }
    }

    async fn read_stream_event(
        reader: &mut XmlReader<ReadHalf<BoxTransport>>,
        decoder: &mut StreamDecoder,
    ) -> Result<Option<StreamEvent>, DecodeError> {
        loop {
            let event = match reader.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(None),
                Err(err) => return Err(DecodeError::from_read(err)),
            };
            if let Some(stream_event) = decoder.process(event)? {
                return Ok(Some(stream_event));
            }
        }
    }

    /// Negotiation read with the per-step deadline.
    async fn next_event_timed(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        match tokio::time::timeout(
            NEGOTIATION_TIMEOUT,
            Self::read_stream_event(&mut self.reader, &mut self.decoder),
        )
        .await
        {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(err)) => match err {
                DecodeError::Io(io_err) => Err(XmppError::Io(io_err)),
                DecodeError::RestrictedXml(_) => {
                    Err(XmppError::Stream(StreamErrorCondition::BadFormat))
                }
                _ => Err(XmppError::Stream(StreamErrorCondition::NotWellFormed)),
            },
            Err(_) => Err(XmppError::Timeout),
        }
    }

    async fn send_stream_header(&mut self) -> Result<(), XmppError> {
        let header = format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             from='{}' id='{}' version='1.0'>",
            self.ctx.config().server_domain,
            self.session.session_id
        );
        self.write_raw(&header).await
    }

    /// Features advertised before authentication, per stream state.
    async fn send_negotiation_features(&mut self) -> Result<(), XmppError> {
        let config = self.ctx.config();
        let mut children: Vec<Element> = Vec::new();

        if !self.session.encrypted && self.tls.is_some() {
            let mut starttls = Element::new("starttls", ns::TLS);
            if config.tls.required {
                starttls.append_child(Element::new("required", ns::TLS));
            }
            children.push(starttls);
        }
        let tls_gate = config.tls.required && !self.session.encrypted;
        if !tls_gate {
            children.push(sasl::build_mechanisms_feature(&sasl::offered_mechanisms(
                config,
                self.session.encrypted,
            )));
        }
        self.write_features(children).await
    }

    /// Features advertised after authentication: bind and session.
    async fn send_bind_features(&mut self) -> Result<(), XmppError> {
        let children = vec![
            Element::new("bind", ns::BIND),
            Element::new("session", ns::SESSION),
        ];
        self.write_features(children).await
    }

    async fn write_features(&mut self, children: Vec<Element>) -> Result<(), XmppError> {
        let mut buf = String::from("<stream:features>");
        for child in children {
            child.serialize(&mut buf, "");
        }
        buf.push_str("</stream:features>");
        self.write_raw(&buf).await
    }

    async fn write_element(&mut self, el: &Element) -> Result<(), XmppError> {
        let mut buf = String::new();
        // A stanza renders in its own namespace context so a tree parsed
        // off a `jabber:server` stream lands in this stream's default
        // namespace instead of dragging its old declaration along.
        let context = if stanza::is_stanza(el) { el.ns() } else { ns::CLIENT };
        el.serialize(&mut buf, context);
        self.write_raw(&buf).await
    }

    async fn write_stream_error(
        &mut self,
        condition: StreamErrorCondition,
    ) -> Result<(), XmppError> {
        let body = format!(
            "<stream:error><{} xmlns='{}'/></stream:error>",
            condition.as_str(),
            ns::STREAMS
        );
        self.write_raw(&body).await
    }

    async fn write_raw(&mut self, data: &str) -> Result<(), XmppError> {
        self.writer.write_all(data.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close_transport(&mut self) {
        let _ = self.writer.shutdown().await;
    }

    /// Terminal failure: emit the matching stream error, then close.
    async fn fail_stream(&mut self, err: &XmppError) {
        let condition = match err {
            XmppError::Stream(condition) => Some(*condition),
            XmppError::Decode(decode) if !decode.is_transport() => {
                Some(StreamErrorCondition::NotWellFormed)
            }
            XmppError::Timeout => Some(StreamErrorCondition::PolicyViolation),
            _ => None,
        };
        debug!(error = %err, "Closing stream after negotiation failure");
        if let Some(condition) = condition {
            let _ = self.write_stream_error(condition).await;
        }
        let _ = self.write_raw("</stream:stream>").await;
        self.close_transport().await;
        self.session.state = SessionState::Closed;
    }
}

/// Placeholder transport for `mem::replace` during the TLS swap.
fn placeholder_transport() -> BoxTransport {
    let (placeholder, _closed) = tokio::io::duplex(1);
    Box::new(placeholder)
}
