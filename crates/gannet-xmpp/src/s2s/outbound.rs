//! Outbound S2S connections to remote servers.
//!
//! # Connection Flow
//!
//! 1. DNS resolution: `_xmpp-server._tcp.{domain}` SRV targets
//! 2. TCP connect to the first reachable target
//! 3. Stream header: `<stream:stream xmlns='jabber:server' ...>`
//! 4. STARTTLS upgrade when the peer offers it
//! 5. Re-sent stream header post-TLS
//! 6. Dialback: `<db:result>` with the keyed digest, wait for `valid`
//! 7. Established; stanzas for the remote domain flow

use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, warn};

use crate::ns;
use crate::s2s::dialback::{build_db_result, DialbackKey};
use crate::s2s::dns::{DnsError, ResolvedTarget, SrvResolver};
use crate::session::BoxTransport;
use crate::xml::{DecodeError, Element, StreamDecoder, StreamEvent, XmlReader};

/// Errors that can occur during outbound S2S connection setup.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// DNS resolution failed.
    #[error("DNS resolution failed: {0}")]
    Dns(#[from] DnsError),

    /// TCP connection failed.
    #[error("TCP connection failed: {0}")]
    TcpConnect(#[source] std::io::Error),

    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Stream negotiation failed.
    #[error("stream negotiation failed: {0}")]
    StreamNegotiation(String),

    /// The peer rejected our dialback key.
    #[error("dialback failed: {0}")]
    DialbackFailed(String),

    /// Connection closed before negotiation finished.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// Decoding the peer's stream failed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// State of an outbound link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// TCP established, stream not yet negotiated.
    Connected,
    /// Dialback result sent, waiting for the verdict.
    DialbackPending,
    /// Authenticated; stanzas may flow.
    Established,
    /// Torn down.
    Closed,
}

/// An authenticated outbound connection to one remote domain.
pub struct S2sOutboundConnection {
    remote_domain: String,
    local_domain: String,
    state: OutboundState,
    reader: XmlReader<ReadHalf<BoxTransport>>,
    writer: WriteHalf<BoxTransport>,
    decoder: StreamDecoder,
    dialback: DialbackKey,
    stream_id: Option<String>,
}

impl S2sOutboundConnection {
    /// Connect and authenticate to `remote_domain` via the given targets.
    #[instrument(
        name = "s2s.outbound.connect",
        skip(resolver, targets, tls_connector, dialback),
        fields(remote_domain = %remote_domain, local_domain = %local_domain)
    )]
    pub async fn connect(
        resolver: &SrvResolver,
        targets: Vec<ResolvedTarget>,
        remote_domain: &str,
        local_domain: &str,
        tls_connector: Option<&TlsConnector>,
        dialback: &DialbackKey,
    ) -> Result<S2sOutboundConnection, OutboundError> {
        let (tcp, target_host) = Self::connect_targets(resolver, targets).await?;

        let transport: BoxTransport = Box::new(tcp);
        let (read_half, write_half) = tokio::io::split(transport);
        let mut conn = S2sOutboundConnection {
            remote_domain: remote_domain.to_owned(),
            local_domain: local_domain.to_owned(),
            state: OutboundState::Connected,
            reader: XmlReader::new(read_half),
            writer: write_half,
            decoder: StreamDecoder::new(),
            dialback: dialback.clone(),
            stream_id: None,
        };

        conn.send_stream_header().await?;
        conn.read_stream_open().await?;
        let features = conn.read_features().await?;

        let starttls_offered = features.has_child("starttls", ns::TLS);
        if starttls_offered {
            if let Some(connector) = tls_connector {
                conn.upgrade_to_tls(connector, &target_host).await?;
                conn.send_stream_header().await?;
                conn.read_stream_open().await?;
                conn.read_features().await?;
            } else {
                debug!("Peer offers STARTTLS but no connector configured, continuing in clear");
            }
        }

        conn.perform_dialback().await?;
        conn.state = OutboundState::Established;
        info!(
            remote_domain = %conn.remote_domain,
            stream_id = ?conn.stream_id,
            "S2S outbound link established"
        );
        Ok(conn)
    }

    /// Try each resolved target in order; first TCP success wins.
    pub(crate) async fn connect_targets(
        resolver: &SrvResolver,
        targets: Vec<ResolvedTarget>,
    ) -> Result<(TcpStream, String), OutboundError> {
        let mut last_error = None;
        for target in targets {
            let addrs: Vec<SocketAddr> = match resolver
                .resolve_host_to_addrs(&target.host, target.port)
                .await
            {
                Ok(addrs) => addrs,
                Err(err) => {
                    warn!(host = %target.host, error = %err, "Target resolution failed");
                    last_error = Some(OutboundError::Dns(err));
                    continue;
                }
            };
            for addr in addrs {
                debug!(addr = %addr, "Attempting S2S TCP connection");
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok((stream, target.host)),
                    Err(err) => {
                        warn!(addr = %addr, error = %err, "TCP connection failed");
                        last_error = Some(OutboundError::TcpConnect(err));
                    }
                }
            }
        }
        Err(last_error.unwrap_or(OutboundError::ConnectionClosed))
    }

    async fn send_stream_header(&mut self) -> Result<(), OutboundError> {
        let header = format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:server' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             xmlns:db='jabber:server:dialback' \
             to='{}' from='{}' version='1.0'>",
            self.remote_domain, self.local_domain
        );
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.flush().await?;
        debug!(to = %self.remote_domain, "Sent S2S stream header");
        Ok(())
    }

    /// Read events until the peer's stream header completes.
    async fn read_stream_open(&mut self) -> Result<(), OutboundError> {
        loop {
            match self.next_stream_event().await? {
                StreamEvent::StreamOpen(header) => {
                    self.stream_id = header.id;
                    debug!(
                        from = ?header.from,
                        id = ?self.stream_id,
                        "Received S2S stream header"
                    );
                    return Ok(());
                }
                StreamEvent::StreamClose => return Err(OutboundError::ConnectionClosed),
                StreamEvent::Stanza(_) => {
                    return Err(OutboundError::StreamNegotiation(
                        "stanza before stream header".to_owned(),
                    ))
                }
            }
        }
    }

    async fn read_features(&mut self) -> Result<Element, OutboundError> {
        loop {
            match self.next_stream_event().await? {
                StreamEvent::Stanza(el) if el.is("features", ns::STREAM) => return Ok(el),
                StreamEvent::Stanza(other) => {
                    debug!(name = other.name(), "Ignoring pre-feature stanza");
                }
                StreamEvent::StreamClose => return Err(OutboundError::ConnectionClosed),
                StreamEvent::StreamOpen(_) => {
                    return Err(OutboundError::StreamNegotiation(
                        "unexpected second stream header".to_owned(),
                    ))
                }
            }
        }
    }

    async fn upgrade_to_tls(
        &mut self,
        connector: &TlsConnector,
        server_name: &str,
    ) -> Result<(), OutboundError> {
        self.writer
            .write_all(format!("<starttls xmlns='{}'/>", ns::TLS).as_bytes())
            .await?;
        self.writer.flush().await?;
        debug!("Sent STARTTLS request");

        loop {
            match self.next_stream_event().await? {
                StreamEvent::Stanza(el) if el.is("proceed", ns::TLS) => break,
                StreamEvent::Stanza(el) if el.is("failure", ns::TLS) => {
                    return Err(OutboundError::TlsHandshake(
                        "peer rejected STARTTLS".to_owned(),
                    ))
                }
                StreamEvent::Stanza(other) => {
                    return Err(OutboundError::TlsHandshake(format!(
                        "unexpected response to STARTTLS: {}",
                        other.name()
                    )))
                }
                _ => return Err(OutboundError::ConnectionClosed),
            }
        }

        // Recombine the halves, run the handshake, split again with a
        // fresh parser for the restarted stream.
        let reader = std::mem::replace(
            &mut self.reader,
            XmlReader::new(tokio::io::split(noop_transport()).0),
        );
        let writer = std::mem::replace(&mut self.writer, tokio::io::split(noop_transport()).1);
        let transport = reader.into_inner().unsplit(writer);

        let server_name = rustls::pki_types::ServerName::try_from(server_name.to_owned())
            .map_err(|err| OutboundError::TlsHandshake(format!("invalid server name: {err}")))?;
        let tls_stream = connector
            .connect(server_name, transport)
            .await
            .map_err(|err| OutboundError::TlsHandshake(err.to_string()))?;

        let transport: BoxTransport = Box::new(tls_stream);
        let (read_half, write_half) = tokio::io::split(transport);
        self.reader = XmlReader::new(read_half);
        self.writer = write_half;
        self.decoder.reset();
        info!("S2S TLS upgrade complete");
        Ok(())
    }

    /// Send our dialback key and wait for the verdict (XEP-0220).
    async fn perform_dialback(&mut self) -> Result<(), OutboundError> {
        let stream_id = self
            .stream_id
            .clone()
            .ok_or_else(|| OutboundError::DialbackFailed("no stream id".to_owned()))?;
        // We are the originating server; the peer is receiving.
        let dialback_key =
            self.dialback
                .generate(&self.remote_domain, &self.local_domain, &stream_id);
        let result = build_db_result(&self.local_domain, &self.remote_domain, &dialback_key);
        self.write_element(&result).await?;
        self.state = OutboundState::DialbackPending;
        debug!(to = %self.remote_domain, "Sent dialback result");

        loop {
            match self.next_stream_event().await? {
                StreamEvent::Stanza(el) if el.is("result", ns::DIALBACK) => {
                    if el.attr("from") != Some(self.remote_domain.as_str())
                        || el.attr("to") != Some(self.local_domain.as_str())
                    {
                        warn!(
                            from = ?el.attr("from"),
                            to = ?el.attr("to"),
                            "Dialback result domain mismatch"
                        );
                        continue;
                    }
                    return match el.attr("type") {
                        Some("valid") => {
                            info!("Dialback authentication successful");
                            Ok(())
                        }
                        Some("invalid") => Err(OutboundError::DialbackFailed(
                            "peer rejected the dialback key".to_owned(),
                        )),
                        other => Err(OutboundError::DialbackFailed(format!(
                            "unexpected dialback result type: {:?}",
                            other
                        ))),
                    };
                }
                StreamEvent::Stanza(el) if el.is("error", ns::STREAM) => {
                    return Err(OutboundError::StreamNegotiation(format!(
                        "stream error during dialback: {}",
                        el.to_xml()
                    )))
                }
                StreamEvent::Stanza(other) => {
                    debug!(name = other.name(), "Ignoring stanza during dialback");
                }
                StreamEvent::StreamClose => return Err(OutboundError::ConnectionClosed),
                StreamEvent::StreamOpen(_) => {
                    return Err(OutboundError::StreamNegotiation(
                        "unexpected stream restart".to_owned(),
                    ))
                }
            }
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

    async fn write_element(&mut self, el: &Element) -> Result<(), OutboundError> {
        let mut buf = String::new();
        el.serialize(&mut buf, ns::SERVER);
        self.writer.write_all(buf.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// The remote domain this link is authenticated for.
    pub fn remote_domain(&self) -> &str {
        &self.remote_domain
    }

    /// Current link state.
    pub fn state(&self) -> OutboundState {
        self.state
    }

    /// Whether stanzas may be sent.
    pub fn is_established(&self) -> bool {
        self.state == OutboundState::Established
    }

    /// Send one stanza over the established link.
    pub async fn send_stanza(&mut self, stanza: &Element) -> Result<(), OutboundError> {
        if !self.is_established() {
            return Err(OutboundError::ConnectionClosed);
        }
        // Stanzas render in their own namespace context: a tree parsed off
        // a `jabber:client` stream re-scopes into this stream's default
        // namespace rather than carrying its old declaration across.
        let mut buf = String::new();
        let context = if crate::stanza::is_stanza(stanza) {
            stanza.ns()
        } else {
            ns::SERVER
        };
        stanza.serialize(&mut buf, context);
        self.writer.write_all(buf.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Wait for inbound events, mostly to notice the link dying.
    pub async fn read_event(&mut self) -> Result<StreamEvent, OutboundError> {
        self.next_stream_event().await
    }

    /// Close the stream politely.
    pub async fn close(&mut self) {
        if self.state == OutboundState::Closed {
            return;
        }
        if let Err(err) = self.writer.write_all(b"</stream:stream>").await {
            warn!(error = %err, "Error sending stream end");
        }
        let _ = self.writer.flush().await;
        self.state = OutboundState::Closed;
        debug!(remote_domain = %self.remote_domain, "S2S outbound link closed");
    }
}

/// Placeholder transport for `mem::replace` during the TLS swap.
fn noop_transport() -> BoxTransport {
    let (placeholder, _closed) = tokio::io::duplex(1);
    Box::new(placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_state_transitions_are_distinct() {
        assert_ne!(OutboundState::Connected, OutboundState::Established);
        assert_ne!(OutboundState::DialbackPending, OutboundState::Closed);
    }

    #[test]
    fn error_display() {
        let err = OutboundError::ConnectionClosed;
        assert_eq!(err.to_string(), "connection closed unexpectedly");
        let err = OutboundError::DialbackFailed("nope".to_owned());
        assert!(err.to_string().contains("nope"));
    }
}
