//! Server-to-server federation: dialback authentication and link
//! management.
//!
//! One outbound link exists per remote domain; stanzas queued while the
//! link is still connecting are flushed once dialback succeeds. Inbound
//! links authenticate peers by answering and initiating `db:verify`
//! exchanges (XEP-0220).

pub mod dialback;
pub mod dns;
mod inbound;
mod outbound;

pub use dialback::DialbackKey;
pub use dns::{DnsError, ResolvedTarget, SrvResolver};
pub use inbound::run_inbound_link;
pub use outbound::{OutboundError, OutboundState, S2sOutboundConnection};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::XmppError;
use crate::metrics;
use crate::runtime::ServerRuntimeContext;
use crate::xml::{Element, StreamEvent};

/// End-to-end budget for establishing an outbound link (incl. dialback).
pub const DIALBACK_TIMEOUT: Duration = Duration::from_secs(60);

struct OutboundLink {
    tx: mpsc::UnboundedSender<Element>,
}

/// Registry of outbound links, keyed by remote domain.
#[derive(Default)]
pub struct S2sManager {
    links: DashMap<String, OutboundLink>,
    tls_connector: Option<TlsConnector>,
}

impl S2sManager {
    /// Manager without TLS for outbound links.
    pub fn new() -> S2sManager {
        S2sManager::default()
    }

    /// Manager that upgrades outbound links via STARTTLS when offered.
    pub fn with_tls(tls_connector: TlsConnector) -> S2sManager {
        S2sManager {
            links: DashMap::new(),
            tls_connector: Some(tls_connector),
        }
    }

    /// Queue a stanza for a remote domain, dialing the link if necessary.
    ///
    /// Never blocks: stanzas accumulate while dialback is in flight and
    /// are flushed in order once the link is established.
    pub fn enqueue(
        &self,
        ctx: &Arc<ServerRuntimeContext>,
        domain: &str,
        stanza: Element,
    ) -> Result<(), XmppError> {
        let mut stanza = stanza;
        loop {
            match self.links.entry(domain.to_owned()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    match entry.get().tx.send(stanza) {
                        Ok(()) => return Ok(()),
                        Err(mpsc::error::SendError(returned)) => {
                            // The link task died; replace it.
                            entry.remove();
                            stanza = returned;
                        }
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    vacant.insert(OutboundLink { tx: tx.clone() });
                    debug!(domain = domain, "Spawning outbound S2S link");
                    tokio::spawn(run_outbound_link(Arc::clone(ctx), domain.to_owned(), rx));
                    let _ = tx.send(stanza);
                    return Ok(());
                }
            }
        }
    }

    /// Drop a link entry (called by the link task on shutdown).
    fn drop_link(&self, domain: &str) {
        self.links.remove(domain);
    }

    /// Number of live outbound links.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    fn tls_connector(&self) -> Option<&TlsConnector> {
        self.tls_connector.as_ref()
    }
}

/// Accept inbound S2S connections until the listener fails.
pub async fn serve(ctx: Arc<ServerRuntimeContext>, listener: tokio::net::TcpListener) {
    info!(addr = ?listener.local_addr().ok(), "S2S listener ready");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Inbound S2S connection");
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let transport: crate::session::BoxTransport = Box::new(stream);
                    run_inbound_link(ctx, transport).await;
                });
            }
            Err(err) => {
                warn!(error = %err, "S2S accept failed");
                return;
            }
        }
    }
}

/// Own one outbound link: establish, flush the queue, pump until EOF.
async fn run_outbound_link(
    ctx: Arc<ServerRuntimeContext>,
    domain: String,
    mut rx: mpsc::UnboundedReceiver<Element>,
) {
    let result = establish(&ctx, &domain).await;
    let mut conn = match result {
        Ok(conn) => conn,
        Err(err) => {
            warn!(domain = %domain, error = %err, "Outbound S2S link failed");
            ctx.s2s().drop_link(&domain);
            // Anything queued for this attempt is lost; senders already
            // received their stanza-level acknowledgement semantics.
            rx.close();
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!(domain = %domain, dropped = dropped, "Dropped queued S2S stanzas");
            }
            return;
        }
    };

    metrics::record_s2s_link_opened();
    info!(domain = %domain, "Outbound S2S link ready");

    loop {
        tokio::select! {
            queued = rx.recv() => match queued {
                Some(stanza) => {
                    if let Err(err) = conn.send_stanza(&stanza).await {
                        warn!(domain = %domain, error = %err, "S2S send failed");
                        break;
                    }
                }
                None => break,
            },
            event = conn.read_event() => match event {
                Ok(StreamEvent::StreamClose) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }

    conn.close().await;
    metrics::record_s2s_link_closed();
    ctx.s2s().drop_link(&domain);
}

async fn establish(
    ctx: &Arc<ServerRuntimeContext>,
    domain: &str,
) -> Result<S2sOutboundConnection, OutboundError> {
    let resolver = SrvResolver::new()?;
    let targets = resolver.resolve_xmpp_server(domain).await?;
    tokio::time::timeout(
        DIALBACK_TIMEOUT,
        S2sOutboundConnection::connect(
            &resolver,
            targets,
            domain,
            &ctx.config().server_domain,
            ctx.s2s().tls_connector(),
            ctx.dialback(),
        ),
    )
    .await
    .map_err(|_| OutboundError::DialbackFailed("dialback timed out".to_owned()))?
}
