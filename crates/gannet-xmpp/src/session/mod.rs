//! Per-connection session state and the handle other components hold.
//!
//! A session is owned exclusively by its connection actor (one tokio task).
//! Everything else — the router, modules, other sessions — interacts through
//! a [`SessionHandle`]: stanzas are posted into a bounded queue, teardown is
//! requested over an unbounded control lane, and a cancellation token lets
//! in-flight handlers observe closure.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamErrorCondition;
use crate::jid::FullJid;
use crate::xml::Element;

/// Bound on the per-session outbound stanza queue. Overflow closes the
/// session with `<stream:error><policy-violation/></stream:error>`.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// A duplex byte stream a session can own: TCP before STARTTLS, TLS after.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Type-erased transport, so TLS upgrades swap the concrete stream.
pub type BoxTransport = Box<dyn Transport>;

/// Protocol state of a session (RFC 6120 stream lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, no stream header yet.
    Initiated,
    /// Stream header exchanged, features sent.
    Opened,
    /// `<proceed/>` sent, TLS handshake in progress.
    EncryptionStarted,
    /// TLS active, stream restarted.
    Encrypted,
    /// SASL completed, stream restarted.
    Authenticated,
    /// Resource bound; stanzas flow.
    Bound,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Whether a TLS upgrade may start from this state.
    pub fn may_start_tls(&self) -> bool {
        matches!(self, SessionState::Initiated | SessionState::Opened)
    }
}

/// Mutable state owned by the connection actor.
#[derive(Debug)]
pub struct SessionContext {
    /// Opaque unique id, used in logs and as the stream id.
    pub session_id: String,
    /// Current protocol state.
    pub state: SessionState,
    /// The full JID once resource binding completed.
    pub bound: Option<FullJid>,
    /// Peer-server link rather than a client.
    pub is_server_session: bool,
    /// TLS is active (or implied, for BOSH).
    pub encrypted: bool,
    /// SASL completed.
    pub authenticated: bool,
    /// Consecutive SASL failures on this transport.
    pub sasl_failures: u8,
}

impl SessionContext {
    /// Fresh client session context.
    pub fn new_client() -> SessionContext {
        SessionContext {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            state: SessionState::Initiated,
            bound: None,
            is_server_session: false,
            encrypted: false,
            authenticated: false,
            sasl_failures: 0,
        }
    }

    /// Fresh peer-server session context.
    pub fn new_server() -> SessionContext {
        SessionContext {
            is_server_session: true,
            ..SessionContext::new_client()
        }
    }
}

/// Control messages on the session's always-available lane.
#[derive(Debug)]
pub enum SessionControl {
    /// Close the session, optionally emitting a stream error first.
    Close(Option<StreamErrorCondition>),
}

/// Why a `deliver` call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// The bounded outbound queue is full.
    Overflow,
    /// The session is already gone.
    Closed,
}

/// Cheap, cloneable reference to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: Arc<str>,
    stanza_tx: mpsc::Sender<Element>,
    control_tx: mpsc::UnboundedSender<SessionControl>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Create the handle plus the receiving ends the actor owns.
    pub fn channel(
        session_id: &str,
    ) -> (
        SessionHandle,
        mpsc::Receiver<Element>,
        mpsc::UnboundedReceiver<SessionControl>,
    ) {
        let (stanza_tx, stanza_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            session_id: Arc::from(session_id),
            stanza_tx,
            control_tx,
            cancel: CancellationToken::new(),
        };
        (handle, stanza_rx, control_rx)
    }

    /// The session id this handle points at.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Post a stanza for delivery on this session's outbound lane.
    ///
    /// Stanzas leave the transport in the order of `deliver` calls.
    pub fn deliver(&self, stanza: Element) -> Result<(), DeliverError> {
        if self.cancel.is_cancelled() {
            return Err(DeliverError::Closed);
        }
        self.stanza_tx.try_send(stanza).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliverError::Overflow,
            mpsc::error::TrySendError::Closed(_) => DeliverError::Closed,
        })
    }

    /// Request teardown; the actor drains, emits the stream error if given,
    /// writes `</stream:stream>` and closes the transport.
    pub fn close(&self, reason: Option<StreamErrorCondition>) {
        let _ = self.control_tx.send(SessionControl::Close(reason));
    }

    /// Token cancelled when the session ends; in-flight handlers for this
    /// session observe it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark the session as gone. Called by the owning actor only.
    pub fn mark_closed(&self) {
        self.cancel.cancel();
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
