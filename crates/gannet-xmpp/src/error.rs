//! Error taxonomy for the server core.
//!
//! Three layers, matching how failures propagate on the wire:
//! - [`StreamErrorCondition`]: terminal for the stream, sent as
//!   `<stream:error>` and followed by stream teardown.
//! - [`StanzaErrorCondition`]: recoverable, replied to the sender as a
//!   stanza of the same kind with `type='error'`.
//! - [`SaslFailure`]: mechanism failures inside the SASL exchange.
//!
//! Everything else (I/O, TLS handshake, internal surprises) is collected in
//! [`XmppError`] and mapped by the session loop.

use thiserror::Error;

use crate::jid::JidParseError;
use crate::xml::DecodeError;

/// Terminal stream-level error conditions (RFC 6120 §4.9.3 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// Entity sent XML that cannot be processed.
    BadFormat,
    /// The `to` address does not match a hosted domain.
    HostUnknown,
    /// The stream namespace is not `jabber:client`/`jabber:server`.
    InvalidNamespace,
    /// Entity sent XML that is not well-formed.
    NotWellFormed,
    /// Entity violated a local service policy.
    PolicyViolation,
    /// Server is shutting down.
    SystemShutdown,
}

impl StreamErrorCondition {
    /// The defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorCondition::BadFormat => "bad-format",
            StreamErrorCondition::HostUnknown => "host-unknown",
            StreamErrorCondition::InvalidNamespace => "invalid-namespace",
            StreamErrorCondition::NotWellFormed => "not-well-formed",
            StreamErrorCondition::PolicyViolation => "policy-violation",
            StreamErrorCondition::SystemShutdown => "system-shutdown",
        }
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recoverable stanza-level error conditions (RFC 6120 §8.3.3 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// The stanza is malformed for its kind.
    BadRequest,
    /// The requester is not allowed to perform the action.
    Forbidden,
    /// The addressed item does not exist.
    ItemNotFound,
    /// The requester must authenticate first.
    NotAuthorized,
    /// The intended recipient is (temporarily) unavailable.
    RecipientUnavailable,
    /// No handler exists for the request.
    ServiceUnavailable,
    /// The requested resource is already in use.
    Conflict,
}

impl StanzaErrorCondition {
    /// The defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaErrorCondition::BadRequest => "bad-request",
            StanzaErrorCondition::Forbidden => "forbidden",
            StanzaErrorCondition::ItemNotFound => "item-not-found",
            StanzaErrorCondition::NotAuthorized => "not-authorized",
            StanzaErrorCondition::RecipientUnavailable => "recipient-unavailable",
            StanzaErrorCondition::ServiceUnavailable => "service-unavailable",
            StanzaErrorCondition::Conflict => "conflict",
        }
    }

    /// The `error/@type` that accompanies this condition.
    pub fn error_type(&self) -> &'static str {
        match self {
            StanzaErrorCondition::BadRequest => "modify",
            StanzaErrorCondition::Forbidden => "auth",
            StanzaErrorCondition::ItemNotFound => "cancel",
            StanzaErrorCondition::NotAuthorized => "auth",
            StanzaErrorCondition::RecipientUnavailable => "wait",
            StanzaErrorCondition::ServiceUnavailable => "cancel",
            StanzaErrorCondition::Conflict => "cancel",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SASL failure kinds (RFC 6120 §6.5 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslFailure {
    /// The authorization identity is not permitted for the authenticated
    /// identity.
    InvalidAuthzid,
    /// Credentials are known but expired.
    CredentialsExpired,
    /// Wrong credentials, unknown user, or the mechanism is not allowed in
    /// this state.
    NotAuthorized,
    /// A transient server-side failure; retrying later may succeed.
    TemporaryAuthFailure,
    /// The client payload could not be parsed.
    MalformedRequest,
    /// The requested mechanism is not offered.
    InvalidMechanism,
    /// The exchange was aborted by the client.
    Aborted,
}

impl SaslFailure {
    /// The defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslFailure::InvalidAuthzid => "invalid-authzid",
            SaslFailure::CredentialsExpired => "credentials-expired",
            SaslFailure::NotAuthorized => "not-authorized",
            SaslFailure::TemporaryAuthFailure => "temporary-auth-failure",
            SaslFailure::MalformedRequest => "malformed-request",
            SaslFailure::InvalidMechanism => "invalid-mechanism",
            SaslFailure::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SaslFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur anywhere in the server core.
#[derive(Debug, Error)]
pub enum XmppError {
    /// The stream must be terminated with the given condition.
    #[error("stream error: {0}")]
    Stream(StreamErrorCondition),

    /// A stanza-level error to be reported back to the sender.
    #[error("stanza error: {condition}")]
    Stanza {
        /// Defined condition for the error reply.
        condition: StanzaErrorCondition,
        /// Optional human-readable text.
        text: Option<String>,
    },

    /// XML decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A JID failed to parse.
    #[error("invalid JID: {0}")]
    Jid(#[from] JidParseError),

    /// The session is already closed.
    #[error("session closed")]
    SessionClosed,

    /// The per-session outbound queue overflowed.
    #[error("outbound queue overflow")]
    QueueOverflow,

    /// TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Underlying transport failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A negotiation step exceeded its deadline.
    #[error("negotiation step timed out")]
    Timeout,

    /// Anything unexpected; logged at error level by the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Shorthand for a stanza error without text.
    pub fn stanza(condition: StanzaErrorCondition) -> Self {
        XmppError::Stanza {
            condition,
            text: None,
        }
    }

    /// Shorthand for a stanza error with explanatory text.
    pub fn stanza_with_text(condition: StanzaErrorCondition, text: impl Into<String>) -> Self {
        XmppError::Stanza {
            condition,
            text: Some(text.into()),
        }
    }

    /// Shorthand for an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        XmppError::Internal(msg.into())
    }
}
