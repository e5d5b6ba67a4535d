//! Gannet XMPP server core.
//!
//! The protocol engineering of a standalone XMPP server (RFC 6120/6121):
//! a restartable streaming XML decoder, the session state machine
//! (STARTTLS, SASL, resource binding), stanza routing across local
//! sessions, feature modules and federation links, server dialback
//! (XEP-0220) and a BOSH bridge (XEP-0124/0206).
//!
//! Storage (accounts, rosters, offline messages) is consumed through
//! traits in [`storage`] and [`roster`]; in-memory implementations back
//! tests and single-node use. The `gannet-server` binary wires the
//! listeners, configuration and telemetry around this crate.

pub mod bosh;
pub mod c2s;
pub mod config;
pub mod error;
pub mod jid;
pub mod metrics;
pub mod modules;
pub mod ns;
pub mod roster;
pub mod router;
pub mod runtime;
pub mod s2s;
pub mod sasl;
pub mod session;
pub mod stanza;
pub mod storage;
pub mod xml;

pub use config::XmppConfig;
pub use error::{SaslFailure, StanzaErrorCondition, StreamErrorCondition, XmppError};
pub use jid::{BareJid, FullJid, Jid, JidParseError};
pub use runtime::ServerRuntimeContext;
pub use xml::Element;
