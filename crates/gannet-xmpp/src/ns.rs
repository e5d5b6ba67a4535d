//! XML namespace constants used across the protocol core.

/// `<stream:stream>` framing namespace.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// Default namespace of client-to-server streams.
pub const CLIENT: &str = "jabber:client";

/// Default namespace of server-to-server streams.
pub const SERVER: &str = "jabber:server";

/// Server Dialback (XEP-0220).
pub const DIALBACK: &str = "jabber:server:dialback";

/// STARTTLS negotiation.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// SASL negotiation.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Legacy session establishment (RFC 3921).
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// Stanza error conditions.
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Stream error conditions.
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Roster management (RFC 6121).
pub const ROSTER: &str = "jabber:iq:roster";

/// XMPP Ping (XEP-0199).
pub const PING: &str = "urn:xmpp:ping";

/// Entity Time (XEP-0202).
pub const TIME: &str = "urn:xmpp:time";

/// Software Version (XEP-0092).
pub const VERSION: &str = "jabber:iq:version";

/// BOSH `<body/>` wrapper (XEP-0124).
pub const HTTPBIND: &str = "http://jabber.org/protocol/httpbind";

/// XMPP-over-BOSH extensions (XEP-0206).
pub const XBOSH: &str = "urn:xmpp:xbosh";

/// The `xml:` prefix namespace.
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
