//! Shared fixtures for the integration tests: an in-process server over a
//! real TCP listener with a self-signed certificate, and a raw byte-level
//! XMPP client for driving the wire protocol directly.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use gannet_xmpp::roster::MemoryRosterStore;
use gannet_xmpp::storage::{AccountStore, MemoryAccountStore, MemoryOfflineStore};
use gannet_xmpp::{ServerRuntimeContext, XmppConfig};

/// Generous bound for every read in the tests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The domain the test server is authoritative for.
pub const TEST_DOMAIN: &str = "vysper.org";

/// Install the ring provider exactly once per test binary.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Base64 payload for SASL PLAIN with an empty authzid.
pub fn encode_sasl_plain(authcid: &str, password: &str) -> String {
    BASE64.encode(format!("\0{authcid}\0{password}"))
}

/// Pull the bound JID out of a bind result.
pub fn extract_bound_jid(response: &str) -> Option<String> {
    let start = response.find("<jid>")? + "<jid>".len();
    let end = response[start..].find("</jid>")? + start;
    Some(response[start..end].to_owned())
}

/// An in-process server bound to an ephemeral port.
pub struct TestServer {
    ctx: Arc<ServerRuntimeContext>,
    addr: SocketAddr,
    connector: TlsConnector,
}

impl TestServer {
    /// Start a server for `vysper.org` with `user1`/`user2` provisioned.
    pub async fn start() -> TestServer {
        install_crypto_provider();

        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
            .expect("generate self-signed certificate");
        let cert_der = certified.cert.der().clone();
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
            certified.key_pair.serialize_der().into(),
        );
        let server_tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .expect("server TLS config");
        let acceptor = TlsAcceptor::from(Arc::new(server_tls));

        let accounts = Arc::new(MemoryAccountStore::new());
        for (user, password) in [("user1", "password1"), ("user2", "password2")] {
            accounts
                .add(
                    &format!("{user}@{TEST_DOMAIN}").parse().expect("test jid"),
                    password,
                )
                .await
                .expect("provision test account");
        }

        let ctx = ServerRuntimeContext::new(
            XmppConfig::for_domain(TEST_DOMAIN),
            accounts,
            Arc::new(MemoryRosterStore::new()),
            Arc::new(MemoryOfflineStore::new()),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(gannet_xmpp::c2s::serve(
            Arc::clone(&ctx),
            listener,
            Some(acceptor),
        ));

        TestServer {
            ctx,
            addr,
            connector: insecure_connector(),
        }
    }

    /// The runtime context backing the server.
    pub fn ctx(&self) -> &Arc<ServerRuntimeContext> {
        &self.ctx
    }

    /// Where the C2S listener accepts connections.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A connector that accepts the test server's self-signed certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        self.connector.clone()
    }
}

enum ClientStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Byte-level XMPP client for exercising the wire protocol.
pub struct RawXmppClient {
    stream: Option<ClientStream>,
    buffer: String,
}

impl RawXmppClient {
    /// Connect over plain TCP.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<RawXmppClient> {
        let stream = TcpStream::connect(addr).await?;
        Ok(RawXmppClient {
            stream: Some(ClientStream::Plain(stream)),
            buffer: String::new(),
        })
    }

    /// Write raw bytes to the server.
    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        match self.stream.as_mut().expect("stream present") {
            ClientStream::Plain(stream) => {
                stream.write_all(data.as_bytes()).await?;
                stream.flush().await
            }
            ClientStream::Tls(stream) => {
                stream.write_all(data.as_bytes()).await?;
                stream.flush().await
            }
        }
    }

    /// Read until the accumulated input contains `marker`.
    pub async fn read_until(
        &mut self,
        marker: &str,
        timeout: Duration,
    ) -> Result<String, String> {
        tokio::time::timeout(timeout, async {
            let mut chunk = [0u8; 4096];
            loop {
                if self.buffer.contains(marker) {
                    return Ok(self.buffer.clone());
                }
                let n = match self.stream.as_mut().expect("stream present") {
                    ClientStream::Plain(stream) => stream.read(&mut chunk).await,
                    ClientStream::Tls(stream) => stream.read(&mut chunk).await,
                }
                .map_err(|err| format!("read error: {err}"))?;
                if n == 0 {
                    return Err(format!(
                        "connection closed before '{marker}' arrived; buffer: {}",
                        self.buffer
                    ));
                }
                self.buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
            }
        })
        .await
        .map_err(|_| format!("timed out waiting for '{marker}'; buffer: {}", self.buffer))?
    }

    /// Read until the connection closes, returning everything seen.
    pub async fn read_to_close(&mut self, timeout: Duration) -> String {
        let _ = tokio::time::timeout(timeout, async {
            let mut chunk = [0u8; 4096];
            loop {
                let n = match self.stream.as_mut().expect("stream present") {
                    ClientStream::Plain(stream) => stream.read(&mut chunk).await,
                    ClientStream::Tls(stream) => stream.read(&mut chunk).await,
                };
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => self.buffer.push_str(&String::from_utf8_lossy(&chunk[..n])),
                }
            }
        })
        .await;
        self.buffer.clone()
    }

    /// Drop everything accumulated so far.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Run the client-side TLS handshake over the existing TCP stream.
    pub async fn upgrade_tls(
        &mut self,
        connector: TlsConnector,
        server_name: &str,
    ) -> Result<(), String> {
        let ClientStream::Plain(tcp) = self.stream.take().expect("stream present") else {
            return Err("already on TLS".to_owned());
        };
        let name = rustls::pki_types::ServerName::try_from(server_name.to_owned())
            .map_err(|err| format!("bad server name: {err}"))?;
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|err| format!("TLS handshake failed: {err}"))?;
        self.stream = Some(ClientStream::Tls(Box::new(tls)));
        self.buffer.clear();
        Ok(())
    }
}

/// Certificate verifier that accepts anything; test use only.
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn insecure_connector() -> TlsConnector {
    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Drive a fresh client through STARTTLS, SASL PLAIN, and resource
/// binding; returns the client and its bound full JID.
pub async fn establish_session(
    server: &TestServer,
    username: &str,
    password: &str,
    resource: &str,
) -> (RawXmppClient, String) {
    let mut client = RawXmppClient::connect(server.addr())
        .await
        .expect("connect");

    client
        .send(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='vysper.org' version='1.0'>",
        )
        .await
        .expect("send initial header");
    let features = client
        .read_until("</stream:features>", DEFAULT_TIMEOUT)
        .await
        .expect("initial features");
    assert!(
        features.contains("<starttls"),
        "expected STARTTLS offer, got: {features}"
    );
    client.clear();

    client
        .send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
        .await
        .expect("send starttls");
    client
        .read_until("<proceed", DEFAULT_TIMEOUT)
        .await
        .expect("proceed");
    client
        .upgrade_tls(server.tls_connector(), "localhost")
        .await
        .expect("tls upgrade");

    client
        .send(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='vysper.org' version='1.0'>",
        )
        .await
        .expect("send post-tls header");
    let features = client
        .read_until("</stream:features>", DEFAULT_TIMEOUT)
        .await
        .expect("post-tls features");
    assert!(
        features.contains("PLAIN"),
        "expected PLAIN after TLS, got: {features}"
    );
    client.clear();

    let payload = encode_sasl_plain(username, password);
    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{payload}</auth>"
        ))
        .await
        .expect("send auth");
    client
        .read_until("<success", DEFAULT_TIMEOUT)
        .await
        .expect("sasl success");
    client.clear();

    client
        .send(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='vysper.org' version='1.0'>",
        )
        .await
        .expect("send post-auth header");
    let features = client
        .read_until("</stream:features>", DEFAULT_TIMEOUT)
        .await
        .expect("post-auth features");
    assert!(
        features.contains("<bind"),
        "expected bind feature, got: {features}"
    );
    client.clear();

    client
        .send(&format!(
            "<iq type='set' id='bind_1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{resource}</resource></bind></iq>"
        ))
        .await
        .expect("send bind");
    let bind_result = client
        .read_until("</iq>", DEFAULT_TIMEOUT)
        .await
        .expect("bind result");
    let full_jid = extract_bound_jid(&bind_result).expect("bound jid present");
    client.clear();

    (client, full_jid)
}
