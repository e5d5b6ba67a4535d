//! Client-to-server connections.
//!
//! [`serve`] accepts TCP connections and spawns one actor task per
//! connection; the actor drives the stream through negotiation (header,
//! STARTTLS, SASL, bind) and then pumps stanzas between the socket and the
//! router. See [`connection`] for the state machine.

mod connection;

pub use connection::run_client_connection;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::TlsConfig;
use crate::error::XmppError;
use crate::runtime::ServerRuntimeContext;
use crate::session::BoxTransport;

/// Build a TLS acceptor from the configured certificate, if any.
pub fn load_tls_acceptor(tls: &TlsConfig) -> Result<Option<TlsAcceptor>, XmppError> {
    let (Some(cert_path), Some(key_path)) = (&tls.certificate_file, &tls.key_file) else {
        return Ok(None);
    };

    let cert_file = std::fs::File::open(cert_path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<_, _>>()?;

    let key_file = std::fs::File::open(key_path)?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
        .ok_or_else(|| XmppError::Tls("no private key found in key file".to_owned()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| XmppError::Tls(err.to_string()))?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// Accept C2S connections until the listener fails.
pub async fn serve(
    ctx: Arc<ServerRuntimeContext>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) {
    info!(addr = ?listener.local_addr().ok(), "C2S listener ready");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                let tls = tls.clone();
                tokio::spawn(async move {
                    let transport: BoxTransport = Box::new(stream);
                    run_client_connection(ctx, transport, tls, peer).await;
                });
            }
            Err(err) => {
                warn!(error = %err, "C2S accept failed");
                return;
            }
        }
    }
}
