use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use gannet_xmpp::bosh::http::{bosh_router, BoshHttpState};
use gannet_xmpp::bosh::BoshManager;
use gannet_xmpp::modules::ModuleRegistry;
use gannet_xmpp::roster::MemoryRosterStore;
use gannet_xmpp::s2s::S2sManager;
use gannet_xmpp::storage::{MemoryAccountStore, MemoryOfflineStore};
use gannet_xmpp::{ServerRuntimeContext, XmppConfig};

mod telemetry;

/// Standalone XMPP server.
#[derive(Parser, Debug)]
#[command(name = "gannet-server", version, about)]
struct Args {
    /// Path to the TOML configuration file. Falls back to environment
    /// variables (GANNET_DOMAIN, ...) when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the ring crypto provider for rustls (required for TLS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    telemetry::init();

    info!("Gannet starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => XmppConfig::load(path)
            .map_err(|err| anyhow::anyhow!("Failed to load configuration: {err}"))?,
        None => XmppConfig::from_env()
            .map_err(|err| anyhow::anyhow!("Failed to load configuration: {err}"))?,
    };
    config.log_config();

    let tls_acceptor = gannet_xmpp::c2s::load_tls_acceptor(&config.tls)
        .map_err(|err| anyhow::anyhow!("Failed to load TLS certificate: {err}"))?;

    let s2s_manager = if config.s2s.enabled {
        S2sManager::with_tls(outbound_tls_connector())
    } else {
        S2sManager::new()
    };

    let ctx = ServerRuntimeContext::with_parts(
        config.clone(),
        Arc::new(MemoryAccountStore::new()),
        Arc::new(MemoryRosterStore::new()),
        Arc::new(MemoryOfflineStore::new()),
        ModuleRegistry::with_defaults(),
        s2s_manager,
    );

    // Client-to-server listener.
    let c2s_listener = tokio::net::TcpListener::bind(&config.c2s_listen).await?;
    tokio::spawn(gannet_xmpp::c2s::serve(
        Arc::clone(&ctx),
        c2s_listener,
        tls_acceptor,
    ));

    // Server-to-server listener.
    if config.s2s.enabled {
        let s2s_listener = tokio::net::TcpListener::bind(&config.s2s_listen).await?;
        tokio::spawn(gannet_xmpp::s2s::serve(Arc::clone(&ctx), s2s_listener));
    }

    // BOSH over HTTP.
    let bosh_manager = Arc::new(BoshManager::new());
    let bosh_listener = tokio::net::TcpListener::bind(&config.bosh_listen).await?;
    let router = bosh_router(BoshHttpState {
        ctx: Arc::clone(&ctx),
        manager: Arc::clone(&bosh_manager),
    });
    tokio::spawn(async move {
        if let Err(err) = axum::serve(bosh_listener, router).await {
            tracing::error!(error = %err, "BOSH HTTP server failed");
        }
    });

    // Periodic BOSH inactivity sweep.
    {
        let ctx = Arc::clone(&ctx);
        let manager = Arc::clone(&bosh_manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                ticker.tick().await;
                manager.sweep_inactive(&ctx).await;
            }
        });
    }

    info!("Gannet is up");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

/// TLS connector for outbound S2S links, trusting the Mozilla root set.
fn outbound_tls_connector() -> tokio_rustls::TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}
