//! tlsplice terminator
//!
//! TLS terminator with a kernel data path.
//!
//! This service:
//! - Loads the sockmap parser/verdict programs and their redirect map
//! - Accepts TLS clients and completes the handshake in user space
//! - Dials the backend and cross-wires the pair in the redirect map
//! - Moves the session keys into kernel TLS
//! - Tears the pair down when the client hangs up

use std::sync::Arc;

use anyhow::{Context, Result};
use tlsplice_redirect::SockmapPrograms;
use tlsplice_terminator::proxy::{
    BackendDialer, HandshakeGate, Installer, KernelTls, Listener, ListenerConfig, SniInspector,
    Splicer,
};
use tlsplice_terminator::{sink::Sink, tls};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TLSPLICE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tlsplice terminator");
    info!(
        listen_addr = %config.listen_addr,
        backend_addr = %config.backend_addr,
        bpf_object = %config.sockmap.object_path.display(),
        sniff_sni = config.sniff_sni,
        sink = config.sink,
        "Configuration loaded"
    );

    let tls_config = tls::load_server_config(&config.cert_path, &config.key_path)?;

    // Programs stay attached for as long as `_programs` lives.
    let (_programs, redirect_map) =
        SockmapPrograms::load(&config.sockmap).context("Failed to load sockmap programs")?;

    if config.sink {
        Sink::spawn(config.backend_addr)
            .await
            .with_context(|| format!("Failed to start sink on {}", config.backend_addr))?;
    }

    let installer = Installer::new(Arc::new(redirect_map), KernelTls)
        .with_socket_buffer_bytes(config.socket_buffer_bytes);
    let mut splicer = Splicer::new(
        HandshakeGate::with_timeout(tls_config, config.handshake_timeout),
        BackendDialer::with_timeout(config.backend_addr, config.connect_timeout),
        installer,
    );
    if config.sniff_sni {
        splicer = splicer.with_sni_inspector(SniInspector::new());
    }

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = Listener::bind(listener_config, Arc::new(splicer))
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.listen_addr))?;

    Arc::new(listener).run().await?;
    Ok(())
}
