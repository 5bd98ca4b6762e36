//! Terminator configuration.
//!
//! Everything is env-driven; every variable has a default so a bare
//! invocation serves `./cert.pem` on :443 in front of 127.0.0.1:8080.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tlsplice_redirect::SockmapSpec;
use tlsplice_terminator::proxy::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_SOCKET_BUFFER_BYTES,
};

/// Terminator configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TLS listener binds to.
    pub listen_addr: SocketAddr,

    /// Plaintext backend every client is paired with.
    pub backend_addr: SocketAddr,

    /// PEM certificate chain.
    pub cert_path: PathBuf,

    /// PEM private key.
    pub key_path: PathBuf,

    /// BPF object and the names inside it.
    pub sockmap: SockmapSpec,

    pub handshake_timeout: Duration,

    pub connect_timeout: Duration,

    /// Max concurrent client connections.
    pub max_connections: usize,

    /// SO_SNDBUF/SO_RCVBUF for spliced client sockets.
    pub socket_buffer_bytes: usize,

    /// Log the SNI of each connection before the handshake.
    pub sniff_sni: bool,

    /// Serve the built-in logging backend on `backend_addr`.
    pub sink: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = parse(&lookup, "TLSPLICE_LISTEN_ADDR")
            .context("TLSPLICE_LISTEN_ADDR must be a socket address (ip:port).")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 443)));

        let backend_addr = parse(&lookup, "TLSPLICE_BACKEND_ADDR")
            .context("TLSPLICE_BACKEND_ADDR must be a socket address (ip:port).")?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

        let cert_path = lookup("TLSPLICE_CERT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./cert.pem"));

        let key_path = lookup("TLSPLICE_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./key.pem"));

        let mut sockmap = SockmapSpec::new(
            lookup("TLSPLICE_BPF_OBJECT").unwrap_or_else(|| "./proxy-sockmap.o".to_string()),
        );
        if let Some(name) = lookup("TLSPLICE_MAP_NAME") {
            sockmap.map_name = name;
        }
        if let Some(name) = lookup("TLSPLICE_PARSER_PROG") {
            sockmap.parser_program = name;
        }
        if let Some(name) = lookup("TLSPLICE_VERDICT_PROG") {
            sockmap.verdict_program = name;
        }

        let handshake_timeout = parse::<u64>(&lookup, "TLSPLICE_HANDSHAKE_TIMEOUT_MS")
            .context("TLSPLICE_HANDSHAKE_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);

        let connect_timeout = parse::<u64>(&lookup, "TLSPLICE_CONNECT_TIMEOUT_MS")
            .context("TLSPLICE_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let max_connections: usize = parse(&lookup, "TLSPLICE_MAX_CONNECTIONS")
            .context("TLSPLICE_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let socket_buffer_bytes = parse(&lookup, "TLSPLICE_SOCKET_BUFFER_BYTES")
            .context("TLSPLICE_SOCKET_BUFFER_BYTES must be an integer (bytes).")?
            .unwrap_or(DEFAULT_SOCKET_BUFFER_BYTES);

        let sniff_sni = flag(&lookup, "TLSPLICE_SNIFF_SNI");
        let sink = flag(&lookup, "TLSPLICE_SINK");

        let log_level = lookup("TLSPLICE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            backend_addr,
            cert_path,
            key_path,
            sockmap,
            handshake_timeout,
            connect_timeout,
            max_connections,
            socket_buffer_bytes,
            sniff_sni,
            sink,
            log_level,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.parse::<T>())
        .transpose()
        .map_err(Into::into)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}
