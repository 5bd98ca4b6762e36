//! TLS termination with a kernel data path.
//!
//! This module provides:
//! - TCP listener management
//! - Optional SNI inspection that leaves the stream untouched
//! - The user-space handshake and backend dial
//! - Redirect map installation and kernel TLS offload
//! - Peer-close monitoring and teardown
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> [SNI Inspector] -> Handshake Gate -> Backend Dialer
//!                                                                 |
//!                                   Installer (map entries, then kTLS)
//!                                                                 |
//!                                   Lifecycle Monitor -> teardown on client close
//! ```
//!
//! After installation no payload byte passes through this process: the
//! verdict program moves records between the two sockets.
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BackendDialer, HandshakeGate, Installer, KernelTls, Listener, ListenerConfig, Splicer};
//!
//! let installer = Installer::new(Arc::new(redirect_map), KernelTls);
//! let splicer = Splicer::new(HandshakeGate::new(tls_config), BackendDialer::new(backend), installer);
//!
//! let config = ListenerConfig::new("0.0.0.0:443".parse()?);
//! let listener = Listener::bind(config, Arc::new(splicer)).await?;
//! Arc::new(listener).run().await?;
//! ```

mod backend;
mod gate;
mod install;
mod ktls;
mod listener;
mod monitor;
mod peek;
mod sni;
mod splicer;

pub use backend::{BackendDialer, DEFAULT_CONNECT_TIMEOUT};
pub use gate::{HandshakeGate, Handshaken, DEFAULT_HANDSHAKE_TIMEOUT};
pub use install::{
    ConnectionPair, Installer, PairState, SplicedPair, DEFAULT_SOCKET_BUFFER_BYTES,
};
pub use ktls::{Direction, KernelTls, KtlsState, OffloadError, TlsOffload};
pub use listener::{Listener, ListenerConfig, DEFAULT_MAX_CONNECTIONS};
pub use monitor::{LifecycleMonitor, PeerCloseWatch, DEFAULT_REGISTRATION_ATTEMPTS};
pub use peek::PeekedStream;
pub use sni::{SniConfig, SniInspector, SniResult, DEFAULT_SNIFF_TIMEOUT};
pub use splicer::Splicer;
