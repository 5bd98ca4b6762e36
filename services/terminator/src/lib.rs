//! tlsplice terminator library.
//!
//! Terminates TLS in user space, then hands both the crypto (kernel TLS) and
//! the forwarding (a sockmap verdict program) to the kernel for the rest of
//! the connection.

mod error;
pub mod proxy;
pub mod sink;
pub mod tls;

pub use error::SpliceError;
