//! Redirect table primitives shared with the kernel verdict program.
//!
//! This library provides:
//! - Redirect key derivation from a connection's port pair
//! - The [`RedirectMap`] seam every installer and monitor writes through
//! - The kernel-backed sock-hash map and the BPF program bootstrap

mod key;
mod kernel;
mod map;

pub use key::{PortPair, RedirectKey};
pub use kernel::{KernelRedirectMap, SockmapPrograms, SockmapSpec};
pub use map::{MapError, RedirectMap};
