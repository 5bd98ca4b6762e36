//! Kernel TLS offload for the client socket.
//!
//! After the handshake, the negotiated traffic secrets and sequence numbers
//! are written into the socket's TLS ULP so the kernel encrypts outbound and
//! decrypts inbound records itself. From then on the socket carries
//! plaintext at the syscall boundary, which is what lets the sockmap verdict
//! program splice it to the backend.
//!
//! Supported ciphers: AES-128-GCM, AES-256-GCM, ChaCha20-Poly1305, for both
//! TLS 1.2 and TLS 1.3.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd};

use rustls::{ConnectionTrafficSecrets, ProtocolVersion, ServerConnection, SupportedCipherSuite};
use thiserror::Error;
use tracing::debug;

const SOL_TCP: libc::c_int = 6;
const TCP_ULP: libc::c_int = 31;
const SOL_TLS: libc::c_int = 282;
const TLS_TX: libc::c_int = 1;
const TLS_RX: libc::c_int = 2;

const TLS_1_2_VERSION: u16 = 0x0303;
const TLS_1_3_VERSION: u16 = 0x0304;

const TLS_CIPHER_AES_GCM_128: u16 = 51;
const TLS_CIPHER_AES_GCM_256: u16 = 52;
const TLS_CIPHER_CHACHA20_POLY1305: u16 = 54;

/// Record direction relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Tx => write!(f, "tx"),
            Direction::Rx => write!(f, "rx"),
        }
    }
}

/// Which directions the kernel took over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KtlsState {
    pub tx: bool,
    pub rx: bool,
}

impl KtlsState {
    pub fn is_full(&self) -> bool {
        self.tx && self.rx
    }
}

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("attaching the tls ULP failed: {0}")]
    Ulp(#[source] io::Error),

    #[error("session has no negotiated cipher suite")]
    NoCipherSuite,

    #[error("extracting traffic secrets failed: {0}")]
    Secrets(#[source] rustls::Error),

    #[error("cipher suite {0} is not supported by kernel TLS")]
    UnsupportedCipher(String),

    #[error("key material is {actual} bytes, expected {expected}")]
    KeyMaterial { expected: usize, actual: usize },

    #[error("enabling kernel TLS {direction} failed: {source}")]
    Enable {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

/// Hands a completed session to an offload engine.
///
/// The session is consumed: once its secrets leave user space it can no
/// longer be used to encrypt or decrypt.
pub trait TlsOffload<S>: Send + Sync {
    fn enable(&self, socket: BorrowedFd<'_>, session: S) -> Result<KtlsState, OffloadError>;
}

/// Linux kernel TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelTls;

impl TlsOffload<ServerConnection> for KernelTls {
    fn enable(
        &self,
        socket: BorrowedFd<'_>,
        session: ServerConnection,
    ) -> Result<KtlsState, OffloadError> {
        let suite = session
            .negotiated_cipher_suite()
            .ok_or(OffloadError::NoCipherSuite)?;

        set_ulp(socket).map_err(OffloadError::Ulp)?;

        let secrets = session
            .dangerous_extract_secrets()
            .map_err(OffloadError::Secrets)?;
        let tx = CryptoInfo::from_rustls(suite, secrets.tx)?;
        let rx = CryptoInfo::from_rustls(suite, secrets.rx)?;

        let mut state = KtlsState::default();
        set_crypto_info(socket, Direction::Tx, &tx)?;
        state.tx = true;
        set_crypto_info(socket, Direction::Rx, &rx)?;
        state.rx = true;

        debug!(cipher_suite = ?suite.suite(), "Kernel TLS enabled");
        Ok(state)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct CryptoInfoHeader {
    version: u16,
    cipher_type: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Aes128GcmInfo {
    info: CryptoInfoHeader,
    iv: [u8; 8],
    key: [u8; 16],
    salt: [u8; 4],
    rec_seq: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Aes256GcmInfo {
    info: CryptoInfoHeader,
    iv: [u8; 8],
    key: [u8; 32],
    salt: [u8; 4],
    rec_seq: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Chacha20Poly1305Info {
    info: CryptoInfoHeader,
    iv: [u8; 12],
    key: [u8; 32],
    salt: [u8; 0],
    rec_seq: [u8; 8],
}

/// Layout the kernel expects for `setsockopt(SOL_TLS, TLS_TX | TLS_RX)`.
#[derive(Debug, Clone, Copy)]
enum CryptoInfo {
    Aes128Gcm(Aes128GcmInfo),
    Aes256Gcm(Aes256GcmInfo),
    Chacha20Poly1305(Chacha20Poly1305Info),
}

impl CryptoInfo {
    fn from_rustls(
        suite: SupportedCipherSuite,
        (seq, secrets): (u64, ConnectionTrafficSecrets),
    ) -> Result<Self, OffloadError> {
        let version = if suite.version().version == ProtocolVersion::TLSv1_3 {
            TLS_1_3_VERSION
        } else {
            TLS_1_2_VERSION
        };
        let rec_seq = seq.to_be_bytes();

        // For GCM the 12-byte IV splits into a 4-byte salt and 8-byte nonce.
        match secrets {
            ConnectionTrafficSecrets::Aes128Gcm { key, iv } => {
                let iv = iv.as_ref();
                Ok(CryptoInfo::Aes128Gcm(Aes128GcmInfo {
                    info: CryptoInfoHeader {
                        version,
                        cipher_type: TLS_CIPHER_AES_GCM_128,
                    },
                    iv: fixed(iv.get(4..).unwrap_or_default())?,
                    key: fixed(key.as_ref())?,
                    salt: fixed(iv.get(..4).unwrap_or_default())?,
                    rec_seq,
                }))
            }
            ConnectionTrafficSecrets::Aes256Gcm { key, iv } => {
                let iv = iv.as_ref();
                Ok(CryptoInfo::Aes256Gcm(Aes256GcmInfo {
                    info: CryptoInfoHeader {
                        version,
                        cipher_type: TLS_CIPHER_AES_GCM_256,
                    },
                    iv: fixed(iv.get(4..).unwrap_or_default())?,
                    key: fixed(key.as_ref())?,
                    salt: fixed(iv.get(..4).unwrap_or_default())?,
                    rec_seq,
                }))
            }
            ConnectionTrafficSecrets::Chacha20Poly1305 { key, iv } => {
                Ok(CryptoInfo::Chacha20Poly1305(Chacha20Poly1305Info {
                    info: CryptoInfoHeader {
                        version,
                        cipher_type: TLS_CIPHER_CHACHA20_POLY1305,
                    },
                    iv: fixed(iv.as_ref())?,
                    key: fixed(key.as_ref())?,
                    salt: [],
                    rec_seq,
                }))
            }
            _ => Err(OffloadError::UnsupportedCipher(format!(
                "{:?}",
                suite.suite()
            ))),
        }
    }

    fn as_ptr(&self) -> *const libc::c_void {
        match self {
            CryptoInfo::Aes128Gcm(info) => info as *const _ as *const libc::c_void,
            CryptoInfo::Aes256Gcm(info) => info as *const _ as *const libc::c_void,
            CryptoInfo::Chacha20Poly1305(info) => info as *const _ as *const libc::c_void,
        }
    }

    fn size(&self) -> usize {
        match self {
            CryptoInfo::Aes128Gcm(_) => mem::size_of::<Aes128GcmInfo>(),
            CryptoInfo::Aes256Gcm(_) => mem::size_of::<Aes256GcmInfo>(),
            CryptoInfo::Chacha20Poly1305(_) => mem::size_of::<Chacha20Poly1305Info>(),
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], OffloadError> {
    bytes.try_into().map_err(|_| OffloadError::KeyMaterial {
        expected: N,
        actual: bytes.len(),
    })
}

fn set_ulp(socket: BorrowedFd<'_>) -> io::Result<()> {
    let name = b"tls";
    // SAFETY: the pointer and length describe a live static byte string.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_TCP,
            TCP_ULP,
            name.as_ptr() as *const libc::c_void,
            name.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_crypto_info(
    socket: BorrowedFd<'_>,
    direction: Direction,
    info: &CryptoInfo,
) -> Result<(), OffloadError> {
    let optname = match direction {
        Direction::Tx => TLS_TX,
        Direction::Rx => TLS_RX,
    };
    // SAFETY: `info` is a repr(C) struct borrowed for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_TLS,
            optname,
            info.as_ptr(),
            info.size() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(OffloadError::Enable {
            direction,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::crypto::cipher::{AeadKey, Iv};
    use rustls::crypto::ring::cipher_suite;
    use std::net::UdpSocket;
    use std::os::fd::AsFd;

    fn iv() -> Iv {
        Iv::new([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11])
    }

    #[test]
    fn test_struct_sizes_match_kernel_abi() {
        assert_eq!(mem::size_of::<CryptoInfoHeader>(), 4);
        assert_eq!(mem::size_of::<Aes128GcmInfo>(), 40);
        assert_eq!(mem::size_of::<Aes256GcmInfo>(), 56);
        assert_eq!(mem::size_of::<Chacha20Poly1305Info>(), 56);
    }

    #[test]
    fn test_aes256_gcm_tls13_layout() {
        let secrets = ConnectionTrafficSecrets::Aes256Gcm {
            key: AeadKey::from([7u8; 32]),
            iv: iv(),
        };
        let info =
            CryptoInfo::from_rustls(cipher_suite::TLS13_AES_256_GCM_SHA384, (5, secrets)).unwrap();

        let CryptoInfo::Aes256Gcm(info) = info else {
            panic!("wrong variant: {info:?}");
        };
        assert_eq!(info.info.version, TLS_1_3_VERSION);
        assert_eq!(info.info.cipher_type, TLS_CIPHER_AES_GCM_256);
        assert_eq!(info.salt, [0, 1, 2, 3]);
        assert_eq!(info.iv, [4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(info.key, [7u8; 32]);
        assert_eq!(info.rec_seq, 5u64.to_be_bytes());
    }

    #[test]
    fn test_chacha_keeps_full_iv() {
        let secrets = ConnectionTrafficSecrets::Chacha20Poly1305 {
            key: AeadKey::from([9u8; 32]),
            iv: iv(),
        };
        let info = CryptoInfo::from_rustls(
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            (u64::MAX, secrets),
        )
        .unwrap();

        let CryptoInfo::Chacha20Poly1305(info) = info else {
            panic!("wrong variant: {info:?}");
        };
        assert_eq!(info.info.cipher_type, TLS_CIPHER_CHACHA20_POLY1305);
        assert_eq!(info.iv, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(info.rec_seq, [0xff; 8]);
    }

    #[test]
    fn test_tls12_suite_reports_tls12_version() {
        let secrets = ConnectionTrafficSecrets::Aes256Gcm {
            key: AeadKey::from([1u8; 32]),
            iv: iv(),
        };
        let info = CryptoInfo::from_rustls(
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            (0, secrets),
        )
        .unwrap();

        let CryptoInfo::Aes256Gcm(info) = info else {
            panic!("wrong variant: {info:?}");
        };
        assert_eq!(info.info.version, TLS_1_2_VERSION);
    }

    #[test]
    fn test_wrong_key_length_is_rejected() {
        // A 32-byte key under the 128-bit cipher.
        let secrets = ConnectionTrafficSecrets::Aes128Gcm {
            key: AeadKey::from([0u8; 32]),
            iv: iv(),
        };
        let err = CryptoInfo::from_rustls(cipher_suite::TLS13_AES_128_GCM_SHA256, (0, secrets))
            .unwrap_err();
        assert!(matches!(
            err,
            OffloadError::KeyMaterial {
                expected: 16,
                actual: 32
            }
        ));
    }

    #[test]
    fn test_ulp_on_non_tcp_socket_fails() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(set_ulp(socket.as_fd()).is_err());
    }

    #[test]
    fn test_unfinished_session_is_refused_before_ulp() {
        let cert = rcgen::generate_simple_self_signed(vec!["example.test".to_string()]).unwrap();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
            rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()),
        );
        let config = crate::tls::server_config(vec![cert.cert.der().clone()], key).unwrap();
        let session = ServerConnection::new(config).unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = KernelTls.enable(socket.as_fd(), session).unwrap_err();
        assert!(matches!(err, OffloadError::NoCipherSuite));
    }
}
