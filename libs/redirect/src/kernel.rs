//! Kernel-resident sock-hash map and its program bootstrap.
//!
//! The parser and verdict programs are an external collaborator: this module
//! only loads them, attaches them to the map, and drives map updates through
//! `bpf(2)` so concurrent connection tasks never serialize on a user-space
//! lock.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::maps::{MapData, SockHash};
use aya::programs::SkSkb;
use aya::Ebpf;
use tracing::{debug, info, warn};

use crate::map::{MapError, RedirectMap};
use crate::RedirectKey;

const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;
const BPF_ANY: u64 = 0;

/// Where to find the sockmap programs and the names inside the object.
#[derive(Debug, Clone)]
pub struct SockmapSpec {
    /// Compiled BPF object file.
    pub object_path: PathBuf,
    /// Name of the sock-hash map.
    pub map_name: String,
    /// Name of the stream parser program.
    pub parser_program: String,
    /// Name of the stream verdict program.
    pub verdict_program: String,
}

impl SockmapSpec {
    /// Object at `object_path` with the stock map and program names.
    pub fn new(object_path: impl Into<PathBuf>) -> Self {
        Self {
            object_path: object_path.into(),
            map_name: "hash_map".to_string(),
            parser_program: "prog_parser".to_string(),
            verdict_program: "prog_verdict".to_string(),
        }
    }
}

/// Loaded parser and verdict programs.
///
/// Dropping this detaches the programs from the map, so it must live as long
/// as the process serves connections.
pub struct SockmapPrograms {
    _ebpf: Ebpf,
}

impl SockmapPrograms {
    /// Load the object, attach both programs to its sock-hash map, and hand
    /// back the map for connection pairs to populate.
    pub fn load(spec: &SockmapSpec) -> Result<(Self, KernelRedirectMap)> {
        remove_memlock_limit();

        let mut ebpf = Ebpf::load_file(&spec.object_path).with_context(|| {
            format!("failed to load BPF object {}", spec.object_path.display())
        })?;

        let map = ebpf
            .take_map(&spec.map_name)
            .with_context(|| format!("map '{}' not found in BPF object", spec.map_name))?;
        let sock_hash: SockHash<MapData, u64> = SockHash::try_from(map)
            .with_context(|| format!("map '{}' is not a sock hash", spec.map_name))?;
        let map_fd = sock_hash
            .fd()
            .try_clone()
            .context("failed to duplicate sock hash descriptor")?;

        for name in [&spec.parser_program, &spec.verdict_program] {
            let program: &mut SkSkb = ebpf
                .program_mut(name)
                .with_context(|| format!("program '{}' not found in BPF object", name))?
                .try_into()
                .with_context(|| format!("program '{}' is not an sk_skb program", name))?;
            program
                .load()
                .with_context(|| format!("failed to load program '{}'", name))?;
            program
                .attach(&map_fd)
                .with_context(|| format!("failed to attach program '{}'", name))?;
            debug!(program = %name, map = %spec.map_name, "Program attached");
        }

        let owned = map_fd
            .as_fd()
            .try_clone_to_owned()
            .context("failed to take ownership of sock hash descriptor")?;

        info!(
            object = %spec.object_path.display(),
            map = %spec.map_name,
            "Sockmap programs attached"
        );

        Ok((Self { _ebpf: ebpf }, KernelRedirectMap::from_fd(owned)))
    }
}

/// `bpf_attr` layout for the map element commands.
#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

/// The sock-hash map living in the kernel.
#[derive(Debug)]
pub struct KernelRedirectMap {
    fd: OwnedFd,
}

impl KernelRedirectMap {
    /// Wrap an existing sock-hash map descriptor (for example a pinned map).
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    fn elem_op(&self, cmd: libc::c_int, key: &u64, value: Option<&u32>) -> io::Result<()> {
        let attr = MapElemAttr {
            map_fd: self.fd.as_raw_fd() as u32,
            _pad: 0,
            key: key as *const u64 as u64,
            value: value.map_or(0, |v| v as *const u32 as u64),
            flags: BPF_ANY,
        };

        // SAFETY: attr and the key/value it points at outlive the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                cmd,
                &attr as *const MapElemAttr,
                mem::size_of::<MapElemAttr>() as libc::c_uint,
            )
        };

        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl RedirectMap for KernelRedirectMap {
    fn insert(&self, key: RedirectKey, socket: BorrowedFd<'_>) -> Result<(), MapError> {
        let raw_key = key.as_u64();
        let fd = socket.as_raw_fd() as u32;
        self.elem_op(BPF_MAP_UPDATE_ELEM, &raw_key, Some(&fd))
            .map_err(|source| MapError::Insert { key, source })
    }

    fn remove(&self, key: RedirectKey) -> Result<(), MapError> {
        let raw_key = key.as_u64();
        match self.elem_op(BPF_MAP_DELETE_ELEM, &raw_key, None) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(source) => Err(MapError::Remove { key, source }),
        }
    }
}

/// Lift RLIMIT_MEMLOCK so map and program allocations are not refused on
/// kernels that still charge BPF memory against it.
fn remove_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: rlim is a valid rlimit for the duration of the call.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!(error = %io::Error::last_os_error(), "Failed to remove memlock limit");
    }
}
