//! The redirect map seam.

use std::io;
use std::os::fd::BorrowedFd;

use thiserror::Error;

use crate::RedirectKey;

/// Errors from redirect map operations.
#[derive(Debug, Error)]
pub enum MapError {
    /// The map refused a new entry.
    #[error("failed to insert redirect entry {key}: {source}")]
    Insert {
        key: RedirectKey,
        #[source]
        source: io::Error,
    },

    /// The map failed to drop an entry for a reason other than absence.
    #[error("failed to remove redirect entry {key}: {source}")]
    Remove {
        key: RedirectKey,
        #[source]
        source: io::Error,
    },
}

impl MapError {
    /// Key the failed operation addressed.
    pub fn key(&self) -> RedirectKey {
        match self {
            MapError::Insert { key, .. } | MapError::Remove { key, .. } => *key,
        }
    }
}

/// Process-wide key → socket table consulted by the verdict program.
///
/// Every operation is atomic on its own; callers never lock around it.
/// Concurrent connection pairs address disjoint keys.
pub trait RedirectMap: Send + Sync {
    /// Point `key` at `socket`, replacing any previous entry.
    fn insert(&self, key: RedirectKey, socket: BorrowedFd<'_>) -> Result<(), MapError>;

    /// Drop the entry for `key`. Removing an absent key succeeds.
    fn remove(&self, key: RedirectKey) -> Result<(), MapError>;
}

impl<M: RedirectMap + ?Sized> RedirectMap for std::sync::Arc<M> {
    fn insert(&self, key: RedirectKey, socket: BorrowedFd<'_>) -> Result<(), MapError> {
        (**self).insert(key, socket)
    }

    fn remove(&self, key: RedirectKey) -> Result<(), MapError> {
        (**self).remove(key)
    }
}
