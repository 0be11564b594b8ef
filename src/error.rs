//! Error types for highmap.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Result type alias using highmap's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a mapping request can fail.
///
/// Errors are always raised to the immediate caller. When one is returned
/// nothing is left behind: no registry entry, no open descriptor and no
/// mapped memory.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing file could not be created, truncated or mapped.
    #[error("{op}: Error creating '{}': {source}", .path.display())]
    CreateFailure {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backing file could not be opened or mapped.
    #[error("{op}: Error opening '{}': {source}", .path.display())]
    OpenFailure {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Open mode string other than `"r"` or `"rw"`.
    #[error("invalid mode '{0}': expected \"r\" or \"rw\"")]
    InvalidMode(String),

    /// The OS refused to hand out an anonymous mapping.
    #[error("malloc: Error allocating {len} bytes: {source}")]
    AllocationFailure {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// Release requested for an address with no live entry of that kind.
    /// This is either a double release or a foreign address.
    #[error("no live mapping registered at {0:#x}")]
    RegistryMiss(usize),

    /// Flushing or unmapping a live mapping failed.
    #[error("Error releasing mapping at {addr:#x}: {source}")]
    ReleaseFailure {
        addr: usize,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn create(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CreateFailure { op, path: path.into(), source }
    }

    pub(crate) fn open(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::OpenFailure { op, path: path.into(), source }
    }
}
