//! The error taxonomy shared by every component in this crate.
//!
//! Each variant corresponds to one of the error kinds of the campaign
//! federated-read engine. Policy on whether an error is fatal to `Open`,
//! skips one dataset, or fails a single call lives with the caller of
//! these errors, not in the enum itself.

use std::path::PathBuf;

/// Errors raised while loading or extracting data from a campaign catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot open catalog database at {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("catalog schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("blob {name} extracted to {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("failed to decrypt blob {name}: {source}")]
    BlobDecryptionFailed {
        name: String,
        #[source]
        source: chacha20poly1305::aead::Error,
    },

    #[error("i/o error extracting blob {name} to {path}: {source}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset index {0} referenced but not present in catalog")]
    DanglingDatasetIndex(usize),
}

/// Errors raised while fetching key material from the key service.
#[derive(Debug, thiserror::Error)]
pub enum KeyServiceError {
    #[error("key service unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while materializing a remote dataset's cache directory.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cannot create cache directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write cache file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a `RemoteTransport` implementation.
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    #[error("remote endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    #[error("remote request failed: {0}")]
    RequestFailed(String),

    #[error("transport pool is shutting down")]
    ShuttingDown,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Top-level error returned by `FederatedEngine` operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    KeyService(#[from] KeyServiceError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no merged variable named {0}")]
    NameNotFound(String),

    #[error("sub-engine error: {0}")]
    SubEngine(String),

    #[error("engine is already closed")]
    Closed,
}
