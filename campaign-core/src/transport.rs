//! The `RemoteTransport` seam (§4.4/§4.5): a pooled, concurrent,
//! promise-returning client for fetching variable slices from a remote
//! data server. `campaign-transport-http` and `campaign-transport-rpc`
//! each provide one concrete implementation of [`RemoteTransport`]; this
//! crate depends only on the trait so the federated engine never has to
//! know which wire protocol a given dataset uses.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::TransportError;

/// Whether the remote file should be opened for sequential streaming reads
/// or for random access to arbitrary blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadRandomAccess,
}

/// `{AccuracyError, AccuracyNorm, AccuracyRelative}` (§4.4/§6), carried
/// uniformly by both transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AccuracyRequirement {
    pub error: f64,
    pub norm: f64,
    pub relative: bool,
}

/// Connection-level parameters a transport needs at `open` time. Fields
/// that apply only to the HTTP variant (TLS, timeouts) are `None`/defaulted
/// when unused by an RPC transport, rather than split into two parameter
/// types, since both transports are configured from the same `[hostoptions]`
/// block (§6).
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub row_major: bool,
    pub use_https: bool,
    pub ca_path: Option<String>,
    pub verify_ssl: bool,
    pub connect_timeout: std::time::Duration,
    pub request_timeout: std::time::Duration,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            row_major: false,
            use_https: false,
            ca_path: None,
            verify_ssl: true,
            // "Defaults must be conservative (tens of seconds)" (§4.4).
            connect_timeout: std::time::Duration::from_secs(30),
            request_timeout: std::time::Duration::from_secs(60),
        }
    }
}

/// One variable-slice read request (§3 `RemoteRequest`), everything a
/// transport needs to encode the wire request except the destination
/// buffer and file handle, which are passed alongside it.
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub variable_name: String,
    pub step: u64,
    pub step_count: u64,
    pub block_id: u64,
    pub count: Vec<u64>,
    pub start: Vec<u64>,
    pub accuracy: AccuracyRequirement,
}

/// An opaque per-connection handle returned by [`RemoteTransport::open`].
/// Both transports represent their real connection/file state internally
/// and expose only this integer outward, so `RemoteTransport` stays
/// object-safe (`Arc<dyn RemoteTransport>`).
pub type FileHandle = u64;

/// The caller-visible half of a submitted request's promise (§3
/// `PooledTransfer`). Consuming it with [`RequestHandle::wait`] is the
/// single release point: the handle cannot be waited on twice.
pub struct RequestHandle {
    rx: oneshot::Receiver<Result<Vec<u8>, TransportError>>,
}

impl RequestHandle {
    pub fn new(rx: oneshot::Receiver<Result<Vec<u8>, TransportError>>) -> Self {
        Self { rx }
    }

    /// Blocks until the pool worker fulfils the promise, then returns the
    /// response payload. A dropped sender (pool shut down mid-flight) is
    /// surfaced as [`TransportError::ShuttingDown`], never a panic (§4.4
    /// shutdown: "pending promises must be fulfilled with failure").
    pub async fn wait(self) -> Result<Vec<u8>, TransportError> {
        self.rx
            .await
            .unwrap_or(Err(TransportError::ShuttingDown))
    }
}

/// A pooled, concurrent, promise-returning remote data client (§4.4/§4.5).
///
/// `open` suspends until the remote file/connection handle is ready;
/// `get` never suspends -- it enqueues the request and returns immediately
/// with a [`RequestHandle`] the caller awaits later (directly for a Sync
/// get, or batched via `PerformGets` for a Deferred one).
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn open(
        &self,
        hostname: &str,
        port: u16,
        filename: &str,
        mode: OpenMode,
        params: &TransportParams,
    ) -> Result<FileHandle, TransportError>;

    async fn get(&self, handle: FileHandle, request: GetRequest, dest_len: usize) -> RequestHandle;

    /// Releases a file handle opened with `open`. Transports that hold no
    /// per-file state (e.g. a stateless HTTP client) may implement this as
    /// a no-op.
    async fn close(&self, handle: FileHandle) -> Result<(), TransportError>;
}
