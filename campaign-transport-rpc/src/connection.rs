//! Connection-oriented `RemoteTransport` over the framed binary protocol of
//! [`crate::protocol`] (§4.5).
//!
//! Each open connection moves through
//! `Disconnected -> Connecting -> Probing -> Connected -> Closing -> Closed`.
//! The status-probe redirect only ever takes one hop: the original attaches
//! to a possibly load-balanced bootstrap endpoint, asks it where data
//! transfer should really happen, and reconnects once if the answer
//! differs.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

use campaign_core::{
    FileHandle, GetRequest, OpenMode, RemoteTransport, RequestHandle, TransportError,
    TransportParams,
};

use crate::protocol::{
    decode_body, encode_body, read_envelope, write_envelope, Envelope, ErrorBody,
    GetRequestBody, OpenFileRequest, OpenResponse, ReadResponse, StatusResponse,
    StatusServerRequest, TAG_ERROR, TAG_GET_REQUEST, TAG_OPEN_FILE, TAG_OPEN_RESPONSE,
    TAG_READ_RESPONSE, TAG_STATUS_RESPONSE, TAG_STATUS_SERVER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Probing,
    Connected,
    Closing,
    Closed,
}

type PendingMap = Arc<DashMap<u32, oneshot::Sender<Result<Vec<u8>, TransportError>>>>;

struct OpenConnection {
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    pending: PendingMap,
    next_correlation: AtomicU32,
    remote_file_id: u32,
    reader_task: tokio::task::JoinHandle<()>,
}

/// One `RemoteTransport` per process, holding every currently open RPC
/// connection keyed by the opaque handle returned from `open`.
#[derive(Default)]
pub struct RpcTransport {
    connections: DashMap<FileHandle, OpenConnection>,
    next_handle: AtomicU64,
}

impl RpcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connect_one(
        hostname: &str,
        port: u16,
        params: &TransportParams,
    ) -> Result<TcpStream, TransportError> {
        let connected = tokio::time::timeout(
            params.connect_timeout,
            TcpStream::connect((hostname, port)),
        )
        .await
        .map_err(|_| {
            TransportError::EndpointUnreachable(format!(
                "connect to {hostname}:{port} timed out"
            ))
        })?;
        connected.map_err(|e| TransportError::EndpointUnreachable(e.to_string()))
    }

    async fn probe(
        stream: &mut TcpStream,
        params: &TransportParams,
    ) -> Result<StatusResponse, TransportError> {
        let request = Envelope {
            tag: TAG_STATUS_SERVER,
            correlation_id: 0,
            body: encode_body(&StatusServerRequest)?,
        };
        tokio::time::timeout(params.request_timeout, write_envelope(stream, &request))
            .await
            .map_err(|_| TransportError::EndpointUnreachable("status probe write timed out".into()))??;
        let response = tokio::time::timeout(params.request_timeout, read_envelope(stream))
            .await
            .map_err(|_| TransportError::EndpointUnreachable("status probe read timed out".into()))??;
        if response.tag != TAG_STATUS_RESPONSE {
            return Err(TransportError::InvalidResponse(
                "expected StatusResponse".into(),
            ));
        }
        decode_body(&response.body)
    }

    async fn open_file(
        stream: &mut TcpStream,
        filename: &str,
        row_major: bool,
        params: &TransportParams,
    ) -> Result<u32, TransportError> {
        let request = Envelope {
            tag: TAG_OPEN_FILE,
            correlation_id: 0,
            body: encode_body(&OpenFileRequest {
                filename: filename.to_string(),
                row_major,
            })?,
        };
        tokio::time::timeout(params.request_timeout, write_envelope(stream, &request))
            .await
            .map_err(|_| TransportError::EndpointUnreachable("open request write timed out".into()))??;
        let response = tokio::time::timeout(params.request_timeout, read_envelope(stream))
            .await
            .map_err(|_| TransportError::EndpointUnreachable("open response read timed out".into()))??;
        if response.tag != TAG_OPEN_RESPONSE {
            return Err(TransportError::InvalidResponse(
                "expected OpenResponse".into(),
            ));
        }
        let decoded: OpenResponse = decode_body(&response.body)?;
        Ok(decoded.remote_file_id)
    }

    /// Dispatches frames to whichever pending `get` registered the
    /// correlation id, until the socket closes -- at which point every
    /// still-pending request fails rather than hanging forever (§5
    /// cancellation: "process-wide shutdown cancels all in-flight work by
    /// failing pending promises"; the same policy applies per-connection).
    async fn reader_loop(mut read_half: ReadHalf<TcpStream>, pending: PendingMap) {
        loop {
            match read_envelope(&mut read_half).await {
                Ok(envelope) => match envelope.tag {
                    TAG_READ_RESPONSE => {
                        if let Some((_, tx)) = pending.remove(&envelope.correlation_id) {
                            let outcome = decode_body::<ReadResponse>(&envelope.body)
                                .map(|r| r.payload);
                            let _ = tx.send(outcome);
                        }
                    }
                    TAG_ERROR => {
                        if let Some((_, tx)) = pending.remove(&envelope.correlation_id) {
                            let message = decode_body::<ErrorBody>(&envelope.body)
                                .map(|e| e.message)
                                .unwrap_or_else(|e| e.to_string());
                            let _ = tx.send(Err(TransportError::RequestFailed(message)));
                        }
                    }
                    other => {
                        tracing::warn!(tag = other, "unexpected rpc response tag");
                    }
                },
                Err(e) => {
                    tracing::debug!(error = %e, "rpc connection closed, failing pending requests");
                    let keys: Vec<u32> = pending.iter().map(|entry| *entry.key()).collect();
                    for key in keys {
                        if let Some((_, tx)) = pending.remove(&key) {
                            let _ = tx.send(Err(TransportError::ShuttingDown));
                        }
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteTransport for RpcTransport {
    async fn open(
        &self,
        hostname: &str,
        port: u16,
        filename: &str,
        _mode: OpenMode,
        params: &TransportParams,
    ) -> Result<FileHandle, TransportError> {
        let mut stream = Self::connect_one(hostname, port, params).await?;
        let status = Self::probe(&mut stream, params).await?;

        if status.advertised_host != hostname || status.advertised_port != port {
            tracing::debug!(
                from_host = hostname,
                from_port = port,
                to_host = %status.advertised_host,
                to_port = status.advertised_port,
                "rpc status server redirected to direct-contact endpoint"
            );
            drop(stream);
            stream = Self::connect_one(&status.advertised_host, status.advertised_port, params).await?;
        }

        let remote_file_id = Self::open_file(&mut stream, filename, params.row_major, params).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        let pending: PendingMap = Arc::new(DashMap::new());
        let reader_task = tokio::spawn(Self::reader_loop(read_half, pending.clone()));

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(
            handle,
            OpenConnection {
                writer: Arc::new(Mutex::new(write_half)),
                pending,
                next_correlation: AtomicU32::new(1),
                remote_file_id,
                reader_task,
            },
        );
        Ok(handle)
    }

    async fn get(&self, handle: FileHandle, request: GetRequest, dest_len: usize) -> RequestHandle {
        let (tx, rx) = oneshot::channel();

        let Some(conn) = self.connections.get(&handle) else {
            let _ = tx.send(Err(TransportError::RequestFailed(format!(
                "no open connection for handle {handle}"
            ))));
            return RequestHandle::new(rx);
        };

        let correlation_id = conn.next_correlation.fetch_add(1, Ordering::SeqCst);
        conn.pending.insert(correlation_id, tx);
        let writer = conn.writer.clone();
        let remote_file_id = conn.remote_file_id;
        drop(conn);

        let body = GetRequestBody {
            remote_file_id,
            variable_name: request.variable_name,
            step: request.step,
            step_count: request.step_count,
            block_id: request.block_id,
            count: request.count,
            start: request.start,
            accuracy_error: request.accuracy.error,
            accuracy_norm: request.accuracy.norm,
            accuracy_relative: request.accuracy.relative,
        };

        tokio::spawn(async move {
            let encoded = match encode_body(&body) {
                Ok(b) => b,
                Err(_) => return,
            };
            let envelope = Envelope {
                tag: TAG_GET_REQUEST,
                correlation_id,
                body: encoded,
            };
            let mut w = writer.lock().await;
            let _ = write_envelope(&mut *w, &envelope).await;
        });

        let _ = dest_len;
        RequestHandle::new(rx)
    }

    async fn close(&self, handle: FileHandle) -> Result<(), TransportError> {
        if let Some((_, conn)) = self.connections.remove(&handle) {
            conn.reader_task.abort();
            let mut w = conn.writer.lock().await;
            let _ = w.shutdown().await;
        }
        Ok(())
    }
}
