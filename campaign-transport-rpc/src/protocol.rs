//! Wire framing for the RPC transport (§4.5).
//!
//! Every message is a length-prefixed, `bincode`-encoded envelope: a 4-byte
//! little-endian length, then `{tag: u8, correlation_id: u32, body: Vec<u8>}`
//! where `body` is itself the `bincode` encoding of one of the structs
//! below. This mirrors the teacher's encode-then-length-prefix-then-write
//! shape for its binary packets, generalized from a fixed memcached header
//! to a small variable envelope since RPC messages here vary in shape.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use campaign_core::TransportError;

pub const TAG_OPEN_FILE: u8 = 1;
pub const TAG_STATUS_SERVER: u8 = 2;
pub const TAG_GET_REQUEST: u8 = 3;
pub const TAG_OPEN_RESPONSE: u8 = 4;
pub const TAG_STATUS_RESPONSE: u8 = 5;
pub const TAG_READ_RESPONSE: u8 = 6;
pub const TAG_ERROR: u8 = 7;

/// Outer frame: enough to route a response to the pending request that is
/// waiting on it, without needing to know the message shape until the
/// `tag` has been inspected.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub tag: u8,
    pub correlation_id: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenFileRequest {
    pub filename: String,
    pub row_major: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenResponse {
    pub remote_file_id: u32,
}

/// The bootstrap probe (§4.5): asks whatever endpoint accepted the
/// connection whether data transfer should happen here or on a
/// differently-addressed server.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusServerRequest;

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub advertised_host: String,
    pub advertised_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRequestBody {
    pub remote_file_id: u32,
    pub variable_name: String,
    pub step: u64,
    pub step_count: u64,
    pub block_id: u64,
    pub count: Vec<u64>,
    pub start: Vec<u64>,
    pub accuracy_error: f64,
    pub accuracy_norm: f64,
    pub accuracy_relative: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    bincode::serialize(value).map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

pub fn decode_body<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, TransportError> {
    bincode::deserialize(bytes).map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

pub async fn write_envelope<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    let encoded = bincode::serialize(envelope)
        .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
    writer
        .write_u32_le(encoded.len() as u32)
        .await
        .map_err(|e| TransportError::EndpointUnreachable(e.to_string()))?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| TransportError::EndpointUnreachable(e.to_string()))
}

pub async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Envelope, TransportError> {
    let len = reader
        .read_u32_le()
        .await
        .map_err(|e| TransportError::EndpointUnreachable(e.to_string()))?;
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::EndpointUnreachable(e.to_string()))?;
    bincode::deserialize(&buf).map_err(|e| TransportError::InvalidResponse(e.to_string()))
}
