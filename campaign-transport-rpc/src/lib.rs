//! Framed binary `RemoteTransport` implementation with status-probe
//! redirect (§4.5), the second of this workspace's two `RemoteTransport`
//! backends.

mod connection;
mod protocol;

pub use connection::RpcTransport;
