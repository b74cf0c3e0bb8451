//! `KeyService` that fetches key material over the pooled HTTP transport
//! (§4.2), rather than a side channel.

use async_trait::async_trait;

use campaign_core::{
    KeyFetchResult, KeyService, KeyServiceError, TransportParams, KEY_DENIED_SENTINEL,
};

use crate::pool::HttpTransportPool;
use std::sync::Arc;

/// Fetches key material from a single fixed host by reusing the shared
/// `HttpTransportPool` -- the same connection pool and in-flight window
/// that data GETs use (§4.4), so a key fetch gets the same TLS/timeout
/// configuration and counts against the same window as a data transfer.
pub struct RemoteKeyService {
    pool: Arc<HttpTransportPool>,
    hostname: String,
    port: u16,
    params: TransportParams,
}

impl RemoteKeyService {
    /// Uses the process-wide pool from [`crate::global`].
    pub fn new(hostname: impl Into<String>, port: u16, params: TransportParams) -> Self {
        Self {
            pool: crate::global(),
            hostname: hostname.into(),
            port,
            params,
        }
    }

    /// Uses a caller-supplied pool, mainly for tests that want an isolated
    /// `HttpTransportPool` instead of the process-wide singleton.
    pub fn with_pool(
        pool: Arc<HttpTransportPool>,
        hostname: impl Into<String>,
        port: u16,
        params: TransportParams,
    ) -> Self {
        Self {
            pool,
            hostname: hostname.into(),
            port,
            params,
        }
    }
}

#[async_trait]
impl KeyService for RemoteKeyService {
    async fn fetch_key(&self, key_id: &str) -> Result<KeyFetchResult, KeyServiceError> {
        let hex = self
            .pool
            .fetch_key(&self.hostname, self.port, key_id, &self.params)
            .await
            .map_err(|e| KeyServiceError::Unavailable(e.to_string()))?;

        if hex == KEY_DENIED_SENTINEL {
            Ok(KeyFetchResult::Denied)
        } else {
            Ok(KeyFetchResult::Granted(hex))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_key_server(
        reply: &'static str,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = vec![0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                        reply.len(),
                        reply
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn granted_key_is_passed_through() {
        let (addr, _server) = spawn_key_server("deadbeef").await;
        let svc = RemoteKeyService::with_pool(
            Arc::new(HttpTransportPool::new()),
            addr.ip().to_string(),
            addr.port(),
            TransportParams::default(),
        );
        let result = svc.fetch_key("key-1").await.unwrap();
        assert_eq!(result, KeyFetchResult::Granted("deadbeef".into()));
    }

    #[tokio::test]
    async fn denied_sentinel_becomes_denied_variant() {
        let (addr, _server) = spawn_key_server("0").await;
        let svc = RemoteKeyService::with_pool(
            Arc::new(HttpTransportPool::new()),
            addr.ip().to_string(),
            addr.port(),
            TransportParams::default(),
        );
        let result = svc.fetch_key("key-1").await.unwrap();
        assert_eq!(result, KeyFetchResult::Denied);
    }

    #[tokio::test]
    async fn transport_failure_becomes_unavailable() {
        let svc = RemoteKeyService::with_pool(
            Arc::new(HttpTransportPool::new()),
            "127.0.0.1".to_string(),
            1, // nothing listens on port 1
            TransportParams::default(),
        );
        let err = svc.fetch_key("key-1").await.unwrap_err();
        assert!(matches!(err, KeyServiceError::Unavailable(_)));
    }
}
