// MIT License - Copyright (c) 2026 Peter Wright
// EW11 transport

pub mod link;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{KocomError, Result};

pub use link::{LinkEvent, LinkHandle};

/// TCP address of one EW11 bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A connected byte stream to a bridge.
pub trait BridgeStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BridgeStream for T {}

pub type BoxStream = Box<dyn BridgeStream>;

/// Opens streams to bridges. The session only talks to this trait, so tests
/// can hand it in-memory or loopback streams.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxStream>;
}

/// Plain TCP, the way an EW11 is reached in production.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxStream> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| KocomError::ConnectionTimeout)??;
        stream.set_nodelay(true)?;
        debug!("TCP socket connected to {}", endpoint);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new(Duration::from_millis(500));
        let result = connector.connect(&Endpoint::new("127.0.0.1", port)).await;
        assert!(matches!(
            result,
            Err(KocomError::Io(_)) | Err(KocomError::ConnectionTimeout)
        ));
    }

    #[tokio::test]
    async fn test_tcp_connector_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        let connector = TcpConnector::new(Duration::from_millis(500));
        assert!(connector.connect(&Endpoint::new("127.0.0.1", port)).await.is_ok());
        assert!(accept.await.unwrap());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.7", 8899).to_string(), "10.0.0.7:8899");
    }
}
