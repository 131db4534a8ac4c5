//! Proxy tunnel negotiation.
//!
//! When a proxy is configured, the TCP connection goes to the proxy and the
//! negotiator turns the fresh socket into a tunnel to the real server
//! before any XMPP bytes flow. The trait keeps the connect sequencer
//! agnostic of the proxy protocol.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Turns a raw socket to the proxy into a tunnel to `host:port`.
#[async_trait]
pub trait ProxyNegotiator: Send + Sync {
    async fn negotiate(&self, stream: &mut TcpStream, host: &str, port: u16) -> io::Result<()>;
}

/// Where the proxy lives and how to talk to it.
#[derive(Clone)]
pub struct ProxyConfig {
    pub server: String,
    pub port: u16,
    pub negotiator: Arc<dyn ProxyNegotiator>,
}

impl ProxyConfig {
    /// An HTTP CONNECT proxy at `server:port`.
    pub fn http_connect(server: impl Into<String>, port: u16) -> Self {
        ProxyConfig {
            server: server.into(),
            port,
            negotiator: Arc::new(HttpConnectProxy),
        }
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Plain HTTP CONNECT tunneling.
#[derive(Debug, Default)]
pub struct HttpConnectProxy;

#[async_trait]
impl ProxyNegotiator for HttpConnectProxy {
    async fn negotiate(&self, stream: &mut TcpStream, host: &str, port: u16) -> io::Result<()> {
        let request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await?;

        // Read until the end of the response headers.
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed the connection during negotiation",
                ));
            }
            response.push(byte[0]);
            if response.ends_with(b"\r\n\r\n") {
                break;
            }
            if response.len() > 8192 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized proxy response",
                ));
            }
        }

        let status_line = String::from_utf8_lossy(&response);
        let status_line = status_line.lines().next().unwrap_or_default();
        debug!(%status_line, "proxy responded");

        // "HTTP/1.1 200 Connection established" or similar.
        let ok = status_line
            .split_whitespace()
            .nth(1)
            .map(|code| code == "200")
            .unwrap_or(false);
        if !ok {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy refused tunnel: {status_line}"),
            ));
        }
        Ok(())
    }
}
