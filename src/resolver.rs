//! Hostname resolution and the candidate-address connect sequence.
//!
//! A host resolves to a list of addresses (A and AAAA); the connect
//! sequencer walks that list in order, applying a per-candidate timeout and
//! moving to the next address on refusal, timeout, or a failed proxy
//! negotiation. Only after the last candidate fails does the whole attempt
//! fail, carrying the last underlying error.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::Error;
use crate::proxy::ProxyNegotiator;

/// Upper bound for a single TCP connect to one candidate address.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Resolves a hostname to its addresses. IP literals short-circuit without
/// touching DNS.
pub async fn resolve_host(host: &str) -> Result<Vec<IpAddr>, Error> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            debug!(error = %e, "system resolver config unavailable, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            source,
        })?;

    let addrs: Vec<IpAddr> = lookup.iter().collect();
    if addrs.is_empty() {
        return Err(Error::NoAddresses(host.to_string()));
    }
    Ok(addrs)
}

/// Destination a proxy should tunnel to.
pub(crate) struct TunnelTarget<'a> {
    pub negotiator: &'a dyn ProxyNegotiator,
    pub host: &'a str,
    pub port: u16,
}

/// One resolved connect attempt: the ordered candidate addresses for a
/// single call to open.
#[derive(Debug)]
pub struct ConnectAttempt {
    candidates: Vec<SocketAddr>,
}

impl ConnectAttempt {
    /// Resolves `host` and pairs every address with `port`.
    pub async fn resolve(host: &str, port: u16) -> Result<Self, Error> {
        let addrs = resolve_host(host).await?;
        Ok(ConnectAttempt {
            candidates: addrs
                .into_iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect(),
        })
    }

    pub fn from_candidates(candidates: Vec<SocketAddr>) -> Self {
        ConnectAttempt { candidates }
    }

    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    /// Tries each candidate in order until one yields a usable stream.
    /// When a tunnel target is given, proxy negotiation runs on the fresh
    /// stream and a negotiation failure counts like a refused connect.
    pub(crate) async fn establish(
        self,
        tunnel: Option<TunnelTarget<'_>>,
    ) -> Result<TcpStream, Error> {
        let attempts = self.candidates.len();
        let mut last = io::Error::new(io::ErrorKind::NotFound, "no candidate addresses");

        for addr in self.candidates {
            debug!(%addr, "connecting");
            let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(%addr, error = %e, "connect failed, trying next address");
                    last = e;
                    continue;
                }
                Err(_) => {
                    warn!(%addr, "connect timed out, trying next address");
                    last = io::Error::new(io::ErrorKind::TimedOut, "connection attempt timed out");
                    continue;
                }
            };

            if let Some(tunnel) = &tunnel {
                match tunnel
                    .negotiator
                    .negotiate(&mut stream, tunnel.host, tunnel.port)
                    .await
                {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(%addr, error = %e, "proxy negotiation failed, trying next address");
                        last = e;
                        continue;
                    }
                }
            }

            debug!(%addr, "connected");
            return Ok(stream);
        }

        Err(Error::ConnectFailed { attempts, last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn dead_addr() -> SocketAddr {
        // Bind and immediately drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_ip_literal_skips_dns() {
        let addrs = resolve_host("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let addrs = resolve_host("::1").await.unwrap();
        assert_eq!(addrs, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_fallback_reaches_the_live_candidate() {
        let dead1 = dead_addr().await;
        let dead2 = dead_addr().await;
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();

        let accept = tokio::spawn(async move { live.accept().await.unwrap() });

        let attempt = ConnectAttempt::from_candidates(vec![dead1, dead2, live_addr]);
        let stream = attempt.establish(None).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), live_addr);
        accept.await.unwrap();
    }

    /// Fails negotiation on the first call, succeeds afterwards.
    struct SecondTryNegotiator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProxyNegotiator for SecondTryNegotiator {
        async fn negotiate(
            &self,
            _stream: &mut TcpStream,
            _host: &str,
            _port: u16,
        ) -> io::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "negotiation rejected",
                ));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_negotiation_advances_to_next_candidate() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let candidates = vec![first.local_addr().unwrap(), second.local_addr().unwrap()];
        let second_addr = second.local_addr().unwrap();
        tokio::spawn(async move { first.accept().await });
        tokio::spawn(async move { second.accept().await });

        let negotiator = SecondTryNegotiator {
            calls: AtomicUsize::new(0),
        };
        let attempt = ConnectAttempt::from_candidates(candidates);
        let stream = attempt
            .establish(Some(TunnelTarget {
                negotiator: &negotiator,
                host: "example.com",
                port: 5222,
            }))
            .await
            .unwrap();

        // Both candidates accepted the TCP connect; only the second
        // survived negotiation.
        assert_eq!(stream.peer_addr().unwrap(), second_addr);
        assert_eq!(negotiator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_candidates_fail_with_last_error() {
        let dead1 = dead_addr().await;
        let dead2 = dead_addr().await;

        let attempt = ConnectAttempt::from_candidates(vec![dead1, dead2]);
        match attempt.establish(None).await {
            Err(Error::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected ConnectFailed, got {:?}", other.map(|_| ())),
        }
    }
}
