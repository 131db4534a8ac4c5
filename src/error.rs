//! Error and disconnect-reason types shared across the crate.

use thiserror::Error;

use crate::tls::TlsStatus;

/// Everything that can go wrong while opening, driving, or closing a
/// connection.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection is already open or in the middle of opening.
    #[error("connection is already open")]
    AlreadyOpen,

    /// The connection is not open.
    #[error("connection is not open")]
    NotOpen,

    /// No server host has been configured.
    #[error("no server host configured")]
    NoServerConfigured,

    /// Hostname resolution failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: trust_dns_resolver::error::ResolveError,
    },

    /// Hostname resolution returned no usable addresses.
    #[error("no addresses found for {0}")]
    NoAddresses(String),

    /// Every resolved address was tried and none accepted a connection.
    #[error("all {attempts} connection attempts failed, last error: {last}")]
    ConnectFailed {
        attempts: usize,
        #[source]
        last: std::io::Error,
    },

    /// TLS setup or handshake failure.
    #[error("tls: {0}")]
    Tls(String),

    /// The certificate decision callback aborted the handshake.
    #[error("certificate check rejected: {0}")]
    CertificateRejected(TlsStatus),

    /// The server offers no digest mechanism and plaintext passwords are
    /// not allowed by the current policy.
    #[error("server offers no digest authentication and plaintext is not allowed")]
    PlaintextRefused,

    /// The open attempt was cancelled before completion was reported.
    #[error("open cancelled")]
    Cancelled,

    /// The connection went away while waiting for a reply.
    #[error("connection closed while waiting for a reply")]
    ConnectionClosed,

    /// A stanza could not be parsed into a node tree.
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),

    /// XML parse error from the stream reader.
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Transport-level I/O error.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a connection stopped being open. Passed to the disconnect handler,
/// which fires exactly once per established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local side closed the connection deliberately.
    Ok,
    /// A keepalive went unanswered for too long.
    PingTimeout,
    /// The remote side hung up or closed the stream.
    Hangup,
    /// A transport or protocol error tore the connection down.
    Error,
    /// None of the above.
    Unknown,
}
