//! Asynchronous client engine for the XMPP wire protocol.
//!
//! jabberwire handles the plumbing of a Jabber session: resolving and
//! connecting with address fallback, optional proxy tunneling, TLS with
//! application-controlled certificate decisions, the `<stream:stream>`
//! handshake, legacy jabber:iq:auth authentication, and priority-ordered
//! stanza dispatch. Higher protocol layers (rosters, presence logic, SASL)
//! live elsewhere.
//!
//! ```no_run
//! use std::sync::Arc;
//! use jabberwire::{Connection, HandlerControl, HandlerPriority, Stanza, StanzaKind};
//!
//! # async fn run() -> Result<(), jabberwire::Error> {
//! let conn = Connection::new("example.com");
//! conn.register_handler(
//!     StanzaKind::Message,
//!     HandlerPriority::Normal,
//!     Arc::new(|stanza: &Stanza| {
//!         println!("message: {}", stanza.to_xml());
//!         HandlerControl::Consume
//!     }),
//! );
//! conn.open().await?;
//! if conn.authenticate("user", "password", "jabberwire").await? {
//!     conn.send(&Stanza::new("presence")).await?;
//! }
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod connection;
pub mod error;
pub mod handler;
pub mod proxy;
pub mod queue;
pub mod resolver;
pub mod stanza;
pub mod tls;

pub use auth::AuthPolicy;
pub use connection::{Connection, ConnectionState, DEFAULT_PORT};
pub use error::{DisconnectReason, Error};
pub use handler::{HandlerControl, HandlerPriority, StanzaHandler};
pub use proxy::{HttpConnectProxy, ProxyConfig, ProxyNegotiator};
pub use stanza::{Stanza, StanzaKind};
pub use tls::{TlsConfig, TlsDecision, TlsStatus};
