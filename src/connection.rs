//! The connection engine: opening, driving, and closing an XMPP session.
//!
//! [`Connection`] is a cheap cloneable handle. Opening spawns a driver task
//! that owns the socket: it writes outgoing bytes on command, feeds
//! incoming bytes through the stanza reader, and drains the parsed queue
//! one stanza per loop pass so a burst arriving in a single read cannot
//! monopolize the task. Replies awaited by id are routed to their waiter
//! directly and never reach the handler registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::auth::{self, AuthPolicy};
use crate::error::{DisconnectReason, Error};
use crate::handler::{HandlerPriority, HandlerRegistry, StanzaHandler};
use crate::proxy::ProxyConfig;
use crate::queue::StanzaQueue;
use crate::resolver::{ConnectAttempt, TunnelTarget};
use crate::stanza::{Stanza, StanzaKind, StanzaReader, StreamItem};
use crate::tls::{TlsConfig, TlsEngine};

/// Standard XMPP client port.
pub const DEFAULT_PORT: u16 = 5222;

const READ_BUFFER_SIZE: usize = 8192;
/// Incoming bytes that never frame into a stanza cap out here.
const MAX_STANZA_BUFFER: usize = 1024 * 1024;

/// Lifecycle of a connection. States only move forward until a close or
/// error resets to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

enum DriverCommand {
    Send(Vec<u8>, oneshot::Sender<std::io::Result<()>>),
    Close(oneshot::Sender<()>),
}

type DisconnectHandler = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

struct StateData {
    server: Option<String>,
    port: u16,
    proxy: Option<ProxyConfig>,
    tls: Option<TlsConfig>,
    auth_policy: AuthPolicy,
    state: ConnectionState,
    stream_id: Option<String>,
    peer_fingerprint: Option<[u8; 32]>,
    disconnect: Option<DisconnectHandler>,
    commands: Option<mpsc::UnboundedSender<DriverCommand>>,
}

struct Shared {
    state: Mutex<StateData>,
    registry: Mutex<HandlerRegistry>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Stanza>>>,
    cancel_open: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn generate_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

fn stream_header(server: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='UTF-8'?>\
         <stream:stream to='{server}' xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams'>"
    )
}

fn ensure_id(stanza: &mut Stanza) -> String {
    match stanza.id() {
        Some(id) => id.to_string(),
        None => {
            let id = generate_id();
            stanza.set_attribute("id", id.clone());
            id
        }
    }
}

/// Serializes a stanza for the wire, refusing to let a stray stream
/// terminator ride along at the end.
fn prepare_outgoing(stanza: &Stanza) -> String {
    let mut xml = stanza.to_xml();
    if let Some(stripped) = xml.strip_suffix("</stream:stream>") {
        let keep = stripped.len();
        xml.truncate(keep);
    }
    xml
}

/// Handle to one client connection. Clones share the same underlying
/// session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(server: impl Into<String>) -> Self {
        Self::build(Some(server.into()))
    }

    /// A connection with no server configured yet; set one before opening.
    pub fn unconfigured() -> Self {
        Self::build(None)
    }

    fn build(server: Option<String>) -> Self {
        Connection {
            shared: Arc::new(Shared {
                state: Mutex::new(StateData {
                    server,
                    port: DEFAULT_PORT,
                    proxy: None,
                    tls: None,
                    auth_policy: AuthPolicy::default(),
                    state: ConnectionState::Disconnected,
                    stream_id: None,
                    peer_fingerprint: None,
                    disconnect: None,
                    commands: None,
                }),
                registry: Mutex::new(HandlerRegistry::new()),
                waiters: Mutex::new(HashMap::new()),
                cancel_open: AtomicBool::new(false),
            }),
        }
    }

    fn guard_closed(&self) -> Result<MutexGuard<'_, StateData>, Error> {
        let st = lock(&self.shared.state);
        if st.state != ConnectionState::Disconnected {
            return Err(Error::AlreadyOpen);
        }
        Ok(st)
    }

    pub fn server(&self) -> Option<String> {
        lock(&self.shared.state).server.clone()
    }

    pub fn set_server(&self, server: impl Into<String>) -> Result<(), Error> {
        self.guard_closed()?.server = Some(server.into());
        Ok(())
    }

    pub fn port(&self) -> u16 {
        lock(&self.shared.state).port
    }

    pub fn set_port(&self, port: u16) -> Result<(), Error> {
        self.guard_closed()?.port = port;
        Ok(())
    }

    pub fn proxy(&self) -> Option<ProxyConfig> {
        lock(&self.shared.state).proxy.clone()
    }

    pub fn set_proxy(&self, proxy: Option<ProxyConfig>) -> Result<(), Error> {
        self.guard_closed()?.proxy = proxy;
        Ok(())
    }

    pub fn set_tls(&self, tls: Option<TlsConfig>) -> Result<(), Error> {
        self.guard_closed()?.tls = tls;
        Ok(())
    }

    pub fn set_auth_policy(&self, policy: AuthPolicy) -> Result<(), Error> {
        self.guard_closed()?.auth_policy = policy;
        Ok(())
    }

    /// Installs the handler fired exactly once when an established
    /// connection goes away, with the reason it went away.
    pub fn set_disconnect_handler(
        &self,
        handler: impl Fn(DisconnectReason) + Send + Sync + 'static,
    ) {
        lock(&self.shared.state).disconnect = Some(Arc::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.state).state
    }

    /// Open means the stream is established; authenticating and
    /// authenticated connections are open too.
    pub fn is_open(&self) -> bool {
        self.state() >= ConnectionState::Connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// The stream id the server assigned in its stream header.
    pub fn stream_id(&self) -> Option<String> {
        lock(&self.shared.state).stream_id.clone()
    }

    /// SHA-256 fingerprint of the certificate presented during the last
    /// TLS handshake, if there was one.
    pub fn peer_fingerprint(&self) -> Option<[u8; 32]> {
        lock(&self.shared.state).peer_fingerprint
    }

    /// Registers a persistent handler for a stanza kind.
    pub fn register_handler(
        &self,
        kind: StanzaKind,
        priority: HandlerPriority,
        handler: Arc<dyn StanzaHandler>,
    ) {
        lock(&self.shared.registry).register(kind, priority, handler);
    }

    pub fn unregister_handler(&self, kind: StanzaKind, handler: &Arc<dyn StanzaHandler>) {
        lock(&self.shared.registry).unregister(kind, handler);
    }

    /// Resolves, connects, negotiates TLS when configured, and waits for
    /// the server's stream header. On any failure the connection is back
    /// in `Disconnected` and no disconnect handler fires.
    pub async fn open(&self) -> Result<(), Error> {
        let (server, port, proxy, tls) = {
            let mut st = lock(&self.shared.state);
            if st.state != ConnectionState::Disconnected {
                return Err(Error::AlreadyOpen);
            }
            let Some(server) = st.server.clone() else {
                return Err(Error::NoServerConfigured);
            };
            st.state = ConnectionState::Connecting;
            st.stream_id = None;
            st.peer_fingerprint = None;
            (server, st.port, st.proxy.clone(), st.tls.clone())
        };
        self.shared.cancel_open.store(false, Ordering::SeqCst);

        match self.open_inner(&server, port, proxy, tls).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut st = lock(&self.shared.state);
                st.state = ConnectionState::Disconnected;
                st.commands = None;
                Err(e)
            }
        }
    }

    async fn open_inner(
        &self,
        server: &str,
        port: u16,
        proxy: Option<ProxyConfig>,
        tls: Option<TlsConfig>,
    ) -> Result<(), Error> {
        let stream = match &proxy {
            Some(proxy) => {
                info!(proxy = %proxy.server, proxy_port = proxy.port, %server, %port,
                    "connecting through proxy");
                let attempt = ConnectAttempt::resolve(&proxy.server, proxy.port).await?;
                attempt
                    .establish(Some(TunnelTarget {
                        negotiator: proxy.negotiator.as_ref(),
                        host: server,
                        port,
                    }))
                    .await?
            }
            None => {
                let attempt = ConnectAttempt::resolve(server, port).await?;
                attempt.establish(None).await?
            }
        };

        let mut transport: Box<dyn Transport> = match &tls {
            Some(tls_config) => {
                let engine = TlsEngine::new(tls_config)?;
                let result = engine.handshake(stream, server).await;
                if let Some(fp) = engine.peer_fingerprint() {
                    lock(&self.shared.state).peer_fingerprint = Some(fp);
                }
                Box::new(result?)
            }
            None => Box::new(stream),
        };

        // A cancel that raced the transport setup wins here, before
        // anything is sent and before success is reported.
        if self.shared.cancel_open.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        transport.write_all(stream_header(server).as_bytes()).await?;
        transport.flush().await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = oneshot::channel();
        lock(&self.shared.state).commands = Some(cmd_tx);

        let (read_half, write_half) = tokio::io::split(transport);
        let driver = Driver {
            shared: Arc::downgrade(&self.shared),
            read_half,
            write_half,
            commands: cmd_rx,
            reader: StanzaReader::new(),
            queue: StanzaQueue::new(),
            open_tx: Some(open_tx),
            close_ack: None,
            established: false,
        };
        tokio::spawn(driver.run());

        match open_rx.await {
            Ok(()) => Ok(()),
            Err(_) => {
                if self.shared.cancel_open.load(Ordering::SeqCst) {
                    Err(Error::Cancelled)
                } else {
                    Err(Error::ConnectionClosed)
                }
            }
        }
    }

    /// Flags an in-flight open attempt as cancelled. The attempt aborts
    /// right before it would have reported success; an attempt already in
    /// the middle of its transport setup still runs to that point.
    pub fn cancel_open(&self) {
        self.shared.cancel_open.store(true, Ordering::SeqCst);
    }

    /// Sends a serialized stanza.
    pub async fn send(&self, stanza: &Stanza) -> Result<(), Error> {
        self.send_raw(&prepare_outgoing(stanza)).await
    }

    /// Sends bytes as-is, for callers that manage their own XML.
    pub async fn send_raw(&self, data: &str) -> Result<(), Error> {
        let tx = {
            let st = lock(&self.shared.state);
            if st.state < ConnectionState::Connected {
                return Err(Error::NotOpen);
            }
            st.commands.clone().ok_or(Error::NotOpen)?
        };
        debug!(data = %data, "sending");

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(DriverCommand::Send(data.as_bytes().to_vec(), ack_tx))
            .map_err(|_| Error::ConnectionClosed)?;
        match ack_rx.await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Sends a stanza and registers a one-shot handler for the reply
    /// carrying the same id. An id is generated when the stanza has none.
    pub async fn send_with_reply(
        &self,
        stanza: &mut Stanza,
        handler: Arc<dyn StanzaHandler>,
    ) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        let id = ensure_id(stanza);
        lock(&self.shared.registry).register_reply(id.clone(), handler);
        match self.send(stanza).await {
            Ok(()) => Ok(()),
            Err(e) => {
                lock(&self.shared.registry).cancel_reply(&id);
                Err(e)
            }
        }
    }

    /// Sends a stanza and waits for the reply with the matching id. Other
    /// stanzas arriving in the meantime go through ordinary dispatch; the
    /// reply itself bypasses all handlers.
    pub async fn send_recv(&self, mut stanza: Stanza) -> Result<Stanza, Error> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        let id = ensure_id(&mut stanza);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.waiters).insert(id.clone(), tx);
        if let Err(e) = self.send(&stanza).await {
            lock(&self.shared.waiters).remove(&id);
            return Err(e);
        }
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Runs legacy jabber:iq:auth. Returns whether the server accepted the
    /// credentials; transport or policy failures surface as errors. On
    /// rejection or error the connection stays open and falls back to
    /// `Connected`.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        resource: &str,
    ) -> Result<bool, Error> {
        let policy = {
            let mut st = lock(&self.shared.state);
            if st.state < ConnectionState::Connected {
                return Err(Error::NotOpen);
            }
            st.state = ConnectionState::Authenticating;
            st.auth_policy
        };

        let outcome = self
            .authenticate_inner(username, password, resource, policy)
            .await;

        let mut st = lock(&self.shared.state);
        if st.state == ConnectionState::Authenticating {
            st.state = match outcome {
                Ok(true) => ConnectionState::Authenticated,
                _ => ConnectionState::Connected,
            };
        }
        outcome
    }

    async fn authenticate_inner(
        &self,
        username: &str,
        password: &str,
        resource: &str,
        policy: AuthPolicy,
    ) -> Result<bool, Error> {
        debug!(%username, "starting legacy auth");
        let reply = self.send_recv(auth::discovery_request(username)).await?;
        if reply.attribute("type") == Some("error") {
            warn!(%username, "auth field discovery rejected");
            return Ok(false);
        }

        let mechanisms = auth::mechanisms_from_reply(&reply);
        let stream_id = self.stream_id().unwrap_or_default();
        let request =
            auth::auth_request(&stream_id, username, password, resource, mechanisms, policy)?;

        let reply = self.send_recv(request).await?;
        let accepted = reply.attribute("type") == Some("result");
        if accepted {
            info!(%username, "authenticated");
        } else {
            warn!(%username, "authentication rejected");
        }
        Ok(accepted)
    }

    /// Sends the stream terminator and tears the connection down. The
    /// disconnect handler fires with [`DisconnectReason::Ok`] before this
    /// returns.
    pub async fn close(&self) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        // Best effort: the peer may already be gone.
        let _ = self.send_raw("</stream:stream>").await;

        let tx = lock(&self.shared.state).commands.clone();
        if let Some(tx) = tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(DriverCommand::Close(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.shared.state);
        f.debug_struct("Connection")
            .field("server", &st.server)
            .field("port", &st.port)
            .field("state", &st.state)
            .finish_non_exhaustive()
    }
}

enum Ingest {
    Continue,
    StreamClosed,
    Cancelled,
}

/// Task that owns the socket for the lifetime of one session.
struct Driver {
    shared: Weak<Shared>,
    read_half: ReadHalf<Box<dyn Transport>>,
    write_half: WriteHalf<Box<dyn Transport>>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    reader: StanzaReader,
    queue: StanzaQueue,
    open_tx: Option<oneshot::Sender<()>>,
    close_ack: Option<oneshot::Sender<()>>,
    established: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        let reason: Option<DisconnectReason> = loop {
            // Dispatch one queued stanza per pass so a large read burst
            // still interleaves with writes and fresh reads.
            if let Some(stanza) = self.queue.pop_head() {
                self.dispatch(stanza);
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(DriverCommand::Send(bytes, ack)) => {
                        let result = self.write(&bytes).await;
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            break Some(DisconnectReason::Error);
                        }
                    }
                    Some(DriverCommand::Close(ack)) => {
                        let _ = self.write_half.shutdown().await;
                        self.close_ack = Some(ack);
                        break Some(DisconnectReason::Ok);
                    }
                    // Every handle is gone; nobody is left to notify.
                    None => break None,
                },
                read = self.read_half.read(&mut buf) => match read {
                    Ok(0) => break Some(DisconnectReason::Hangup),
                    Ok(n) => {
                        self.reader.push_bytes(&buf[..n]);
                        match self.ingest() {
                            Ok(Ingest::Continue) => {}
                            Ok(Ingest::StreamClosed) => break Some(DisconnectReason::Hangup),
                            Ok(Ingest::Cancelled) => break None,
                            Err(e) => {
                                warn!(error = %e, "failed to parse incoming stream");
                                break Some(DisconnectReason::Error);
                            }
                        }
                        if self.reader.buffered_len() > MAX_STANZA_BUFFER {
                            warn!(buffered = self.reader.buffered_len(),
                                "incoming buffer limit exceeded");
                            break Some(DisconnectReason::Error);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "read failed");
                        break Some(DisconnectReason::Error);
                    }
                },
            }
        };

        self.teardown(reason);
    }

    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_half.write_all(bytes).await?;
        self.write_half.flush().await
    }

    fn ingest(&mut self) -> Result<Ingest, Error> {
        while let Some(item) = self.reader.next_item()? {
            match item {
                StreamItem::StreamOpen(header) => {
                    if !self.on_stream_open(header) {
                        return Ok(Ingest::Cancelled);
                    }
                }
                StreamItem::StreamClose => return Ok(Ingest::StreamClosed),
                StreamItem::Stanza(stanza) => self.queue.push_tail(stanza),
            }
        }
        Ok(Ingest::Continue)
    }

    fn on_stream_open(&mut self, header: Stanza) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        if shared.cancel_open.load(Ordering::SeqCst) {
            debug!("open cancelled after stream header, dropping connection");
            return false;
        }

        let id = header.attribute("id").map(str::to_owned);
        {
            let mut st = lock(&shared.state);
            st.state = ConnectionState::Connected;
            st.stream_id = id.clone();
        }
        info!(stream_id = id.as_deref().unwrap_or(""), "stream established");
        self.established = true;
        if let Some(tx) = self.open_tx.take() {
            let _ = tx.send(());
        }
        true
    }

    fn dispatch(&self, stanza: Stanza) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        if let Some(id) = stanza.id().map(str::to_owned) {
            let waiter = lock(&shared.waiters).remove(&id);
            if let Some(tx) = waiter {
                match tx.send(stanza) {
                    Ok(()) => return,
                    // The waiter gave up; hand the stanza to ordinary
                    // dispatch instead of dropping it.
                    Err(stanza) => {
                        let plan = lock(&shared.registry).route(&stanza);
                        plan.run(&stanza);
                        return;
                    }
                }
            }
        }

        let plan = lock(&shared.registry).route(&stanza);
        plan.run(&stanza);
    }

    fn teardown(&mut self, reason: Option<DisconnectReason>) {
        if let Some(shared) = self.shared.upgrade() {
            let callback = {
                let mut st = lock(&shared.state);
                st.state = ConnectionState::Disconnected;
                st.commands = None;
                st.disconnect.clone()
            };
            // Pending waiters learn the connection is gone by their
            // sender dropping here.
            lock(&shared.waiters).clear();

            if self.established {
                if let (Some(reason), Some(cb)) = (reason, callback) {
                    debug!(?reason, "connection closed");
                    cb(reason);
                }
            }
        }

        if let Some(ack) = self.close_ack.take() {
            let _ = ack.send(());
        }
    }
}
