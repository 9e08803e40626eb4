//! Methods to accept incoming WebSocket connections on a server.
//!
//! A [`WebSocketServer`] owns a non-empty set of [`Listener`]s. Its
//! [`run`](WebSocketServer::run) loop spawns one acceptor task per listener;
//! every accepted stream gets a handler task that performs the server
//! handshake, builds a [`Request`] and hands it to the user handler.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use log::*;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::WebSocketConnection;
use crate::error::{Error, Result};
use crate::handshake::server::{read_request, reject_response, IncomingRequest};
use crate::protocol::Role;
use crate::stream::ByteStream;
use crate::tls::Acceptor;

/// Rendering of a bound TCP-like listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenPort {
    addr: IpAddr,
    port: u16,
    tls: bool,
}

impl ListenPort {
    /// Describe a listener bound to `addr:port`.
    pub fn new(addr: IpAddr, port: u16, tls: bool) -> Self {
        ListenPort { addr, port, tls }
    }

    /// The bound address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the listener terminates TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }
}

impl fmt::Display for ListenPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = if self.tls { "wss" } else { "ws" };
        match self.addr {
            IpAddr::V4(addr) => write!(f, "{scheme}://{addr}:{}", self.port),
            IpAddr::V6(addr) => write!(f, "{scheme}://[{addr}]:{}", self.port),
        }
    }
}

/// What a listener reports about itself for diagnostics.
#[derive(Debug, Clone)]
pub enum ListenerInfo {
    /// A TCP-like listener, by address and port.
    Tcp(ListenPort),
    /// Any other listener, by its debug rendering.
    Other(String),
}

impl fmt::Display for ListenerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ListenerInfo::Tcp(port) => port.fmt(f),
            ListenerInfo::Other(repr) => f.write_str(repr),
        }
    }
}

/// An object that accepts byte streams.
///
/// Broad enough to cover kernel sockets and in-process pipes; tests use an
/// in-memory implementation.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next incoming stream.
    async fn accept(&self) -> Result<Box<dyn ByteStream>>;

    /// Stop accepting. Pending and later `accept` calls may fail.
    async fn close(&self);

    /// Metadata for diagnostics; TCP-like listeners report a [`ListenPort`].
    fn info(&self) -> ListenerInfo;
}

/// A TCP listener, optionally terminating TLS on accepted connections.
#[allow(missing_debug_implementations)]
pub struct TcpListener {
    inner: tokio::sync::Mutex<Option<tokio::net::TcpListener>>,
    local: ListenPort,
    acceptor: Acceptor,
}

impl TcpListener {
    /// Bind a plain listener on `addr`. Port 0 picks a free port.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        Self::bind_with(addr, Acceptor::Plain).await
    }

    /// Bind on `addr`, upgrading accepted connections through `acceptor`.
    pub async fn bind_with(
        addr: impl tokio::net::ToSocketAddrs,
        acceptor: Acceptor,
    ) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        let local = inner.local_addr()?;
        debug!("listening on {local}");
        Ok(TcpListener {
            local: ListenPort::new(local.ip(), local.port(), acceptor.is_tls()),
            inner: tokio::sync::Mutex::new(Some(inner)),
            acceptor,
        })
    }

    /// Where this listener is bound.
    pub fn local_addr(&self) -> ListenPort {
        self.local
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Box<dyn ByteStream>> {
        let stream = {
            let guard = self.inner.lock().await;
            let listener = guard.as_ref().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "listener closed")
            })?;
            let (stream, peer) = listener.accept().await?;
            trace!("{}: accepted connection from {peer}", self.local);
            stream
        };
        stream.set_nodelay(true)?;
        self.acceptor.accept(Box::new(stream)).await
    }

    async fn close(&self) {
        self.inner.lock().await.take();
    }

    fn info(&self) -> ListenerInfo {
        ListenerInfo::Tcp(self.local)
    }
}

enum Outcome {
    Pending,
    Accepted(WebSocketConnection),
    Rejected,
}

/// Where the accept pipeline and the [`Request`] meet: the stream waits here
/// until the handler decides, and the pipeline learns what the decision was.
struct NegotiationSlot {
    stream: Option<Box<dyn ByteStream>>,
    outcome: Outcome,
}

type SharedSlot = Arc<StdMutex<NegotiationSlot>>;

/// A one-shot negotiation object delivered to server handlers.
///
/// Inspect the proposed parameters, optionally pick a subprotocol, then call
/// [`accept`](Request::accept) or [`reject`](Request::reject) — each consumes
/// the request, so exactly one of them can ever run. A request dropped
/// without either makes the accept pipeline answer 500 and hang up.
#[allow(missing_debug_implementations)]
pub struct Request {
    incoming: IncomingRequest,
    subprotocol: Option<String>,
    scope: TaskTracker,
    slot: SharedSlot,
}

impl Request {
    fn new(scope: TaskTracker, incoming: IncomingRequest, stream: Box<dyn ByteStream>) -> (Self, SharedSlot) {
        let slot = Arc::new(StdMutex::new(NegotiationSlot {
            stream: Some(stream),
            outcome: Outcome::Pending,
        }));
        (Request { incoming, subprotocol: None, scope, slot: slot.clone() }, slot)
    }

    /// The subprotocols the client proposed, in offer order. Possibly empty.
    pub fn proposed_subprotocols(&self) -> &[String] {
        &self.incoming.subprotocols
    }

    /// The subprotocol [`accept`](Request::accept) will answer with. Unset
    /// until chosen.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Choose the subprotocol for the response; it must be one of the
    /// proposed ones. `None` unsets the choice.
    pub fn set_subprotocol(&mut self, subprotocol: Option<&str>) -> Result<()> {
        match subprotocol {
            Some(chosen) if !self.incoming.subprotocols.iter().any(|p| p == chosen) => {
                Err(Error::UnknownSubprotocol(chosen.to_owned()))
            }
            _ => {
                self.subprotocol = subprotocol.map(str::to_owned);
                Ok(())
            }
        }
    }

    /// The request target, query string preserved verbatim.
    pub fn path(&self) -> &str {
        &self.incoming.path
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.incoming.headers
    }

    /// Send the 101 response and return the open connection.
    pub async fn accept(self) -> Result<WebSocketConnection> {
        let mut stream = self.take_stream();
        let response = self.incoming.accept_response(self.subprotocol.as_deref());
        if let Err(err) = async {
            stream.write_all(&response).await?;
            stream.flush().await
        }
        .await
        {
            self.settle(Outcome::Rejected);
            return Err(err.into());
        }

        let connection = WebSocketConnection::spawn(
            &self.scope,
            stream,
            Role::Server,
            self.incoming.path.clone(),
            self.subprotocol.clone(),
            Vec::new(),
        );
        self.settle(Outcome::Accepted(connection.clone()));
        Ok(connection)
    }

    /// Refuse the upgrade with an ordinary HTTP response and hang up.
    pub async fn reject(
        self,
        status: StatusCode,
        extra_headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<()> {
        let mut stream = self.take_stream();
        let response = reject_response(status, extra_headers, body);
        let sent = stream.write_all(&response).await;
        if let Err(err) = stream.shutdown().await {
            trace!("rejected stream shutdown failed: {err}");
        }
        self.settle(Outcome::Rejected);
        sent.map_err(Into::into)
    }

    fn take_stream(&self) -> Box<dyn ByteStream> {
        self.slot
            .lock()
            .expect("Bug: negotiation lock poisoned")
            .stream
            .take()
            .expect("Bug: negotiation already resolved")
    }

    fn settle(&self, outcome: Outcome) {
        self.slot.lock().expect("Bug: negotiation lock poisoned").outcome = outcome;
    }
}

/// Perform the server side of the opening handshake over a pre-existing
/// stream, returning the negotiation [`Request`].
///
/// Connections accepted from the request run their reader task in `scope`.
pub async fn wrap_server_stream<S>(scope: &TaskTracker, stream: S) -> Result<Request>
where
    S: ByteStream,
{
    let mut stream: Box<dyn ByteStream> = Box::new(stream);
    let incoming = read_request(&mut stream).await?;
    let (request, _) = Request::new(scope.clone(), incoming, stream);
    Ok(request)
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The per-connection handler a server invokes with each [`Request`].
///
/// Blanket-implemented for async functions and closures taking a `Request`.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one incoming upgrade request.
    fn handle(&self, request: Request) -> HandlerFuture;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, request: Request) -> HandlerFuture {
        Box::pin(self(request))
    }
}

/// A WebSocket server: a set of listeners feeding per-connection handler
/// tasks within a supervised scope.
#[derive(Clone)]
#[allow(missing_debug_implementations)]
pub struct WebSocketServer {
    handler: Arc<dyn RequestHandler>,
    listeners: Arc<Vec<Arc<dyn Listener>>>,
    handler_scope: Option<TaskTracker>,
    shutdown: CancellationToken,
}

impl WebSocketServer {
    /// Build a server from already-bound listeners.
    ///
    /// Fails with [`Error::NoListeners`] when `listeners` is empty.
    pub fn new(
        handler: impl RequestHandler,
        listeners: Vec<Arc<dyn Listener>>,
    ) -> Result<Self> {
        if listeners.is_empty() {
            return Err(Error::NoListeners);
        }
        Ok(WebSocketServer {
            handler: Arc::new(handler),
            listeners: Arc::new(listeners),
            handler_scope: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind a single TCP listener on `addr` and build a server around it.
    pub async fn bind(
        handler: impl RequestHandler,
        addr: impl tokio::net::ToSocketAddrs,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(handler, vec![Arc::new(listener)])
    }

    /// Run connection handler tasks in `scope` instead of the server's
    /// internal one. Their lifetime is then managed by the caller;
    /// [`run`](Self::run) no longer waits for them on shutdown.
    pub fn with_handler_scope(mut self, scope: TaskTracker) -> Self {
        self.handler_scope = Some(scope);
        self
    }

    /// Per-listener metadata, in listener order.
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.listeners.iter().map(|listener| listener.info()).collect()
    }

    /// The bound TCP port.
    ///
    /// Only defined while the server has exactly one TCP-like listener; any
    /// other configuration makes the answer ambiguous and fails with
    /// [`Error::PortUnavailable`].
    pub fn port(&self) -> Result<u16> {
        match &self.listeners[..] {
            [only] => match only.info() {
                ListenerInfo::Tcp(port) => Ok(port.port()),
                ListenerInfo::Other(_) => Err(Error::PortUnavailable),
            },
            _ => Err(Error::PortUnavailable),
        }
    }

    /// Ask a running [`run`](Self::run) to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// On shutdown the listeners are closed, the acceptor tasks joined, and —
    /// unless an external handler scope was supplied — all handler tasks
    /// (with their connection readers) awaited.
    pub async fn run(self) -> Result<()> {
        let internal = TaskTracker::new();
        let scope = self.handler_scope.clone().unwrap_or_else(|| internal.clone());

        let mut acceptors = JoinSet::new();
        for listener in self.listeners.iter() {
            let listener = listener.clone();
            let handler = self.handler.clone();
            let scope = scope.clone();
            let token = self.shutdown.clone();
            acceptors.spawn(accept_loop(listener, handler, scope, token));
        }

        self.shutdown.cancelled().await;
        info!("server shutting down");
        for listener in self.listeners.iter() {
            listener.close().await;
        }
        while acceptors.join_next().await.is_some() {}
        internal.close();
        internal.wait().await;
        Ok(())
    }
}

/// Bind a TCP WebSocket server on `host:port`, start it in `scope`, and
/// return it. `port` and `listeners` are readable immediately.
pub async fn serve_websocket(
    scope: &TaskTracker,
    handler: impl RequestHandler,
    host: &str,
    port: u16,
) -> Result<WebSocketServer> {
    let server = WebSocketServer::bind(handler, (host, port)).await?;
    let running = server.clone();
    scope.spawn(async move {
        if let Err(err) = running.run().await {
            error!("server stopped: {err}");
        }
    });
    Ok(server)
}

async fn accept_loop(
    listener: Arc<dyn Listener>,
    handler: Arc<dyn RequestHandler>,
    scope: TaskTracker,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("{}: accept failed: {err}", listener.info());
                    break;
                }
            },
        };
        let handler = handler.clone();
        let handler_scope = scope.clone();
        scope.spawn(async move {
            handle_connection(handler, handler_scope, stream).await;
        });
    }
}

/// One accepted stream: handshake, hand over to the user handler, tidy up.
async fn handle_connection(
    handler: Arc<dyn RequestHandler>,
    scope: TaskTracker,
    mut stream: Box<dyn ByteStream>,
) {
    let incoming = match read_request(&mut stream).await {
        Ok(incoming) => incoming,
        Err(err) => {
            debug!("server handshake failed: {err}");
            return;
        }
    };
    let (request, slot) = Request::new(scope, incoming, stream);

    handler.handle(request).await;

    let (outcome, stream) = {
        let mut slot = slot.lock().expect("Bug: negotiation lock poisoned");
        (
            std::mem::replace(&mut slot.outcome, Outcome::Rejected),
            slot.stream.take(),
        )
    };
    match outcome {
        Outcome::Accepted(connection) => {
            // A handler that returns with the connection open means a normal
            // close.
            if !connection.is_closed() {
                if let Err(err) = connection.aclose().await {
                    debug!("conn#{}: close after handler exit failed: {err}", connection.id());
                }
            }
        }
        Outcome::Rejected => {}
        Outcome::Pending => {
            // The handler never answered the client.
            if let Some(mut stream) = stream {
                warn!("handler returned without accepting or rejecting, sending 500");
                let response =
                    reject_response(StatusCode::INTERNAL_SERVER_ERROR, &[], None);
                if let Err(err) = stream.write_all(&response).await {
                    trace!("could not send 500: {err}");
                }
                if let Err(err) = stream.shutdown().await {
                    trace!("stream shutdown failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_port_ipv4() {
        assert_eq!(
            ListenPort::new("10.105.0.2".parse().unwrap(), 80, false).to_string(),
            "ws://10.105.0.2:80"
        );
        assert_eq!(
            ListenPort::new("127.0.0.1".parse().unwrap(), 8000, false).to_string(),
            "ws://127.0.0.1:8000"
        );
        assert_eq!(
            ListenPort::new("0.0.0.0".parse().unwrap(), 443, true).to_string(),
            "wss://0.0.0.0:443"
        );
    }

    #[test]
    fn listen_port_ipv6() {
        assert_eq!(
            ListenPort::new(
                "2599:8807:6201:b7:16cf:bb9c:a6d3:51ab".parse().unwrap(),
                80,
                false
            )
            .to_string(),
            "ws://[2599:8807:6201:b7:16cf:bb9c:a6d3:51ab]:80"
        );
        assert_eq!(
            ListenPort::new("::1".parse().unwrap(), 8000, false).to_string(),
            "ws://[::1]:8000"
        );
        assert_eq!(ListenPort::new("::".parse().unwrap(), 443, true).to_string(), "wss://[::]:443");
    }
}
