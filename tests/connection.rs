//! End-to-end connection scenarios: echo round-trips, subprotocol
//! negotiation, ping correlation, the closing handshake contrasts, and the
//! server accept pipeline, over real TCP and in-memory streams.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::task::TaskTracker;

use scheelite::{
    connect_websocket, connect_websocket_url, serve_websocket, wrap_client_stream,
    wrap_server_stream, ByteStream, ClientBuilder, CloseCode, Error, ListenerInfo, Message,
    Request, WebSocketConnection, WebSocketServer,
};

const HOST: &str = "127.0.0.1";
const RESOURCE: &str = "/resource";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A handler that reads one message, sends back the same message, then
/// exits.
async fn echo_request_handler(request: Request) {
    let conn = match request.accept().await {
        Ok(conn) => conn,
        Err(_) => return,
    };
    if let Ok(msg) = conn.get_message().await {
        let _ = conn.send_message(msg).await;
    }
}

async fn echo_server(scope: &TaskTracker) -> WebSocketServer {
    serve_websocket(scope, echo_request_handler, HOST, 0).await.expect("server should bind")
}

async fn echo_conn(scope: &TaskTracker) -> WebSocketConnection {
    let server = echo_server(scope).await;
    connect_websocket(scope, HOST, server.port().unwrap(), RESOURCE)
        .await
        .expect("client should connect")
}

async fn wait_closed(conn: &WebSocketConnection) {
    timeout(Duration::from_secs(5), async {
        while !conn.is_closed() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should close in time");
}

fn assert_connection_closed<T: std::fmt::Debug>(result: scheelite::Result<T>) {
    match result {
        Err(Error::ConnectionClosed(_)) => {}
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
}

/// In-memory listener: `connect` yields the client end of a duplex pipe.
struct MemoryListener {
    queued: Mutex<mpsc::Receiver<DuplexStream>>,
    sender: mpsc::Sender<DuplexStream>,
}

impl MemoryListener {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(1);
        MemoryListener { queued: Mutex::new(receiver), sender }
    }

    async fn connect(&self) -> DuplexStream {
        let (client, server) = duplex(4096);
        self.sender.send(server).await.expect("listener should be accepting");
        client
    }
}

#[async_trait::async_trait]
impl scheelite::Listener for MemoryListener {
    async fn accept(&self) -> scheelite::Result<Box<dyn ByteStream>> {
        let stream = self.queued.lock().await.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "listener closed")
        })?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {
        self.queued.lock().await.close();
    }

    fn info(&self) -> ListenerInfo {
        ListenerInfo::Other("MemoryListener(..)".to_owned())
    }
}

#[tokio::test]
async fn client_send_and_receive() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;

    conn.send_message("This is a test message.").await.unwrap();
    let received = conn.get_message().await.unwrap();
    assert_eq!(received, Message::text("This is a test message."));

    conn.aclose().await.unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn client_default_close() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;
    assert!(!conn.is_closed());

    conn.aclose().await.unwrap();
    let reason = conn.close_reason().expect("close reason should be recorded");
    assert_eq!(reason.code(), CloseCode::Normal);
    assert_eq!(reason.reason(), None);
    assert_eq!(reason.name(), "NORMAL_CLOSURE");
}

#[tokio::test]
async fn client_nondefault_close() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;

    conn.aclose_with(CloseCode::Away, Some("test reason")).await.unwrap();
    let reason = conn.close_reason().expect("close reason should be recorded");
    assert_eq!(reason.code(), CloseCode::Away);
    assert_eq!(reason.reason(), Some("test reason"));
    assert_eq!(reason.name(), "GOING_AWAY");
}

#[tokio::test]
async fn aclose_is_idempotent() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;

    conn.aclose_with(CloseCode::Away, Some("first")).await.unwrap();
    conn.aclose().await.unwrap();
    let reason = conn.close_reason().unwrap();
    assert_eq!(reason.code(), CloseCode::Away);
    assert_eq!(reason.reason(), Some("first"));
}

#[tokio::test]
async fn client_open_url() {
    init_logging();
    let scope = TaskTracker::new();
    let server = echo_server(&scope).await;
    let port = server.port().unwrap();

    let url = format!("ws://{HOST}:{port}{RESOURCE}/path");
    let conn = connect_websocket_url(&scope, &url).await.unwrap();
    assert_eq!(conn.path(), "/resource/path");
    conn.aclose().await.unwrap();

    let url = format!("ws://{HOST}:{port}{RESOURCE}?foo=bar");
    let conn = connect_websocket_url(&scope, &url).await.unwrap();
    assert_eq!(conn.path(), "/resource?foo=bar");
    conn.aclose().await.unwrap();
}

#[tokio::test]
async fn client_open_invalid_url() {
    init_logging();
    let scope = TaskTracker::new();
    let result = connect_websocket_url(&scope, "http://foo.com/bar").await;
    assert!(matches!(result, Err(Error::Url(_))));
}

#[tokio::test]
async fn handshake_subprotocol() {
    init_logging();
    let scope = TaskTracker::new();

    let (tx, rx) = oneshot::channel();
    let tx = StdMutex::new(Some(tx));
    let handler = move |mut request: Request| {
        let tx = tx.lock().unwrap().take();
        async move {
            let proposed = request.proposed_subprotocols().to_vec();
            assert_eq!(request.subprotocol(), None);
            request.set_subprotocol(Some("chat")).unwrap();
            assert!(request.set_subprotocol(Some("smtp")).is_err());
            assert_eq!(request.subprotocol(), Some("chat"));
            let conn = request.accept().await.unwrap();
            if let Some(tx) = tx {
                let _ = tx.send((proposed, conn.subprotocol().map(str::to_owned)));
            }
            // Hold the connection until the client hangs up.
            let _ = conn.get_message().await;
        }
    };

    let server = serve_websocket(&scope, handler, HOST, 0).await.unwrap();
    let conn = ClientBuilder::new(HOST, server.port().unwrap())
        .resource(RESOURCE)
        .subprotocols(["chat", "file"])
        .connect(&scope)
        .await
        .unwrap();
    assert_eq!(conn.subprotocol(), Some("chat"));

    let (proposed, server_subprotocol) = rx.await.unwrap();
    assert_eq!(proposed, vec!["chat".to_owned(), "file".to_owned()]);
    assert_eq!(server_subprotocol.as_deref(), Some("chat"));

    conn.aclose().await.unwrap();
}

#[tokio::test]
async fn client_ping() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;

    conn.ping(Some(b"A".to_vec())).await.unwrap();
    conn.aclose().await.unwrap();
    assert_connection_closed(conn.ping(Some(b"B".to_vec())).await);
}

#[tokio::test]
async fn client_ping_two_payloads() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;

    // Both pings get default (distinct) payloads and both must complete.
    let (first, second) = tokio::join!(conn.ping(None), conn.ping(None));
    first.unwrap();
    second.unwrap();

    conn.aclose().await.unwrap();
}

#[tokio::test]
async fn client_ping_same_payload() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;

    // Two concurrent pings with the same payload: exactly one fails.
    let (first, second) =
        tokio::join!(conn.ping(Some(b"A".to_vec())), conn.ping(Some(b"A".to_vec())));
    let results = [first, second];
    let failures =
        results.iter().filter(|result| matches!(result, Err(Error::PingInFlight))).count();
    assert_eq!(failures, 1);
    assert!(results.iter().any(|result| result.is_ok()));

    conn.aclose().await.unwrap();
}

#[tokio::test]
async fn sequential_pings_may_reuse_payload() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;

    conn.ping(Some(b"A".to_vec())).await.unwrap();
    conn.ping(Some(b"A".to_vec())).await.unwrap();

    conn.aclose().await.unwrap();
}

#[tokio::test]
async fn client_pong() {
    init_logging();
    let scope = TaskTracker::new();
    let conn = echo_conn(&scope).await;

    conn.pong(b"A").await.unwrap();
    conn.aclose().await.unwrap();
    assert_connection_closed(conn.pong(b"B").await);
}

#[tokio::test]
async fn wrap_client_stream_over_tcp() {
    init_logging();
    let scope = TaskTracker::new();
    let server = echo_server(&scope).await;

    let stream = tokio::net::TcpStream::connect((HOST, server.port().unwrap())).await.unwrap();
    let conn = wrap_client_stream(&scope, stream, HOST, RESOURCE).await.unwrap();
    assert!(!conn.is_closed());

    conn.send_message("Hello from client!").await.unwrap();
    let msg = conn.get_message().await.unwrap();
    assert_eq!(msg, Message::text("Hello from client!"));

    conn.aclose().await.unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn wrap_server_stream_over_tcp() {
    init_logging();
    let scope = TaskTracker::new();

    let listener = tokio::net::TcpListener::bind((HOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (tx, rx) = oneshot::channel();
    let server_scope = scope.clone();
    scope.spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let request = wrap_server_stream(&server_scope, stream).await.unwrap();
        assert_eq!(request.path(), RESOURCE);
        let conn = request.accept().await.unwrap();
        let msg = conn.get_message().await.unwrap();
        let _ = tx.send(msg);
    });

    let client = connect_websocket(&scope, HOST, port, RESOURCE).await.unwrap();
    client.send_message("Hello from client!").await.unwrap();

    let received = rx.await.unwrap();
    assert_eq!(received, Message::text("Hello from client!"));
    client.aclose().await.unwrap();
}

#[tokio::test]
async fn server_handler_exit_closes_connection() {
    init_logging();
    let scope = TaskTracker::new();

    // The handler accepts, lingers, then returns with the connection still
    // open; the accept pipeline closes it with a normal closure.
    let handler = |request: Request| async move {
        let _conn = request.accept().await.unwrap();
        sleep(Duration::from_millis(100)).await;
    };
    let server = serve_websocket(&scope, handler, HOST, 0).await.unwrap();

    let conn = connect_websocket(&scope, HOST, server.port().unwrap(), "/").await.unwrap();
    let result = timeout(Duration::from_secs(5), conn.get_message()).await.unwrap();
    match result {
        Err(Error::ConnectionClosed(reason)) => assert_eq!(reason.name(), "NORMAL_CLOSURE"),
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn read_messages_after_remote_close() {
    init_logging();
    let scope = TaskTracker::new();

    // The server sends two messages and closes; both stay readable, the
    // third read fails.
    let handler = |request: Request| async move {
        let conn = request.accept().await.unwrap();
        conn.send_message("1").await.unwrap();
        conn.send_message("2").await.unwrap();
        conn.aclose().await.unwrap();
    };
    let server = serve_websocket(&scope, handler, HOST, 0).await.unwrap();

    let conn = connect_websocket(&scope, HOST, server.port().unwrap(), "/").await.unwrap();
    wait_closed(&conn).await;

    assert_eq!(conn.get_message().await.unwrap(), Message::text("1"));
    assert_eq!(conn.get_message().await.unwrap(), Message::text("2"));
    assert_connection_closed(conn.get_message().await);
}

#[tokio::test]
async fn no_messages_after_local_close() {
    init_logging();
    let scope = TaskTracker::new();

    let (tx, rx) = oneshot::channel();
    let tx = StdMutex::new(Some(tx));
    let handler = move |request: Request| {
        let tx = tx.lock().unwrap().take();
        async move {
            let conn = request.accept().await.unwrap();
            conn.send_message("1").await.unwrap();
            conn.send_message("2").await.unwrap();
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
            // Keep the connection open until the client closes it.
            let _ = conn.get_message().await;
        }
    };
    let server = serve_websocket(&scope, handler, HOST, 0).await.unwrap();

    let conn = connect_websocket(&scope, HOST, server.port().unwrap(), "/").await.unwrap();
    rx.await.unwrap();
    // Give the reader a beat to buffer both messages.
    sleep(Duration::from_millis(100)).await;

    conn.aclose().await.unwrap();
    // Locally initiated close discards the buffered "1" and "2".
    assert_connection_closed(conn.get_message().await);
}

#[tokio::test]
async fn abrupt_transport_close() {
    init_logging();
    let scope = TaskTracker::new();

    let (client_end, server_end) = duplex(4096);
    let answered = answer_101_then_hang_up(server_end);

    let (conn, _) = tokio::join!(
        async {
            wrap_client_stream(&scope, client_end, HOST, RESOURCE).await.unwrap()
        },
        answered,
    );

    wait_closed(&conn).await;
    let reason = conn.close_reason().expect("close reason should be recorded");
    assert_eq!(reason.code(), CloseCode::Abnormal);
    assert_eq!(reason.name(), "ABNORMAL_CLOSURE");
    assert_connection_closed(conn.send_message("Hello from client!").await);
    assert_connection_closed(conn.get_message().await);
}

/// Speak just enough HTTP to finish the opening handshake, then drop the
/// stream without a closing handshake.
async fn answer_101_then_hang_up(mut stream: DuplexStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert_ne!(n, 0, "client hung up during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8(buf).unwrap();
    let key = text
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("request should carry a key");
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        scheelite::handshake::derive_accept_key(key.trim().as_bytes())
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    // Dropping the stream closes the transport with no WebSocket close.
}

#[tokio::test]
async fn handler_can_reject() {
    init_logging();
    let scope = TaskTracker::new();

    let handler = |request: Request| async move {
        request
            .reject(http::StatusCode::FORBIDDEN, &[], Some(b"no entry"))
            .await
            .unwrap();
    };
    let server = serve_websocket(&scope, handler, HOST, 0).await.unwrap();

    let result = connect_websocket(&scope, HOST, server.port().unwrap(), "/").await;
    assert!(matches!(result, Err(Error::Handshake(_))), "got {result:?}");
}

#[tokio::test]
async fn handler_ignoring_request_gets_500() {
    init_logging();
    let scope = TaskTracker::new();

    let handler = |_request: Request| async move {};
    let server = serve_websocket(&scope, handler, HOST, 0).await.unwrap();

    let result = connect_websocket(&scope, HOST, server.port().unwrap(), "/").await;
    assert!(matches!(result, Err(Error::Handshake(_))), "got {result:?}");
}

#[tokio::test]
async fn server_has_listeners() {
    init_logging();
    let scope = TaskTracker::new();
    let server = echo_server(&scope).await;

    let listeners = server.listeners();
    assert!(!listeners.is_empty());
    match &listeners[0] {
        ListenerInfo::Tcp(port) => {
            assert_ne!(port.port(), 0);
            assert!(!port.is_tls());
        }
        other => panic!("expected a TCP listener, got {other:?}"),
    }
    assert_ne!(server.port().unwrap(), 0);
}

#[tokio::test]
async fn serve_with_zero_listeners() {
    init_logging();
    let result = WebSocketServer::new(echo_request_handler, Vec::new());
    assert!(matches!(result, Err(Error::NoListeners)));
}

#[tokio::test]
async fn serve_non_tcp_listener() {
    init_logging();
    let scope = TaskTracker::new();

    let listener = std::sync::Arc::new(MemoryListener::new());
    let listeners: Vec<std::sync::Arc<dyn scheelite::Listener>> = vec![listener.clone()];
    let server = WebSocketServer::new(echo_request_handler, listeners).unwrap();
    scope.spawn(server.clone().run());

    assert_eq!(server.listeners().len(), 1);
    assert!(matches!(server.port(), Err(Error::PortUnavailable)));
    assert!(server.listeners()[0].to_string().starts_with("MemoryListener("));

    // The in-memory transport carries a full session.
    let stream = listener.connect().await;
    let conn = wrap_client_stream(&scope, stream, HOST, RESOURCE).await.unwrap();
    conn.send_message("echo me").await.unwrap();
    assert_eq!(conn.get_message().await.unwrap(), Message::text("echo me"));
    conn.aclose().await.unwrap();

    server.shutdown();
}

#[tokio::test]
async fn serve_multiple_listeners() {
    init_logging();
    let scope = TaskTracker::new();

    let tcp = scheelite::TcpListener::bind((HOST, 0)).await.unwrap();
    let memory = std::sync::Arc::new(MemoryListener::new());
    let listeners: Vec<std::sync::Arc<dyn scheelite::Listener>> =
        vec![std::sync::Arc::new(tcp), memory];
    let server = WebSocketServer::new(echo_request_handler, listeners).unwrap();
    scope.spawn(server.clone().run());

    assert_eq!(server.listeners().len(), 2);
    // Even though the first listener has a port, `port` is only usable with
    // exactly one listener.
    assert!(matches!(server.port(), Err(Error::PortUnavailable)));
    match &server.listeners()[0] {
        ListenerInfo::Tcp(port) => assert_ne!(port.port(), 0),
        other => panic!("expected a TCP listener, got {other:?}"),
    }
    assert!(server.listeners()[1].to_string().starts_with("MemoryListener("));

    server.shutdown();
}

#[tokio::test]
async fn server_shutdown_completes() {
    init_logging();
    let scope = TaskTracker::new();
    let server = echo_server(&scope).await;

    let conn = connect_websocket(&scope, HOST, server.port().unwrap(), RESOURCE).await.unwrap();
    conn.send_message("ping").await.unwrap();
    assert_eq!(conn.get_message().await.unwrap(), Message::text("ping"));
    conn.aclose().await.unwrap();

    server.shutdown();
    scope.close();
    timeout(Duration::from_secs(5), scope.wait()).await.expect("server should shut down");
}

#[tokio::test]
async fn external_handler_scope() {
    init_logging();
    let scope = TaskTracker::new();
    let handler_scope = TaskTracker::new();

    let tcp = scheelite::TcpListener::bind((HOST, 0)).await.unwrap();
    let port = tcp.local_addr().port();
    let server = WebSocketServer::new(echo_request_handler, vec![std::sync::Arc::new(tcp)])
        .unwrap()
        .with_handler_scope(handler_scope.clone());
    scope.spawn(server.clone().run());

    let conn = connect_websocket(&scope, HOST, port, RESOURCE).await.unwrap();
    // The handler (and the connection reader) run in the external scope.
    assert!(handler_scope.len() > 0);
    conn.send_message("hi").await.unwrap();
    assert_eq!(conn.get_message().await.unwrap(), Message::text("hi"));
    conn.aclose().await.unwrap();

    server.shutdown();
    handler_scope.close();
    timeout(Duration::from_secs(5), handler_scope.wait())
        .await
        .expect("handlers should finish");
}
