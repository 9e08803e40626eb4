//! Asynchronous WebSockets for Tokio.
//!
//! A bidirectional, full-duplex client/server implementation of RFC 6455
//! layered on any byte-stream transport (plain TCP, TLS-wrapped TCP, or
//! anything satisfying [`ByteStream`]). Connections expose a
//! message-oriented API; framing, the opening handshake, ping/pong liveness
//! and the two-step closing handshake run behind it.
//!
//! Connect as a client with [`connect_websocket`] (or a [`ClientBuilder`]),
//! serve with [`serve_websocket`] / [`WebSocketServer`], or embed over an
//! existing stream with [`wrap_client_stream`] / [`wrap_server_stream`].

#![deny(trivial_casts, trivial_numeric_casts, unstable_features, unused_must_use)]
#![warn(missing_docs)]

pub mod client;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod tls;

pub use crate::client::{
    connect_websocket, connect_websocket_url, wrap_client_stream, ClientBuilder,
};
pub use crate::connection::{CloseReason, WebSocketConnection};
pub use crate::error::{Error, Result};
pub use crate::protocol::{CloseCode, Message, Role};
pub use crate::server::{
    serve_websocket, wrap_server_stream, ListenPort, Listener, ListenerInfo, Request,
    RequestHandler, TcpListener, WebSocketServer,
};
pub use crate::stream::{ByteStream, MaybeTlsStream, Mode};
pub use crate::tls::{Acceptor, Connector};
