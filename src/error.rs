//! Error handling.

mod capacity_error;
mod handshake_error;
mod protocol_error;
mod tls_error;
mod url_error;

pub use capacity_error::CapacityError;
pub use handshake_error::HandshakeError;
pub use protocol_error::ProtocolError;
pub use tls_error::TlsError;
pub use url_error::UrlError;

use crate::connection::CloseReason;
use std::{io, str, string};
use thiserror::Error;

/// Result type of all library calls.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible WebSocket errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The connection is closed (or closing) and can no longer be used to
    /// send or receive.
    ///
    /// The [`CloseReason`] carries the close code and optional reason text,
    /// whether the close was initiated locally or by the peer.
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),
    /// The opening handshake was refused or malformed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// Protocol violation.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Input-output error. These are generally errors with the underlying
    /// connection and you should probably consider them fatal.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// TLS error.
    ///
    /// Note that this error variant is enabled unconditionally even if no TLS
    /// feature is enabled, to provide a feature-agnostic API surface.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    /// Buffer capacity exhausted.
    #[error("space limit exceeded: {0}")]
    Capacity(#[from] CapacityError),
    /// Invalid URL.
    #[error("URL error: {0}")]
    Url(#[from] UrlError),
    /// UTF-8 coding error.
    #[error("UTF-8 encoding error")]
    Utf8,
    /// HTTP format error.
    #[error("HTTP format error: {0}")]
    HttpFormat(#[from] http::Error),
    /// A ping with the same payload is already awaiting its pong on this
    /// connection.
    #[error("a ping with the same payload is already in flight")]
    PingInFlight,
    /// The subprotocol was not among those proposed by the client.
    #[error("subprotocol {0:?} was not offered by the client")]
    UnknownSubprotocol(String),
    /// A server was constructed with an empty listener list.
    #[error("a server needs at least one listener")]
    NoListeners,
    /// `port` was read on a server that does not have exactly one TCP
    /// listener.
    #[error("`port` is only defined for a server with exactly one TCP listener")]
    PortUnavailable,
}

impl From<str::Utf8Error> for Error {
    fn from(_: str::Utf8Error) -> Self {
        Error::Utf8
    }
}

impl From<string::FromUtf8Error> for Error {
    fn from(_: string::FromUtf8Error) -> Self {
        Error::Utf8
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::TooManyHeaders => Error::Capacity(CapacityError::TooManyHeaders),
            e => Error::Handshake(HandshakeError::Httparse(e)),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Url(UrlError::Malformed(err))
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Error::HttpFormat(err.into())
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Error::HttpFormat(err.into())
    }
}

impl From<http::header::ToStrError> for Error {
    fn from(_: http::header::ToStrError) -> Self {
        Error::Utf8
    }
}

impl From<http::status::InvalidStatusCode> for Error {
    fn from(err: http::status::InvalidStatusCode) -> Self {
        Error::HttpFormat(err.into())
    }
}
