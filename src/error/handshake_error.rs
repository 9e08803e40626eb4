use thiserror::Error;

/// Indicates the specific type/cause of a handshake failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HandshakeError {
    /// The server answered the upgrade request with a status other than 101.
    #[error("the server answered the upgrade with status {0}")]
    UnexpectedStatus(http::StatusCode),
    /// Use of the wrong HTTP method (the WebSocket protocol requires the GET method be used).
    #[error("unsupported HTTP method used - only GET is allowed")]
    WrongHttpMethod,
    /// Wrong HTTP version used (the WebSocket protocol requires version 1.1 or higher).
    #[error("HTTP version must be 1.1 or higher")]
    WrongHttpVersion,
    /// Missing `Connection: upgrade` HTTP header.
    #[error("no \"Connection: upgrade\" header")]
    MissingConnectionUpgradeHeader,
    /// Missing `Upgrade: websocket` HTTP header.
    #[error("no \"Upgrade: websocket\" header")]
    MissingUpgradeWebSocketHeader,
    /// Missing `Sec-WebSocket-Version: 13` HTTP header.
    #[error("no \"Sec-WebSocket-Version: 13\" header")]
    MissingSecWebSocketVersionHeader,
    /// Missing `Sec-WebSocket-Key` HTTP header.
    #[error("no \"Sec-WebSocket-Key\" header")]
    MissingSecWebSocketKey,
    /// The `Sec-WebSocket-Accept` header is either not present or does not
    /// specify the correct key value.
    #[error("key mismatch in \"Sec-WebSocket-Accept\" header")]
    AcceptKeyMismatch,
    /// The server agreed to a subprotocol the client never offered.
    #[error("the server selected subprotocol {0:?} which was not offered")]
    UnsolicitedSubprotocol(String),
    /// Garbage data encountered after the client request.
    #[error("junk after client request")]
    JunkAfterRequest,
    /// No more data while still performing the handshake.
    #[error("handshake not finished")]
    HandshakeIncomplete,
    /// Wrapper around a [`httparse::Error`] value.
    #[error("httparse error: {0}")]
    Httparse(httparse::Error),
}
