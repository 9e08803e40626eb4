//! Client handshake.

use std::io::Write;

use http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use httparse::Status;
use log::*;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{derive_accept_key, generate_key, read_header_section, MAX_HEADERS};
use crate::error::{Error, HandshakeError, Result};

/// What the client asks for in its upgrade request.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientRequest {
    /// Value of the `Host` header (`host` or `host:port`).
    pub(crate) host: String,
    /// Request target: path plus query, verbatim.
    pub(crate) resource: String,
    /// Subprotocols to offer, in preference order.
    pub(crate) subprotocols: Vec<String>,
    /// Additional headers to send with the request.
    pub(crate) extra_headers: Vec<(String, String)>,
}

/// The outcome of a finished client handshake.
#[derive(Debug)]
pub(crate) struct ClientHandshake {
    /// Subprotocol agreed by the server, if any.
    pub(crate) subprotocol: Option<String>,
    /// Bytes read past the response header section.
    pub(crate) leftover: Vec<u8>,
}

/// Perform the client side of the opening handshake over `stream`.
pub(crate) async fn handshake<S>(stream: &mut S, request: &ClientRequest) -> Result<ClientHandshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let accept_key = derive_accept_key(key.as_bytes());

    let raw = build_request(request, &key);
    trace!("client request: {:?}", String::from_utf8_lossy(&raw));
    stream.write_all(&raw).await?;
    stream.flush().await?;

    let (head, leftover) = read_header_section(stream).await?;
    let response = parse_response(&head)?;
    let subprotocol = verify_response(&response, &accept_key, &request.subprotocols)?;
    debug!("client handshake done, subprotocol: {subprotocol:?}");
    Ok(ClientHandshake { subprotocol, leftover })
}

fn build_request(request: &ClientRequest, key: &str) -> Vec<u8> {
    let mut req = Vec::new();
    write!(
        req,
        "\
        GET {resource} HTTP/1.1\r\n\
        Host: {host}\r\n\
        Connection: Upgrade\r\n\
        Upgrade: websocket\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: {key}\r\n",
        resource = request.resource,
        host = request.host,
    )
    .expect("Bug: can't write to vector");
    if !request.subprotocols.is_empty() {
        write!(req, "Sec-WebSocket-Protocol: {}\r\n", request.subprotocols.join(", "))
            .expect("Bug: can't write to vector");
    }
    for (name, value) in &request.extra_headers {
        write!(req, "{name}: {value}\r\n").expect("Bug: can't write to vector");
    }
    write!(req, "\r\n").expect("Bug: can't write to vector");
    req
}

struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
}

fn parse_response(buf: &[u8]) -> Result<RawResponse> {
    let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut hbuffer);
    match response.parse(buf)? {
        Status::Partial => Err(Error::Handshake(HandshakeError::HandshakeIncomplete)),
        Status::Complete(_) => {
            if response.version.expect("Bug: no HTTP version") < /*1.*/1 {
                return Err(Error::Handshake(HandshakeError::WrongHttpVersion));
            }
            let status = StatusCode::from_u16(response.code.expect("Bug: no HTTP status code"))?;
            let mut headers = HeaderMap::with_capacity(response.headers.len());
            for header in response.headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())?;
                let value = HeaderValue::from_bytes(header.value)?;
                headers.append(name, value);
            }
            Ok(RawResponse { status, headers })
        }
    }
}

fn verify_response(
    response: &RawResponse,
    accept_key: &str,
    offered: &[String],
) -> Result<Option<String>> {
    // 1. If the status code received from the server is not 101, the client
    // handles the response per HTTP [RFC2616] procedures. (RFC 6455)
    if response.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::Handshake(HandshakeError::UnexpectedStatus(response.status)));
    }

    let headers = &response.headers;

    // 2. If the response lacks an |Upgrade| header field or the |Upgrade|
    // header field contains a value that is not an ASCII case-insensitive
    // match for the value "websocket", the client MUST _Fail the WebSocket
    // Connection_. (RFC 6455)
    if !headers
        .get("Upgrade")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(Error::Handshake(HandshakeError::MissingUpgradeWebSocketHeader));
    }

    // 3. If the response lacks a |Connection| header field or the |Connection|
    // header field doesn't contain a token that is an ASCII case-insensitive
    // match for the value "Upgrade", the client MUST _Fail the WebSocket
    // Connection_. (RFC 6455)
    if !headers
        .get("Connection")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(',').any(|p| p.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false)
    {
        return Err(Error::Handshake(HandshakeError::MissingConnectionUpgradeHeader));
    }

    // 4. If the response lacks a |Sec-WebSocket-Accept| header field or the
    // |Sec-WebSocket-Accept| contains a value other than the base64-encoded
    // SHA-1 of ... the client MUST _Fail the WebSocket Connection_. (RFC 6455)
    if !headers.get("Sec-WebSocket-Accept").map(|h| h == accept_key).unwrap_or(false) {
        return Err(Error::Handshake(HandshakeError::AcceptKeyMismatch));
    }

    // 6. If the response includes a |Sec-WebSocket-Protocol| header field and
    // this header field indicates the use of a subprotocol that was not
    // present in the client's handshake, the client MUST _Fail the WebSocket
    // Connection_. (RFC 6455)
    match headers.get("Sec-WebSocket-Protocol") {
        Some(value) => {
            let subprotocol = value.to_str()?.to_owned();
            if !offered.contains(&subprotocol) {
                return Err(Error::Handshake(HandshakeError::UnsolicitedSubprotocol(subprotocol)));
            }
            Ok(Some(subprotocol))
        }
        // A server that agrees to none leaves the connection without a
        // subprotocol, whatever the client offered.
        None => Ok(None),
    }
}
