//! Server handshake.

use std::fmt::Write;

use http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use httparse::Status;
use log::*;
use tokio::io::AsyncRead;

use super::{derive_accept_key, read_header_section, MAX_HEADERS};
use crate::error::{Error, HandshakeError, Result};

/// A parsed upgrade request from a client.
#[derive(Debug)]
pub(crate) struct IncomingRequest {
    /// Request target, verbatim (query string included).
    pub(crate) path: String,
    /// All request headers.
    pub(crate) headers: HeaderMap,
    /// Subprotocols proposed by the client, in offer order.
    pub(crate) subprotocols: Vec<String>,
    /// The client's `Sec-WebSocket-Key`.
    key: String,
}

/// Read and parse the upgrade request from `stream`.
///
/// A well-behaved client sends nothing past its request until it has seen the
/// response, so any trailing bytes are an error.
pub(crate) async fn read_request<S>(stream: &mut S) -> Result<IncomingRequest>
where
    S: AsyncRead + Unpin,
{
    let (head, leftover) = read_header_section(stream).await?;
    if !leftover.is_empty() {
        return Err(Error::Handshake(HandshakeError::JunkAfterRequest));
    }
    let request = parse_request(&head)?;
    debug!("received upgrade request for {}", request.path);
    Ok(request)
}

fn parse_request(buf: &[u8]) -> Result<IncomingRequest> {
    let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut hbuffer);
    let raw = match req.parse(buf)? {
        Status::Partial => return Err(Error::Handshake(HandshakeError::HandshakeIncomplete)),
        Status::Complete(_) => req,
    };

    if raw.method.expect("Bug: no method in header") != "GET" {
        return Err(Error::Handshake(HandshakeError::WrongHttpMethod));
    }
    if raw.version.expect("Bug: no HTTP version") < /*1.*/1 {
        return Err(Error::Handshake(HandshakeError::WrongHttpVersion));
    }
    let path = raw.path.expect("Bug: no path in header").to_owned();

    let mut headers = HeaderMap::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())?;
        let value = HeaderValue::from_bytes(header.value)?;
        headers.append(name, value);
    }

    if !headers
        .get("Upgrade")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(Error::Handshake(HandshakeError::MissingUpgradeWebSocketHeader));
    }
    if !headers
        .get("Connection")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(',').any(|p| p.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false)
    {
        return Err(Error::Handshake(HandshakeError::MissingConnectionUpgradeHeader));
    }
    if !headers
        .get("Sec-WebSocket-Version")
        .map(|h| h == "13")
        .unwrap_or(false)
    {
        return Err(Error::Handshake(HandshakeError::MissingSecWebSocketVersionHeader));
    }
    let key = headers
        .get("Sec-WebSocket-Key")
        .ok_or(Error::Handshake(HandshakeError::MissingSecWebSocketKey))?
        .to_str()?
        .to_owned();

    // The client lists its subprotocols comma-separated, possibly across
    // several header lines. Offer order is preserved.
    let mut subprotocols = Vec::new();
    for value in headers.get_all("Sec-WebSocket-Protocol").iter() {
        subprotocols
            .extend(value.to_str()?.split(',').map(|p| p.trim().to_owned()).filter(|p| !p.is_empty()));
    }

    Ok(IncomingRequest { path, headers, subprotocols, key })
}

impl IncomingRequest {
    /// Render the 101 response accepting the upgrade.
    pub(crate) fn accept_response(&self, subprotocol: Option<&str>) -> Vec<u8> {
        let mut reply = format!(
            "\
            HTTP/1.1 101 Switching Protocols\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Accept: {}\r\n",
            derive_accept_key(self.key.as_bytes())
        );
        if let Some(subprotocol) = subprotocol {
            write!(reply, "Sec-WebSocket-Protocol: {subprotocol}\r\n")
                .expect("Bug: can't write to string");
        }
        reply.push_str("\r\n");
        reply.into_bytes()
    }
}

/// Render a response refusing the upgrade.
pub(crate) fn reject_response(
    status: StatusCode,
    extra_headers: &[(String, String)],
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut reply = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    for (name, value) in extra_headers {
        write!(reply, "{name}: {value}\r\n").expect("Bug: can't write to string");
    }
    write!(reply, "Content-Length: {}\r\n\r\n", body.map_or(0, <[u8]>::len))
        .expect("Bug: can't write to string");
    let mut reply = reply.into_bytes();
    if let Some(body) = body {
        reply.extend_from_slice(body);
    }
    reply
}
