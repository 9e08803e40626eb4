//! WebSocket handshake control.

pub mod client;
pub mod server;

use data_encoding::BASE64;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{CapacityError, Error, HandshakeError, Result};

/// The maximum number of header lines allowed in a handshake.
pub(crate) const MAX_HEADERS: usize = 124;

/// Upper bound on the size of a handshake header section.
const MAX_HEADER_SECTION: usize = 64 * 1024;

/// Derive the `Sec-WebSocket-Accept` response header from a
/// `Sec-WebSocket-Key` request header.
pub fn derive_accept_key(request_key: &[u8]) -> String {
    // ... the value is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::new();
    sha1.update(request_key);
    sha1.update(WS_GUID);
    BASE64.encode(&sha1.finalize())
}

/// Generate a random key for the `Sec-WebSocket-Key` header.
pub fn generate_key() -> String {
    // a base64-encoded (see Section 4 of [RFC4648]) value that,
    // when decoded, is 16 bytes in length (RFC 6455)
    let r: [u8; 16] = rand::random();
    BASE64.encode(&r)
}

/// Read from `stream` until the end of an HTTP header section.
///
/// Returns the header bytes (terminator included) and whatever was read past
/// them; the tail belongs to the framing layer.
pub(crate) async fn read_header_section<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_header_end(&buf) {
            let tail = buf.split_off(end);
            return Ok((buf, tail));
        }
        if buf.len() > MAX_HEADER_SECTION {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: buf.len(),
                max_size: MAX_HEADER_SECTION,
            }));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Handshake(HandshakeError::HandshakeIncomplete));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n").map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::{derive_accept_key, find_header_end, generate_key};

    #[test]
    fn key_conversion() {
        // example from RFC 6455
        assert_eq!(
            derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn random_keys() {
        let k1 = generate_key();
        let k2 = generate_key();
        assert_ne!(k1, k2);
        assert_eq!(k1.len(), k2.len());
        assert_eq!(k1.len(), 24);
        assert!(k1.ends_with("=="));
        assert!(k1[..22].find('=').is_none());
    }

    #[test]
    fn header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 101 x\r\n\r\n"), Some(18));
        assert_eq!(find_header_end(b"HTTP/1.1 101 x\r\n\r\ntail"), Some(18));
        assert_eq!(find_header_end(b"HTTP/1.1 101 x\r\n"), None);
    }
}
