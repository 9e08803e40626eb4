//! Methods to open a WebSocket connection as a client.

use log::*;
use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::connection::WebSocketConnection;
use crate::error::{Error, Result, UrlError};
use crate::handshake::client::{handshake, ClientRequest};
use crate::protocol::Role;
use crate::stream::{ByteStream, Mode};
use crate::tls::{self, Connector};

/// Configures and opens client connections.
///
/// ```no_run
/// # use scheelite::{ClientBuilder, Result};
/// # use tokio_util::task::TaskTracker;
/// # async fn run() -> Result<()> {
/// let scope = TaskTracker::new();
/// let conn = ClientBuilder::new("example.com", 80)
///     .resource("/feed?fast=1")
///     .subprotocols(["chat"])
///     .connect(&scope)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    host: String,
    port: u16,
    resource: String,
    mode: Mode,
    subprotocols: Vec<String>,
    extra_headers: Vec<(String, String)>,
    connector: Option<Connector>,
}

impl ClientBuilder {
    /// Start a builder for a plain connection to `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientBuilder {
            host: host.into(),
            port,
            resource: "/".to_owned(),
            mode: Mode::Plain,
            subprotocols: Vec::new(),
            extra_headers: Vec::new(),
            connector: None,
        }
    }

    /// Parse a `ws://` or `wss://` URL into a builder. Any other scheme is
    /// refused. The path and query are preserved verbatim.
    pub fn from_url(url: &str) -> Result<Self> {
        let url: Url = url.parse()?;
        let mode = match url.scheme() {
            "ws" => Mode::Plain,
            "wss" => Mode::Tls,
            _ => return Err(Error::Url(UrlError::UnsupportedUrlScheme)),
        };
        let host = url.host_str().ok_or(Error::Url(UrlError::NoHostName))?.to_owned();
        if host.is_empty() {
            return Err(Error::Url(UrlError::EmptyHostName));
        }
        let port = url.port_or_known_default().expect("Bug: ws and wss have default ports");
        let mut resource = url.path().to_owned();
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }
        let mut builder = ClientBuilder::new(host, port);
        builder.mode = mode;
        builder.resource = resource;
        Ok(builder)
    }

    /// The request target (path plus query) to ask for. Defaults to `/`.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Subprotocols to offer, in preference order.
    pub fn subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Add an extra header to the upgrade request.
    pub fn extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Switch TLS on or off (off by default).
    pub fn use_tls(mut self, tls: bool) -> Self {
        self.mode = if tls { Mode::Tls } else { Mode::Plain };
        self
    }

    /// Use a specific TLS connector instead of the backend defaults.
    pub fn connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Open the connection: dial TCP, upgrade to TLS if requested, then
    /// perform the opening handshake. The reader task is spawned into
    /// `scope`.
    pub async fn connect(&self, scope: &TaskTracker) -> Result<WebSocketConnection> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await.map_err(|_| {
            Error::Url(UrlError::UnableToConnect(format!("{}:{}", self.host, self.port)))
        })?;
        tcp.set_nodelay(true)?;
        debug!("connected to {}:{}", self.host, self.port);
        let stream = tls::wrap_stream(tcp, &self.host, self.mode, self.connector.clone()).await?;

        let host_header = match (self.mode, self.port) {
            (Mode::Plain, 80) | (Mode::Tls, 443) => self.host.clone(),
            _ => format!("{}:{}", self.host, self.port),
        };
        let request = ClientRequest {
            host: host_header,
            resource: self.resource.clone(),
            subprotocols: self.subprotocols.clone(),
            extra_headers: self.extra_headers.clone(),
        };
        open_over(scope, Box::new(stream), request).await
    }
}

async fn open_over(
    scope: &TaskTracker,
    mut stream: Box<dyn ByteStream>,
    request: ClientRequest,
) -> Result<WebSocketConnection> {
    let outcome = handshake(&mut stream, &request).await?;
    Ok(WebSocketConnection::spawn(
        scope,
        stream,
        Role::Client,
        request.resource,
        outcome.subprotocol,
        outcome.leftover,
    ))
}

/// Open a WebSocket connection to `host:port` asking for `resource`.
///
/// Thin wrapper over [`ClientBuilder`]; the connection's reader task runs in
/// `scope`.
pub async fn connect_websocket(
    scope: &TaskTracker,
    host: &str,
    port: u16,
    resource: &str,
) -> Result<WebSocketConnection> {
    ClientBuilder::new(host, port).resource(resource).connect(scope).await
}

/// Open a WebSocket connection from a `ws://` or `wss://` URL.
pub async fn connect_websocket_url(scope: &TaskTracker, url: &str) -> Result<WebSocketConnection> {
    ClientBuilder::from_url(url)?.connect(scope).await
}

/// Perform a client handshake over a pre-existing stream.
///
/// This embeds WebSocket over any transport satisfying [`ByteStream`]; `host`
/// only names the peer for the `Host` header.
pub async fn wrap_client_stream<S>(
    scope: &TaskTracker,
    stream: S,
    host: &str,
    resource: &str,
) -> Result<WebSocketConnection>
where
    S: ByteStream,
{
    let request = ClientRequest {
        host: host.to_owned(),
        resource: resource.to_owned(),
        subprotocols: Vec::new(),
        extra_headers: Vec::new(),
    };
    open_over(scope, Box::new(stream), request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        let builder = ClientBuilder::from_url("ws://example.com/resource/path").unwrap();
        assert_eq!(builder.host, "example.com");
        assert_eq!(builder.port, 80);
        assert_eq!(builder.mode, Mode::Plain);
        assert_eq!(builder.resource, "/resource/path");
    }

    #[test]
    fn url_parsing_tls_default_port() {
        let builder = ClientBuilder::from_url("wss://example.com/").unwrap();
        assert_eq!(builder.port, 443);
        assert_eq!(builder.mode, Mode::Tls);
    }

    #[test]
    fn url_parsing_preserves_query() {
        let builder = ClientBuilder::from_url("ws://example.com:8000/resource?foo=bar").unwrap();
        assert_eq!(builder.port, 8000);
        assert_eq!(builder.resource, "/resource?foo=bar");
    }

    #[test]
    fn url_parsing_rejects_other_schemes() {
        let err = ClientBuilder::from_url("http://foo.com/bar").unwrap_err();
        assert!(matches!(err, Error::Url(UrlError::UnsupportedUrlScheme)));
    }
}
