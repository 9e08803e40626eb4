use thiserror::Error;

/// Indicates the specific type/cause of URL error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UrlError {
    /// TLS is used despite not being compiled with the TLS feature enabled.
    #[error("TLS support not compiled in")]
    TlsFeatureNotEnabled,
    /// The URL does not include a host name.
    #[error("no host name in the URL")]
    NoHostName,
    /// Failed to connect with this URL.
    #[error("unable to connect to {0}")]
    UnableToConnect(String),
    /// Unsupported URL scheme used (only `ws://` or `wss://` may be used).
    #[error("URL scheme not supported")]
    UnsupportedUrlScheme,
    /// The URL host name, though included, is empty.
    #[error("URL contains empty host name")]
    EmptyHostName,
    /// The URL could not be parsed at all.
    #[error("malformed URL: {0}")]
    Malformed(url::ParseError),
}
