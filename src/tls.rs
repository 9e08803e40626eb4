//! Connection helper.
//!
//! Mirrors the stream switching of [`MaybeTlsStream`]: which TLS backend gets
//! used to upgrade a stream is decided at runtime through [`Connector`] (and
//! [`Acceptor`] on the server side), within whatever backends were compiled in.

use crate::error::Result;
use crate::stream::{ByteStream, MaybeTlsStream, Mode};

/// A connector that can be used when establishing connections, allowing to
/// control whether `native-tls` or `rustls` is used to create a TLS
/// connection. Or TLS can be disabled with the `Plain` variant.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Connector {
    /// Plain (non-TLS) connector.
    Plain,
    /// `native-tls` TLS connector.
    #[cfg(feature = "native-tls")]
    NativeTls(native_tls_crate::TlsConnector),
    /// `rustls` TLS connector.
    #[cfg(feature = "__rustls-tls")]
    Rustls(std::sync::Arc<rustls::ClientConfig>),
}

/// The server-side counterpart of [`Connector`]: upgrades accepted streams.
#[non_exhaustive]
#[allow(missing_debug_implementations)]
#[derive(Clone)]
pub enum Acceptor {
    /// Accept plain connections without TLS.
    Plain,
    /// Terminate TLS using `native-tls`.
    #[cfg(feature = "native-tls")]
    NativeTls(tokio_native_tls::TlsAcceptor),
    /// Terminate TLS using `rustls`.
    #[cfg(feature = "__rustls-tls")]
    Rustls(tokio_rustls::TlsAcceptor),
}

impl Acceptor {
    pub(crate) fn is_tls(&self) -> bool {
        !matches!(self, Acceptor::Plain)
    }

    /// Upgrade one accepted stream.
    pub(crate) async fn accept(&self, stream: Box<dyn ByteStream>) -> Result<Box<dyn ByteStream>> {
        match *self {
            Acceptor::Plain => Ok(stream),
            #[cfg(feature = "native-tls")]
            Acceptor::NativeTls(ref acceptor) => {
                use crate::error::TlsError;
                let stream = acceptor.accept(stream).await.map_err(TlsError::Native)?;
                Ok(Box::new(stream))
            }
            #[cfg(feature = "__rustls-tls")]
            Acceptor::Rustls(ref acceptor) => {
                let stream = acceptor.accept(stream).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

mod encryption {
    #[cfg(feature = "native-tls")]
    pub mod native_tls {
        use native_tls_crate::TlsConnector;
        use tokio_native_tls::TlsConnector as TokioTlsConnector;

        use crate::error::{Error, Result, TlsError};
        use crate::stream::{ByteStream, MaybeTlsStream, Mode};

        pub async fn wrap_stream<S>(
            socket: S,
            domain: &str,
            mode: Mode,
            tls_connector: Option<TlsConnector>,
        ) -> Result<MaybeTlsStream<S>>
        where
            S: ByteStream,
        {
            match mode {
                Mode::Plain => Ok(MaybeTlsStream::Plain(socket)),
                Mode::Tls => {
                    let try_connector = tls_connector.map_or_else(TlsConnector::new, Ok);
                    let connector = try_connector.map_err(TlsError::Native)?;
                    let connector = TokioTlsConnector::from(connector);
                    match connector.connect(domain, socket).await {
                        Err(e) => Err(Error::Tls(TlsError::Native(e))),
                        Ok(s) => Ok(MaybeTlsStream::NativeTls(s)),
                    }
                }
            }
        }
    }

    #[cfg(feature = "__rustls-tls")]
    pub mod rustls {
        use rustls::{ClientConfig, RootCertStore};
        use rustls_pki_types::ServerName;
        use std::sync::Arc;
        use tokio_rustls::TlsConnector;

        use crate::error::{Result, TlsError};
        use crate::stream::{ByteStream, MaybeTlsStream, Mode};

        pub async fn wrap_stream<S>(
            socket: S,
            domain: &str,
            mode: Mode,
            tls_connector: Option<Arc<ClientConfig>>,
        ) -> Result<MaybeTlsStream<S>>
        where
            S: ByteStream,
        {
            match mode {
                Mode::Plain => Ok(MaybeTlsStream::Plain(socket)),
                Mode::Tls => {
                    let config = match tls_connector {
                        Some(config) => config,
                        None => {
                            #[allow(unused_mut)]
                            let mut root_store = RootCertStore::empty();

                            #[cfg(feature = "rustls-tls-native-roots")]
                            {
                                let rustls_native_certs::CertificateResult { certs, errors, .. } =
                                    rustls_native_certs::load_native_certs();

                                if !errors.is_empty() {
                                    log::warn!(
                                        "native root CA certificate loading errors: {errors:?}"
                                    );
                                }

                                // Not finding any native root CA certificates is not fatal
                                // if the "rustls-tls-webpki-roots" feature is enabled.
                                #[cfg(not(feature = "rustls-tls-webpki-roots"))]
                                if certs.is_empty() {
                                    return Err(std::io::Error::new(
                                        std::io::ErrorKind::NotFound,
                                        format!(
                                            "no native root CA certificates found (errors: {errors:?})"
                                        ),
                                    )
                                    .into());
                                }

                                let total_number = certs.len();
                                let (number_added, number_ignored) =
                                    root_store.add_parsable_certificates(certs);
                                log::debug!("Added {number_added}/{total_number} native root certificates (ignored {number_ignored})");
                            }
                            #[cfg(feature = "rustls-tls-webpki-roots")]
                            {
                                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                            }

                            Arc::new(
                                ClientConfig::builder()
                                    .with_root_certificates(root_store)
                                    .with_no_client_auth(),
                            )
                        }
                    };
                    let domain = ServerName::try_from(domain)
                        .map_err(|_| TlsError::InvalidDnsName)?
                        .to_owned();
                    let stream = TlsConnector::from(config).connect(domain, socket).await?;

                    Ok(MaybeTlsStream::Rustls(stream))
                }
            }
        }
    }

    pub mod plain {
        use crate::error::{Error, Result, UrlError};
        use crate::stream::{ByteStream, MaybeTlsStream, Mode};

        pub fn wrap_stream<S>(socket: S, mode: Mode) -> Result<MaybeTlsStream<S>>
        where
            S: ByteStream,
        {
            match mode {
                Mode::Plain => Ok(MaybeTlsStream::Plain(socket)),
                Mode::Tls => Err(Error::Url(UrlError::TlsFeatureNotEnabled)),
            }
        }
    }
}

/// Upgrade a raw stream to TLS if `mode` requires it, using the given
/// connector or the backend's defaults.
#[cfg_attr(
    not(any(feature = "native-tls", feature = "__rustls-tls")),
    allow(unused_variables)
)]
pub(crate) async fn wrap_stream<S>(
    stream: S,
    domain: &str,
    mode: Mode,
    connector: Option<Connector>,
) -> Result<MaybeTlsStream<S>>
where
    S: ByteStream,
{
    match connector {
        Some(Connector::Plain) => encryption::plain::wrap_stream(stream, mode),
        #[cfg(feature = "native-tls")]
        Some(Connector::NativeTls(conn)) => {
            encryption::native_tls::wrap_stream(stream, domain, mode, Some(conn)).await
        }
        #[cfg(feature = "__rustls-tls")]
        Some(Connector::Rustls(conn)) => {
            encryption::rustls::wrap_stream(stream, domain, mode, Some(conn)).await
        }
        None => {
            #[cfg(feature = "native-tls")]
            {
                encryption::native_tls::wrap_stream(stream, domain, mode, None).await
            }
            #[cfg(all(feature = "__rustls-tls", not(feature = "native-tls")))]
            {
                encryption::rustls::wrap_stream(stream, domain, mode, None).await
            }
            #[cfg(not(any(feature = "native-tls", feature = "__rustls-tls")))]
            {
                encryption::plain::wrap_stream(stream, mode)
            }
        }
    }
}
