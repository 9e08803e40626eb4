use thiserror::Error;

/// TLS errors.
///
/// Note that even if you enable only the rustls-based TLS support, the error
/// code will still contain the `Native` variant, to keep the API surface
/// independent of the selected backend.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TlsError {
    /// Native TLS error.
    #[cfg(feature = "native-tls")]
    #[error("native-tls error: {0}")]
    Native(#[from] native_tls_crate::Error),
    /// Rustls error.
    #[cfg(feature = "__rustls-tls")]
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
    /// DNS name resolution error.
    #[cfg(feature = "__rustls-tls")]
    #[error("invalid DNS name")]
    InvalidDnsName,
}
