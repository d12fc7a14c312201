use std::sync::Arc;

use crate::datafile::DatafileError;

/// Result type used throughout the SDK, with [`Error`] as the error variant.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The datafile was rejected. The previously active configuration (if
    /// any) remains in effect.
    #[error(transparent)]
    Datafile(#[from] DatafileError),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The datafile request was unauthorized; the sdk key or datafile access
    /// token is likely invalid.
    #[error("unauthorized, sdk key or datafile access token is likely invalid")]
    Unauthorized,

    /// Indicates that the datafile poller thread panicked. This should
    /// normally never happen.
    #[error("datafile poller thread panicked")]
    PollerThreadPanicked,

    /// Timed out waiting for the first configuration.
    #[error("timed out waiting for configuration")]
    ConfigurationTimeout,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
