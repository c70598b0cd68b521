//! This module contains abstractions related to the TLS layer of driver connections.
//!
//! The full picture looks like this:
//!
//! ┌─←─ TlsContext (openssl::SslContext / rustls::ClientConfig)
//! │
//! ├─←─ TlsMode (from `sslmode` of the connection string)
//! │
//! │ resolved once per Db into
//! │
//! ↳TlsConfig (same for all connections of the pool)
//!   │
//!   │ wraps
//!   │
//!   ↳TCP stream of each new connection

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::str::FromStr;
#[cfg(feature = "rustls-023")]
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::DsnParseError;

use super::connection::BoxedStream;

/// A wrapper around a TLS context of one of the supported backends.
///
/// With no backend feature enabled this type has no values, and TLS can only be
/// requested in [`TlsMode::Prefer`], which then falls back to plaintext.
#[derive(Clone)]
#[non_exhaustive]
pub enum TlsContext {
    /// TLS context backed by OpenSSL 0.10.
    #[cfg(feature = "openssl-010")]
    OpenSsl010(openssl::ssl::SslContext),
    /// TLS context backed by Rustls 0.23.
    #[cfg(feature = "rustls-023")]
    Rustls023(Arc<rustls::ClientConfig>),
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            #[cfg(feature = "openssl-010")]
            TlsContext::OpenSsl010(_) => f.write_str("TlsContext::OpenSsl010"),
            #[cfg(feature = "rustls-023")]
            TlsContext::Rustls023(_) => f.write_str("TlsContext::Rustls023"),
        }
    }
}

#[cfg(feature = "openssl-010")]
impl From<openssl::ssl::SslContext> for TlsContext {
    fn from(value: openssl::ssl::SslContext) -> Self {
        TlsContext::OpenSsl010(value)
    }
}

#[cfg(feature = "rustls-023")]
impl From<Arc<rustls::ClientConfig>> for TlsContext {
    fn from(value: Arc<rustls::ClientConfig>) -> Self {
        TlsContext::Rustls023(value)
    }
}

/// How connections are secured, as requested by `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plaintext.
    #[default]
    Disable,
    /// TLS without certificate checks when a backend is available, plaintext
    /// otherwise. `allow`, `prefer`, or `sslmode` left empty.
    Prefer,
    /// TLS without certificate checks; fails when no backend is available.
    Require,
    /// TLS with the certificate chain verified.
    VerifyCa,
    /// TLS with the certificate chain and the host name verified.
    VerifyFull,
}

impl TlsMode {
    fn verifies_peer(self) -> bool {
        matches!(self, TlsMode::VerifyCa | TlsMode::VerifyFull)
    }
}

impl FromStr for TlsMode {
    type Err = DsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(TlsMode::Disable),
            "" | "allow" | "prefer" => Ok(TlsMode::Prefer),
            "require" => Ok(TlsMode::Require),
            "verify-ca" => Ok(TlsMode::VerifyCa),
            "verify-full" => Ok(TlsMode::VerifyFull),
            other => Err(DsnParseError::UnsupportedSslMode(other.to_owned())),
        }
    }
}

/// A wrapper around a TLS error.
///
/// The original error came from one of the supported TLS backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TlsError {
    #[cfg(feature = "openssl-010")]
    #[error(transparent)]
    OpenSsl010(#[from] openssl::error::ErrorStack),
    #[cfg(feature = "rustls-023")]
    #[error(transparent)]
    Rustls023(#[from] rustls::Error),
    /// TLS was required but there is neither a user context nor a backend able to
    /// build one.
    #[error("sslmode {0:?} needs a TLS context; enable the openssl-010 feature or pass one")]
    NoContext(TlsMode),
}

impl From<TlsError> for io::Error {
    fn from(value: TlsError) -> Self {
        match value {
            #[cfg(feature = "openssl-010")]
            TlsError::OpenSsl010(e) => e.into(),
            #[cfg(feature = "rustls-023")]
            TlsError::Rustls023(e) => io::Error::other(e),
            e @ TlsError::NoContext(_) => io::Error::new(io::ErrorKind::Unsupported, e),
        }
    }
}

/// TLS settings shared by all connections of one pool.
#[derive(Clone, Debug)]
pub(crate) struct TlsConfig {
    context: TlsContext,
    mode: TlsMode,
}

impl TlsConfig {
    /// Decides whether connections use TLS. A user context always wins; without one,
    /// the openssl backend builds a context matching `mode`.
    pub(crate) fn resolve(
        mode: TlsMode,
        context: Option<&TlsContext>,
    ) -> Result<Option<TlsConfig>, TlsError> {
        if mode == TlsMode::Disable {
            return Ok(None);
        }
        if let Some(context) = context {
            return Ok(Some(TlsConfig {
                context: context.clone(),
                mode,
            }));
        }
        match default_context(mode)? {
            Some(context) => Ok(Some(TlsConfig { context, mode })),
            None if mode == TlsMode::Prefer => {
                debug!("No TLS backend available, connecting in plaintext");
                Ok(None)
            }
            None => Err(TlsError::NoContext(mode)),
        }
    }

    pub(crate) fn mode(&self) -> TlsMode {
        self.mode
    }

    /// Performs the TLS handshake over a freshly connected socket.
    #[allow(unused_variables)]
    pub(crate) async fn connect(
        &self,
        host: &str,
        ip: IpAddr,
        stream: TcpStream,
    ) -> Result<BoxedStream, io::Error> {
        match self.context {
            #[cfg(feature = "openssl-010")]
            TlsContext::OpenSsl010(ref context) => {
                let mut ssl = openssl::ssl::Ssl::new(context).map_err(TlsError::OpenSsl010)?;
                ssl.set_hostname(host).map_err(TlsError::OpenSsl010)?;
                if self.mode == TlsMode::VerifyFull {
                    ssl.param_mut()
                        .set_host(host)
                        .map_err(TlsError::OpenSsl010)?;
                }
                let mut stream =
                    tokio_openssl::SslStream::new(ssl, stream).map_err(TlsError::OpenSsl010)?;
                std::pin::Pin::new(&mut stream)
                    .connect()
                    .await
                    .map_err(io::Error::other)?;
                Ok(Box::new(stream))
            }
            #[cfg(feature = "rustls-023")]
            TlsContext::Rustls023(ref config) => {
                use rustls::pki_types::ServerName;
                let connector = tokio_rustls::TlsConnector::from(config.clone());
                let server_name = match ServerName::try_from(host.to_owned()) {
                    Ok(name) => name,
                    Err(_) => ServerName::IpAddress(ip.into()),
                };
                let stream = connector.connect(server_name, stream).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(feature = "openssl-010")]
fn default_context(mode: TlsMode) -> Result<Option<TlsContext>, TlsError> {
    use openssl::ssl::{SslContext, SslMethod, SslVerifyMode};

    let mut builder = SslContext::builder(SslMethod::tls_client())?;
    if mode.verifies_peer() {
        builder.set_default_verify_paths()?;
        builder.set_verify(SslVerifyMode::PEER);
    } else {
        builder.set_verify(SslVerifyMode::NONE);
    }
    Ok(Some(TlsContext::OpenSsl010(builder.build())))
}

#[cfg(not(feature = "openssl-010"))]
fn default_context(mode: TlsMode) -> Result<Option<TlsContext>, TlsError> {
    if mode.verifies_peer() {
        debug!("Certificate verification requested, but no TLS context was configured");
    }
    Ok(None)
}
