//! proxy error
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `webscan_proxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while running the interception proxy.
///
/// Everything except [`Error::CaInit`] and [`Error::Config`] is scoped to a
/// single connection and never reaches the accept loop.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The root CA could not be created or loaded.
  #[error("CA initialisation failed: {0}")]
  CaInit(String),
  /// A leaf certificate could not be issued for a host.
  #[error("certificate issuance for {host} failed: {reason}")]
  CertIssue {
    /// normalized hostname
    host: String,
    /// reason
    reason: String,
  },
  /// Either side of an intercepted session failed its TLS handshake.
  #[error("TLS handshake failed: {0}")]
  TlsHandshake(String),
  /// The bytes read from the client are not a request we understand.
  #[error("malformed request: {0}")]
  MalformedRequest(String),
  /// The bytes read from upstream are not a response we understand.
  #[error("malformed response: {0}")]
  MalformedResponse(String),
  /// Upstream could not be reached.
  #[error("failed to connect to {addr}: {source}")]
  Dial {
    /// host:port
    addr: String,
    /// underlying error
    #[source]
    source: std::io::Error,
  },
  /// The proxy target could not be determined.
  #[error("invalid target: {0}")]
  InvalidTarget(String),
  /// A bounded socket operation ran out of time.
  #[error("{0} timed out")]
  Timeout(&'static str),
  /// Configuration could not be loaded or failed validation.
  #[error("configuration error: {0}")]
  Config(String),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
}

impl Error {
  /// Create a CA initialisation error and log it
  pub fn ca_init(msg: impl Into<String>) -> Self {
    let error = Error::CaInit(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate issuance error and log it
  pub fn cert_issue(host: impl Into<String>, reason: impl Into<String>) -> Self {
    let error = Error::CertIssue {
      host: host.into(),
      reason: reason.into(),
    };
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS handshake error and log it
  pub fn tls_handshake(msg: impl Into<String>) -> Self {
    let error = Error::TlsHandshake(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a malformed request error; only logged at debug since relay carries on
  pub fn malformed_request(msg: impl Into<String>) -> Self {
    let error = Error::MalformedRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a malformed response error; only logged at debug since relay carries on
  pub fn malformed_response(msg: impl Into<String>) -> Self {
    let error = Error::MalformedResponse(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a dial error and log it
  pub fn dial(addr: impl Into<String>, source: std::io::Error) -> Self {
    let error = Error::Dial {
      addr: addr.into(),
      source,
    };
    tracing::warn!("{}", error);
    error
  }

  /// Create an invalid target error and log it
  pub fn invalid_target(msg: impl Into<String>) -> Self {
    let error = Error::InvalidTarget(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Whether the error prevents the proxy from starting at all.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Error::CaInit(_) | Error::Config(_))
  }
}

impl From<figment::Error> for Error {
  fn from(value: figment::Error) -> Self {
    Error::config(value.to_string())
  }
}
