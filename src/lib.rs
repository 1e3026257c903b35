#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # webscan-proxy
//!
//! The interception proxy core of a web application security scanner.
//!
//! The proxy sits between a browser (or any HTTP client) and the sites it
//! talks to. Plain HTTP requests are forwarded and recorded. `CONNECT`
//! tunnels are either relayed byte-for-byte or, with TLS interception on,
//! terminated with a leaf certificate signed by a local root CA so the
//! exchange inside can be decoded and handed to an [`Observer`].
//!
//! - Root CA and per-host leaf certificates, see [`CertificateManager`]
//! - Raw relay for excluded hosts and non-intercepted tunnels
//! - Request/response interceptors that can rewrite or drop traffic
//! - Captured history and a pluggable [`Storage`] sink
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webscan_proxy::{ProxyConfig, ProxyServer, Request, Response};
//!
//! # async fn run() -> webscan_proxy::Result<()> {
//! let config = ProxyConfig::load("config.yaml")?;
//! let server = ProxyServer::builder(config)
//!   .observer(Arc::new(|request: Request, response: Response| async move {
//!     println!("{} {} -> {}", request.method(), request.url(), response.status());
//!   }))
//!   .build()
//!   .await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Clients must trust the root certificate found at
//! [`ProxyServer::ca_cert_path`] for intercepted HTTPS to verify.
mod ca;
mod config;
mod errors;
mod framing;
mod handler;
mod headers;
/// Request and response interceptors
pub mod interceptor;
/// Captured exchanges, observers and storage
pub mod record;
mod request;
mod response;
mod server;
mod tls;
mod tunnel;

pub use ca::{normalize_hostname, CertificateAuthority, CertificateManager, CertificateRecord};
pub use config::{ProxyConfig, ENV_PREFIX};
pub use errors::{Error, Result};
pub use headers::Headers;
pub use http::Version;
pub use interceptor::{
  InterceptorHandler, LoggingInterceptor, RequestInterceptor, ResponseInterceptor,
};
pub use record::{HttpRecord, Observer, Storage};
pub use request::{Method, Request};
pub use response::Response;
pub use server::{ProxyServer, ProxyServerBuilder};
pub use tunnel::relay;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

/// Milliseconds since the UNIX epoch
pub(crate) fn now_millis() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or_default()
}

/// Map a protocol token such as `HTTP/1.1` to a [`Version`].
pub(crate) fn parse_version(version: &str) -> Option<Version> {
  match version.trim().to_ascii_uppercase().as_str() {
    "HTTP/0.9" => Some(Version::HTTP_09),
    "HTTP/1.0" => Some(Version::HTTP_10),
    "HTTP/1.1" => Some(Version::HTTP_11),
    "HTTP/2" | "HTTP/2.0" => Some(Version::HTTP_2),
    "HTTP/3" | "HTTP/3.0" => Some(Version::HTTP_3),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn versions() {
    assert_eq!(parse_version("HTTP/1.0"), Some(Version::HTTP_10));
    assert_eq!(parse_version("http/1.1"), Some(Version::HTTP_11));
    assert_eq!(parse_version("HTTP/2"), Some(Version::HTTP_2));
    assert_eq!(parse_version("SPDY/3"), None);
  }
}
