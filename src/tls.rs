//! TLS configuration for both sides of an intercepted session
//!
use crate::errors::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::TlsConnector;

const ALPN_HTTP_11: &[u8] = b"http/1.1";

/// The installed process default provider, or `ring`.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Server-side configuration presenting `cert_chain`.
///
/// Only `http/1.1` is offered over ALPN since intercepted sessions are decoded
/// as HTTP/1.x.
pub(crate) fn server_config_for(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_handshake(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![ALPN_HTTP_11.to_vec()];
  Ok(config)
}

/// Read every certificate from a PEM file.
pub(crate) fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
  let pem = std::fs::read(path)
    .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
  let certs = rustls_pemfile::certs(&mut pem.as_slice())
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::config(format!("bad PEM in {}: {}", path.display(), e)))?;
  if certs.is_empty() {
    return Err(Error::config(format!("no certificates in {}", path.display())));
  }
  Ok(certs)
}

/// Verified client connections to upstream servers.
///
/// Trusts the system store plus any extra roots handed in.
#[derive(Clone)]
pub(crate) struct UpstreamTls {
  connector: TlsConnector,
}

impl UpstreamTls {
  pub(crate) fn new(extra_roots: Vec<CertificateDer<'static>>) -> Result<Self> {
    let mut root_cert_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in native.errors {
      tracing::debug!("skipping native root: {}", e);
    }
    let (_, ignored) = root_cert_store.add_parsable_certificates(native.certs);
    if ignored > 0 {
      tracing::debug!(ignored, "unparsable native roots");
    }
    for cert in extra_roots {
      root_cert_store.add(cert)?;
    }
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()?
      .with_root_certificates(root_cert_store)
      .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_HTTP_11.to_vec()];
    Ok(UpstreamTls {
      connector: TlsConnector::from(Arc::new(config)),
    })
  }

  /// Handshake with `host` over an established stream, verifying its
  /// certificate. IP literals are verified against IP SANs.
  pub(crate) async fn connect<S>(&self, host: &str, stream: S) -> Result<TlsStream<S>>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let server_name = ServerName::try_from(host.to_string())
      .map_err(|e| Error::tls_handshake(format!("invalid server name {}: {}", host, e)))?;
    self
      .connector
      .connect(server_name, stream)
      .await
      .map_err(|e| Error::tls_handshake(format!("upstream {}: {}", host, e)))
  }
}
