//! Certificate Authority (CA) management for the interception proxy
//!
//! A root CA is created once (or loaded from disk) and signs one leaf
//! certificate per intercepted host. Leaves are persisted next to the root
//! as `<host>.crt` / `<host>.key` and cached in memory.
//!
use crate::errors::{Error, Result};
use crate::tls::server_config_for;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use x509_parser::extensions::GeneralName;

/// Root validity (10 years)
const CA_TTL_DAYS: i64 = 3650;
/// Leaf validity in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Leaves closer than this to expiry are reissued instead of reused from disk
const RENEW_BEFORE_SECS: i64 = 24 * 60 * 60;

/// Process-wide root certificate and key
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  cert_path: PathBuf,
  key_path: PathBuf,
  /// Whether the root was generated by this process
  generated: bool,
}

impl CertificateAuthority {
  /// Load the root CA from `cert_path`/`key_path`, or generate and persist
  /// one if either file is missing.
  ///
  /// Fails with [`Error::CaInit`] if the directory cannot be written or the
  /// existing material does not parse.
  pub async fn ensure(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref().to_path_buf();
    let key_path = key_path.as_ref().to_path_buf();

    for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
      if !parent.as_os_str().is_empty() && !parent.exists() {
        fs::create_dir_all(parent).await.map_err(|e| {
          Error::ca_init(format!("cannot create {}: {}", parent.display(), e))
        })?;
      }
    }

    if cert_path.exists() && key_path.exists() {
      Self::load(cert_path, key_path).await
    } else {
      Self::generate(cert_path, key_path).await
    }
  }

  async fn load(cert_path: PathBuf, key_path: PathBuf) -> Result<Self> {
    let cert_pem = fs::read_to_string(&cert_path)
      .await
      .map_err(|e| Error::ca_init(format!("cannot read {}: {}", cert_path.display(), e)))?;
    let key_pem = fs::read_to_string(&key_path)
      .await
      .map_err(|e| Error::ca_init(format!("cannot read {}: {}", key_path.display(), e)))?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::ca_init(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::ca_init(format!("Failed to create issuer from CA cert: {}", e)))?;

    // Parse PEM to DER for rustls
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::ca_init("No certificate found in PEM"))?
      .map_err(|e| Error::ca_init(format!("Failed to parse PEM: {}", e)))?;

    tracing::info!(path = %cert_path.display(), "loaded root CA");
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem,
      cert_path,
      key_path,
      generated: false,
    })
  }

  async fn generate(cert_path: PathBuf, key_path: PathBuf) -> Result<Self> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Webscan Proxy CA");
    dn.push(DnType::OrganizationName, "Webscan Proxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(CA_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca_init(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::ca_init(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    fs::write(&cert_path, cert_pem.as_bytes())
      .await
      .map_err(|e| Error::ca_init(format!("cannot write {}: {}", cert_path.display(), e)))?;
    fs::write(&key_path, key_pem.as_bytes())
      .await
      .map_err(|e| Error::ca_init(format!("cannot write {}: {}", key_path.display(), e)))?;

    let ca_cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::ca_init(format!("Failed to create issuer: {}", e)))?;

    tracing::info!(path = %cert_path.display(), "generated root CA");
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem,
      cert_path,
      key_path,
      generated: true,
    })
  }

  /// Sign a fresh leaf for `hostname` and write it into `dir`.
  fn issue_leaf(&self, hostname: &str, dir: &Path) -> Result<IssuedLeaf> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    let dns_name = hostname
      .try_into()
      .map_err(|_| Error::cert_issue(hostname, "invalid DNS name"))?;
    params.subject_alt_names = vec![SanType::DnsName(dns_name)];
    if let Ok(ip) = hostname.parse::<IpAddr>() {
      params.subject_alt_names.push(SanType::IpAddress(ip));
    }

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::cert_issue(hostname, format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::cert_issue(hostname, format!("Failed to sign leaf: {}", e)))?;

    let file_stem = file_stem(hostname);
    Ok(IssuedLeaf {
      cert_path: dir.join(format!("{}.crt", file_stem)),
      key_path: dir.join(format!("{}.key", file_stem)),
      cert_pem: cert.pem(),
      key_pem: key_pair.serialize_pem(),
    })
  }

  /// Root certificate in PEM format, for installation in client trust stores
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Root certificate path
  pub fn ca_cert_path(&self) -> &Path {
    &self.cert_path
  }

  /// Root key path
  pub fn ca_key_path(&self) -> &Path {
    &self.key_path
  }

  /// Whether the root was generated (rather than loaded) by this process
  pub fn is_generated(&self) -> bool {
    self.generated
  }
}

struct IssuedLeaf {
  cert_path: PathBuf,
  key_path: PathBuf,
  cert_pem: String,
  key_pem: String,
}

/// A leaf certificate issued for one host
pub struct CertificateRecord {
  hostname: String,
  cert_path: PathBuf,
  key_path: PathBuf,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  cert_chain: Vec<CertificateDer<'static>>,
  tls_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for CertificateRecord {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateRecord")
      .field("hostname", &self.hostname)
      .field("cert_path", &self.cert_path)
      .field("key_path", &self.key_path)
      .field("not_before", &self.not_before)
      .field("not_after", &self.not_after)
      .finish()
  }
}

impl CertificateRecord {
  /// Normalized hostname the leaf was issued for
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// Leaf certificate PEM path
  pub fn cert_path(&self) -> &Path {
    &self.cert_path
  }

  /// Leaf private key PEM path
  pub fn key_path(&self) -> &Path {
    &self.key_path
  }

  /// Start of validity
  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }

  /// End of validity
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  /// Chain presented to clients: `[leaf, root]`
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }

  /// Server-side TLS configuration presenting this leaf
  pub fn tls_config(&self) -> Arc<ServerConfig> {
    self.tls_config.clone()
  }
}

/// Issues and caches leaf certificates.
///
/// Lookups are single-flight: concurrent first requests for the same host
/// wait on one issuance and all receive its record.
pub struct CertificateManager {
  ca: CertificateAuthority,
  dir: PathBuf,
  cert_cache: Cache<String, Arc<CertificateRecord>>,
}

impl CertificateManager {
  /// Ensure the root CA and keep leaves in `dir`.
  pub async fn new(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    dir: impl AsRef<Path>,
  ) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    if !dir.exists() {
      fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::ca_init(format!("cannot create {}: {}", dir.display(), e)))?;
    }
    let ca = CertificateAuthority::ensure(cert_path, key_path).await?;
    Ok(Self::with_authority(ca, dir))
  }

  /// Use an already loaded root CA
  pub fn with_authority(ca: CertificateAuthority, dir: impl Into<PathBuf>) -> Self {
    // no capacity bound or TTL: records live as long as the manager
    let cert_cache = Cache::builder().build();
    Self {
      ca,
      dir: dir.into(),
      cert_cache,
    }
  }

  /// Get or issue the leaf certificate for `hostname`.
  ///
  /// The hostname is normalized first (port stripped, lower-cased), so
  /// `Example.com:443` and `example.com` share one leaf.
  pub async fn get_leaf_certificate(&self, hostname: &str) -> Result<Arc<CertificateRecord>> {
    let host = normalize_hostname(hostname);
    if host.is_empty() {
      return Err(Error::cert_issue(hostname, "empty hostname"));
    }
    self
      .cert_cache
      .try_get_with(host.clone(), self.load_or_issue(&host))
      .await
      .map_err(|e: Arc<Error>| match e.as_ref() {
        Error::CertIssue { host, reason } => Error::CertIssue {
          host: host.clone(),
          reason: reason.clone(),
        },
        other => Error::cert_issue(host.as_str(), other.to_string()),
      })
  }

  async fn load_or_issue(&self, host: &str) -> Result<Arc<CertificateRecord>> {
    let stem = file_stem(host);
    let cert_path = self.dir.join(format!("{}.crt", stem));
    let key_path = self.dir.join(format!("{}.key", stem));
    // a root generated by this process did not sign anything left on disk
    if !self.ca.is_generated() && cert_path.exists() && key_path.exists() {
      match self.load_leaf(host, &cert_path, &key_path).await {
        Ok(record) => {
          tracing::debug!(host, "reusing leaf certificate from disk");
          return Ok(record);
        }
        Err(e) => tracing::debug!(host, "reissuing leaf certificate: {}", e),
      }
    }

    let leaf = self.ca.issue_leaf(host, &self.dir)?;
    fs::write(&leaf.key_path, leaf.key_pem.as_bytes())
      .await
      .map_err(|e| Error::cert_issue(host, format!("cannot write key: {}", e)))?;
    fs::write(&leaf.cert_path, leaf.cert_pem.as_bytes())
      .await
      .map_err(|e| Error::cert_issue(host, format!("cannot write certificate: {}", e)))?;
    tracing::debug!(host, path = %leaf.cert_path.display(), "issued leaf certificate");
    self.record(
      host,
      leaf.cert_path,
      leaf.key_path,
      &leaf.cert_pem,
      &leaf.key_pem,
    )
  }

  async fn load_leaf(
    &self,
    host: &str,
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<Arc<CertificateRecord>> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;
    let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::cert_issue(host, "no certificate in PEM"))??;
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
      .map_err(|e| Error::cert_issue(host, format!("unparsable leaf: {}", e)))?;
    let (_, root) = x509_parser::parse_x509_certificate(self.ca.ca_cert_der().as_ref())
      .map_err(|e| Error::cert_issue(host, format!("unparsable root: {}", e)))?;
    if cert.issuer().as_raw() != root.subject().as_raw() {
      return Err(stale(host, "leaf was not signed by the current root"));
    }
    // distinct hosts can share a file stem, e.g. `*.a.com` and `_.a.com`
    let names_host = cert
      .subject_alternative_name()
      .ok()
      .flatten()
      .is_some_and(|san| {
        san.value.general_names.iter().any(|name| match name {
          GeneralName::DNSName(dns) => dns.eq_ignore_ascii_case(host),
          _ => false,
        })
      });
    if !names_host {
      return Err(stale(host, "leaf on disk was issued for another host"));
    }
    let not_after = cert.validity().not_after.to_datetime();
    if not_after - OffsetDateTime::now_utc() < Duration::seconds(RENEW_BEFORE_SECS) {
      return Err(stale(host, "leaf is about to expire"));
    }
    self.record(
      host,
      cert_path.to_path_buf(),
      key_path.to_path_buf(),
      &cert_pem,
      &key_pem,
    )
  }

  fn record(
    &self,
    host: &str,
    cert_path: PathBuf,
    key_path: PathBuf,
    cert_pem: &str,
    key_pem: &str,
  ) -> Result<Arc<CertificateRecord>> {
    let leaf_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::cert_issue(host, "no certificate in PEM"))?
      .map_err(|e| Error::cert_issue(host, format!("Failed to parse PEM: {}", e)))?;
    let (not_before, not_after) = x509_parser::parse_x509_certificate(leaf_der.as_ref())
      .map(|(_, cert)| {
        (
          cert.validity().not_before.to_datetime(),
          cert.validity().not_after.to_datetime(),
        )
      })
      .map_err(|e| Error::cert_issue(host, format!("unparsable leaf: {}", e)))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
      .map_err(|e| Error::cert_issue(host, format!("Failed to parse key: {}", e)))?
      .ok_or_else(|| Error::cert_issue(host, "no private key in PEM"))?;
    let cert_chain = vec![leaf_der, self.ca.ca_cert_der().clone()];
    let tls_config = server_config_for(cert_chain.clone(), key)
      .map_err(|e| Error::cert_issue(host, e.to_string()))?;
    Ok(Arc::new(CertificateRecord {
      hostname: host.to_string(),
      cert_path,
      key_path,
      not_before,
      not_after,
      cert_chain,
      tls_config: Arc::new(tls_config),
    }))
  }

  /// The root CA
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Get the CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> &Path {
    self.ca.ca_cert_path()
  }

  /// Directory holding leaf certificates
  pub fn cert_dir(&self) -> &Path {
    &self.dir
  }
}

/// A leaf on disk that cannot be reused; not logged, the caller reissues.
fn stale(host: &str, reason: &str) -> Error {
  Error::CertIssue {
    host: host.to_string(),
    reason: reason.to_string(),
  }
}

/// Strip port and brackets, lower-case, drop a trailing dot.
pub fn normalize_hostname(hostname: &str) -> String {
  crate::request::strip_port(hostname)
    .trim_end_matches('.')
    .to_ascii_lowercase()
}

/// File-system safe name for a host: `*` and anything outside
/// `[a-z0-9.-]` become `_`.
fn file_stem(host: &str) -> String {
  host
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
        c
      } else {
        '_'
      }
    })
    .collect::<String>()
    .trim_start_matches('.')
    .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hostnames_normalize() {
    assert_eq!(normalize_hostname("Example.COM:443"), "example.com");
    assert_eq!(normalize_hostname("example.com."), "example.com");
    assert_eq!(normalize_hostname("[::1]:8443"), "::1");
    assert_eq!(normalize_hostname("10.0.0.1"), "10.0.0.1");
  }

  #[test]
  fn file_stems_are_filesystem_safe() {
    assert_eq!(file_stem("*.example.com"), "_.example.com");
    assert_eq!(file_stem("::1"), "___1");
    assert_eq!(file_stem("../../etc/passwd"), "_.._etc_passwd");
  }
}
