//! Proxy configuration
//!
//! The configuration is consumed, not owned, by the proxy core. Files use the
//! same layout as the rest of the toolkit: a document with a `proxy` section.
//!
//! ```toml
//! [proxy]
//! host = "127.0.0.1"
//! port = 8080
//! tls_intercept = true
//! exclude_domains = ["telemetry.example.com"]
//! ```
use crate::errors::{Error, Result};
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables with this prefix override file values,
/// e.g. `WEBSCAN_PROXY__PORT=9090`.
pub const ENV_PREFIX: &str = "WEBSCAN_";

/// Configuration for the interception proxy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Listen host
  pub host: String,
  /// Listen port, `0` picks an ephemeral port
  pub port: u16,
  /// Terminate and re-establish TLS on CONNECT tunnels
  pub tls_intercept: bool,
  /// Root CA certificate, defaults to `<cert_dir>/ca.crt`
  pub ca_cert_path: Option<PathBuf>,
  /// Root CA private key, defaults to `<cert_dir>/ca.key`
  pub ca_key_path: Option<PathBuf>,
  /// Observe everything, ignoring `exclude_domains`
  pub intercept_all: bool,
  /// Hosts that are relayed without being observed
  pub exclude_domains: Vec<String>,
  /// Directory for the root CA and per-host leaf certificates
  pub cert_dir: PathBuf,
  /// Upstream connect timeout in seconds
  pub connect_timeout_secs: u64,
  /// Per-read timeout in seconds
  pub read_timeout_secs: u64,
  /// Raw relay idle timeout in seconds
  pub idle_timeout_secs: u64,
  /// Maximum concurrent connections, unbounded when unset
  pub max_connections: Option<usize>,
  /// Decode every exchange of an intercepted keep-alive session instead of only the first
  pub decode_keep_alive: bool,
  /// Extra PEM trust roots for upstream TLS verification
  pub upstream_ca_bundle: Option<PathBuf>,
  /// Maximum size of a message head
  pub max_head_size: usize,
  /// Maximum size of a buffered message body
  pub max_body_size: usize,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 8080,
      tls_intercept: true,
      ca_cert_path: None,
      ca_key_path: None,
      intercept_all: false,
      exclude_domains: Vec::new(),
      cert_dir: PathBuf::from("certificates"),
      connect_timeout_secs: 30,
      read_timeout_secs: 30,
      idle_timeout_secs: 30,
      max_connections: None,
      decode_keep_alive: false,
      upstream_ca_bundle: None,
      max_head_size: 64 * 1024,
      max_body_size: 16 * 1024 * 1024,
    }
  }
}

#[derive(Deserialize, Default)]
struct Document {
  #[serde(default)]
  proxy: ProxyConfig,
}

impl ProxyConfig {
  /// Load the `proxy` section from a TOML, YAML or JSON file, then apply
  /// `WEBSCAN_PROXY__*` environment overrides.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let figment = match path.extension().and_then(|e| e.to_str()) {
      Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
      Some("json") => Figment::new().merge(Json::file(path)),
      Some("toml") => Figment::new().merge(Toml::file(path)),
      _ => {
        return Err(Error::config(format!(
          "unsupported configuration format: {}",
          path.display()
        )))
      }
    };
    if !path.exists() {
      return Err(Error::config(format!("{} does not exist", path.display())));
    }
    Self::extract(figment)
  }

  /// Merge `webscan.toml`, `config.yaml`, `config.yml` and `config.json` from
  /// the working directory in that order, later files overriding earlier
  /// ones. Missing files are skipped; with none present the defaults apply.
  pub fn from_default_locations() -> Result<Self> {
    let figment = Figment::new()
      .merge(Toml::file("webscan.toml"))
      .merge(Yaml::file("config.yaml"))
      .merge(Yaml::file("config.yml"))
      .merge(Json::file("config.json"));
    Self::extract(figment)
  }

  fn extract(figment: Figment) -> Result<Self> {
    let document: Document = figment
      .merge(Env::prefixed(ENV_PREFIX).split("__"))
      .extract()?;
    document.proxy.validate()?;
    Ok(document.proxy)
  }

  /// Reject values the proxy cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.host.trim().is_empty() {
      return Err(Error::config("host must not be empty"));
    }
    if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 || self.idle_timeout_secs == 0 {
      return Err(Error::config("timeouts must be greater than zero"));
    }
    if self.max_connections == Some(0) {
      return Err(Error::config("max_connections must be greater than zero"));
    }
    if self.max_head_size == 0 || self.max_body_size == 0 {
      return Err(Error::config("framing limits must be greater than zero"));
    }
    Ok(())
  }

  /// `host:port` to listen on
  pub fn listen_addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  /// Root CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self
      .ca_cert_path
      .clone()
      .unwrap_or_else(|| self.cert_dir.join("ca.crt"))
  }

  /// Root CA key path
  pub fn ca_key_path(&self) -> PathBuf {
    self
      .ca_key_path
      .clone()
      .unwrap_or_else(|| self.cert_dir.join("ca.key"))
  }

  /// Whether traffic to `host` should be relayed without observation.
  ///
  /// Entries match as case-insensitive substrings of the host.
  pub fn is_excluded(&self, host: &str) -> bool {
    if self.intercept_all {
      return false;
    }
    let host = host.to_ascii_lowercase();
    self
      .exclude_domains
      .iter()
      .map(|d| d.trim().to_ascii_lowercase())
      .any(|d| !d.is_empty() && host.contains(&d))
  }

  pub(crate) fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  pub(crate) fn read_timeout(&self) -> Duration {
    Duration::from_secs(self.read_timeout_secs)
  }

  pub(crate) fn idle_timeout(&self) -> Duration {
    Duration::from_secs(self.idle_timeout_secs)
  }
}
