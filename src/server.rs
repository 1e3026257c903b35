//! Proxy server implementation

use crate::ca::CertificateManager;
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::framing::FramingLimits;
use crate::handler::{ConnectionHandler, ProxyContext};
use crate::interceptor::{InterceptorHandler, RequestInterceptor, ResponseInterceptor};
use crate::record::{HttpRecord, Observer, Recorder, Storage};
use crate::tls::{load_pem_certs, UpstreamTls};
use crate::{Request, Response};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{watch, Semaphore};
use tokio_rustls::rustls::pki_types::CertificateDer;

const LISTEN_BACKLOG: u32 = 1024;

/// Interception proxy server.
///
/// Owns the listening socket, the root CA and the captured history. Every
/// accepted connection runs on its own task.
pub struct ProxyServer {
  ctx: Arc<ProxyContext>,
  intercept: AtomicBool,
  running: AtomicBool,
  active: Arc<AtomicUsize>,
  shutdown: watch::Sender<bool>,
  local_addr: Mutex<Option<SocketAddr>>,
  limiter: Option<Arc<Semaphore>>,
}

/// Builder for `ProxyServer`.
pub struct ProxyServerBuilder {
  config: ProxyConfig,
  cert_manager: Option<CertificateManager>,
  storage: Option<Arc<dyn Storage>>,
  observers: Vec<Arc<dyn Observer>>,
  interceptor_handler: InterceptorHandler,
  upstream_roots: Vec<CertificateDer<'static>>,
  tolerate_ca_failure: bool,
}

impl ProxyServerBuilder {
  /// Start from a configuration
  pub fn new(config: ProxyConfig) -> Self {
    Self {
      config,
      cert_manager: None,
      storage: None,
      observers: Vec::new(),
      interceptor_handler: InterceptorHandler::new(),
      upstream_roots: Vec::new(),
      tolerate_ca_failure: false,
    }
  }

  /// Use an existing `CertificateManager` instead of the configured paths.
  pub fn cert_manager(mut self, cert_manager: CertificateManager) -> Self {
    self.cert_manager = Some(cert_manager);
    self
  }

  /// Persist every observed exchange to `storage`.
  pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
    self.storage = Some(storage);
    self
  }

  /// Notify `observer` of every observed exchange, after it is recorded.
  pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
    self.observers.push(observer);
    self
  }

  /// Set the `InterceptorHandler` to use.
  pub fn interceptor_handler(mut self, handler: InterceptorHandler) -> Self {
    self.interceptor_handler = handler;
    self
  }

  /// Add a request interceptor
  pub fn request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
    self.interceptor_handler.add_request_interceptor(interceptor);
    self
  }

  /// Add a response interceptor
  pub fn response_interceptor(mut self, interceptor: Arc<dyn ResponseInterceptor>) -> Self {
    self.interceptor_handler.add_response_interceptor(interceptor);
    self
  }

  /// Trust `root` for upstream TLS in addition to the system store.
  pub fn upstream_root(mut self, root: CertificateDer<'static>) -> Self {
    self.upstream_roots.push(root);
    self
  }

  /// Keep serving plain HTTP and raw tunnels when the root CA cannot be
  /// initialised, instead of failing `build`.
  pub fn tolerate_ca_failure(mut self, tolerate: bool) -> Self {
    self.tolerate_ca_failure = tolerate;
    self
  }

  /// Build the `ProxyServer`, loading or generating the root CA.
  pub async fn build(self) -> Result<ProxyServer> {
    let config = self.config;
    config.validate()?;

    let certificates = match self.cert_manager {
      Some(manager) => Some(manager),
      None if config.tls_intercept => {
        match CertificateManager::new(config.ca_cert_path(), config.ca_key_path(), &config.cert_dir)
          .await
        {
          Ok(manager) => Some(manager),
          Err(e) if self.tolerate_ca_failure => {
            tracing::warn!("TLS interception disabled: {}", e);
            None
          }
          Err(e) => return Err(e),
        }
      }
      None => None,
    };

    let mut upstream_roots = self.upstream_roots;
    if let Some(bundle) = &config.upstream_ca_bundle {
      upstream_roots.extend(load_pem_certs(bundle)?);
    }
    let upstream_tls = UpstreamTls::new(upstream_roots)?;

    let limiter = config
      .max_connections
      .map(|max| Arc::new(Semaphore::new(max)));
    let ctx = ProxyContext {
      limits: FramingLimits::from(&config),
      config,
      certificates,
      upstream_tls,
      recorder: Recorder::new(self.storage, self.observers),
      interceptors: self.interceptor_handler,
    };
    let (shutdown, _) = watch::channel(false);
    Ok(ProxyServer {
      ctx: Arc::new(ctx),
      intercept: AtomicBool::new(false),
      running: AtomicBool::new(false),
      active: Arc::new(AtomicUsize::new(0)),
      shutdown,
      local_addr: Mutex::new(None),
      limiter,
    })
  }
}

/// Counts a connection as active for as long as it lives
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
  fn new(active: Arc<AtomicUsize>) -> Self {
    active.fetch_add(1, Ordering::SeqCst);
    ActiveGuard(active)
  }
}

impl Drop for ActiveGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl ProxyServer {
  /// Create a builder from a configuration
  pub fn builder(config: ProxyConfig) -> ProxyServerBuilder {
    ProxyServerBuilder::new(config)
  }

  /// Bind `host:port` and serve until [`stop`](Self::stop) is called.
  pub async fn start(&self, host: &str, port: u16) -> Result<()> {
    let listener = bind(host, port).await?;
    self.serve(listener).await
  }

  /// Bind the configured `host:port` and serve.
  pub async fn run(&self) -> Result<()> {
    let config = &self.ctx.config;
    self.start(&config.host, config.port).await
  }

  /// Serve on an already bound listener until [`stop`](Self::stop) is called.
  ///
  /// Accept errors are logged and the loop carries on. The listener is closed
  /// when this returns; connections already accepted run to completion.
  /// Once stopped, a server stays stopped: a later `serve` returns at once.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    let mut shutdown = self.shutdown.subscribe();
    if *shutdown.borrow_and_update() {
      tracing::info!(%addr, "proxy already stopped");
      return Ok(());
    }
    if let Ok(mut local_addr) = self.local_addr.lock() {
      *local_addr = Some(addr);
    }
    self.running.store(true, Ordering::SeqCst);
    tracing::info!(%addr, "proxy listening");

    loop {
      let permit = match &self.limiter {
        Some(limiter) => tokio::select! {
          permit = limiter.clone().acquire_owned() => match permit {
            Ok(permit) => Some(permit),
            Err(_) => break,
          },
          _ = shutdown.changed() => break,
        },
        None => None,
      };
      tokio::select! {
        _ = shutdown.changed() => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let handler = ConnectionHandler::new(
              self.ctx.clone(),
              peer,
              self.intercept.load(Ordering::SeqCst),
            );
            let guard = ActiveGuard::new(self.active.clone());
            tokio::spawn(async move {
              let _guard = guard;
              let _permit = permit;
              handler.run(stream).await;
            });
          }
          Err(e) => {
            tracing::error!("failed to accept connection: {}", e);
          }
        },
      }
    }

    drop(listener);
    self.running.store(false, Ordering::SeqCst);
    tracing::info!(%addr, "proxy stopped");
    Ok(())
  }

  /// Stop accepting connections.
  ///
  /// The listening socket closes right away; in-flight connections are left
  /// to finish on their own.
  pub fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
    self.shutdown.send_replace(true);
  }

  /// Whether the accept loop is running
  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// Connections accepted and not yet finished
  pub fn active_connections(&self) -> usize {
    self.active.load(Ordering::SeqCst)
  }

  /// Address of the listening socket once serving
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.local_addr.lock().ok().and_then(|addr| *addr)
  }

  /// Turn request/response interceptors on or off for connections accepted
  /// from now on.
  pub fn set_intercept(&self, enabled: bool) {
    self.intercept.store(enabled, Ordering::SeqCst);
  }

  /// Whether new connections run interceptors
  pub fn is_intercepting(&self) -> bool {
    self.intercept.load(Ordering::SeqCst)
  }

  /// Record one exchange: append it to history, hand it to storage and
  /// notify observers. Connection handlers call this for every parsed pair.
  pub async fn on_request_response(&self, request: Request, response: Response) {
    self.ctx.recorder.record(request, response).await;
  }

  /// Snapshot of every exchange observed so far
  pub async fn get_history(&self) -> Vec<HttpRecord> {
    self.ctx.recorder.history().await
  }

  /// Forget the captured history
  pub async fn clear_history(&self) {
    self.ctx.recorder.clear().await;
  }

  /// Root CA certificate in PEM format, if interception is available
  pub fn ca_cert_pem(&self) -> Option<&str> {
    self.ctx.certificates.as_ref().map(|m| m.ca_cert_pem())
  }

  /// Root CA certificate path, if interception is available
  pub fn ca_cert_path(&self) -> Option<&Path> {
    self.ctx.certificates.as_ref().map(|m| m.ca_cert_path())
  }

  /// Leaf certificate issuance, if interception is available
  pub fn cert_manager(&self) -> Option<&CertificateManager> {
    self.ctx.certificates.as_ref()
  }

  /// The configuration the server runs with
  pub fn config(&self) -> &ProxyConfig {
    &self.ctx.config
  }
}

/// Bind with `SO_REUSEADDR` so a restarted proxy can take its port back.
async fn bind(host: &str, port: u16) -> Result<TcpListener> {
  let addr = tokio::net::lookup_host((host, port))
    .await?
    .next()
    .ok_or_else(|| Error::config(format!("cannot resolve {}:{}", host, port)))?;
  let socket = if addr.is_ipv4() {
    TcpSocket::new_v4()?
  } else {
    TcpSocket::new_v6()?
  };
  socket.set_reuseaddr(true)?;
  socket.bind(addr).map_err(|e| {
    tracing::error!(%addr, "failed to bind: {}", e);
    Error::IO(e)
  })?;
  Ok(socket.listen(LISTEN_BACKLOG)?)
}
