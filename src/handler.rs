//! Per-connection protocol handling
//!
//! A handler owns the client socket and at most one upstream socket for its
//! whole lifetime. Both are dropped (and so closed) on every return path.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::ca::{CertificateManager, CertificateRecord};
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::framing::{FramingLimits, MessageHead, MessageReader, RawMessage};
use crate::interceptor::InterceptorHandler;
use crate::record::Recorder;
use crate::tls::UpstreamTls;
use crate::tunnel::relay;
use crate::{Request, Response};

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// State shared by every connection of one server
pub(crate) struct ProxyContext {
  pub(crate) config: ProxyConfig,
  pub(crate) limits: FramingLimits,
  /// `None` when the root CA could not be initialised; tunnels are relayed raw
  pub(crate) certificates: Option<CertificateManager>,
  pub(crate) upstream_tls: UpstreamTls,
  pub(crate) recorder: Recorder,
  pub(crate) interceptors: InterceptorHandler,
}

/// Where a plain proxy request goes
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlainTarget {
  host: String,
  port: u16,
  tls: bool,
}

impl PlainTarget {
  /// From the absolute URL on the request line, else the `Host` header.
  fn resolve(head: &MessageHead) -> Result<PlainTarget> {
    if let Ok(uri) = head.target().parse::<http::Uri>() {
      if let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) {
        let tls = scheme.eq_ignore_ascii_case("https");
        let default_port = if tls { 443 } else { 80 };
        let (host, port) = parse_authority(authority.as_str(), default_port)?;
        return Ok(PlainTarget { host, port, tls });
      }
    }
    match head.headers.get("host") {
      Some(host) => {
        let (host, port) = parse_authority(host, 80)?;
        Ok(PlainTarget {
          host,
          port,
          tls: false,
        })
      }
      None => Err(Error::invalid_target(format!(
        "no host in {:?}",
        head.start_line
      ))),
    }
  }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub(crate) fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
  let authority = authority.trim();
  // userinfo never names the target
  let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
  let parse_port = |port: &str| {
    port
      .parse::<u16>()
      .map_err(|_| Error::invalid_target(format!("invalid port in {:?}", authority)))
  };
  let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
    let (host, after) = rest
      .split_once(']')
      .ok_or_else(|| Error::invalid_target(format!("unterminated IPv6 literal {:?}", authority)))?;
    let port = match after.strip_prefix(':') {
      Some(port) => parse_port(port)?,
      None if after.is_empty() => default_port,
      None => return Err(Error::invalid_target(format!("invalid authority {:?}", authority))),
    };
    (host, port)
  } else {
    match authority.rsplit_once(':') {
      Some((host, port)) if !host.contains(':') => (host, parse_port(port)?),
      // bare IPv6 literal
      Some(_) => (authority, default_port),
      None => (authority, default_port),
    }
  };
  if host.is_empty() {
    return Err(Error::invalid_target(format!("empty host in {:?}", authority)));
  }
  Ok((host.to_string(), port))
}

/// What happened to one decoded exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
  /// Forwarded; the session may carry more messages
  KeepAlive,
  /// Forwarded, or answered locally; the session is over
  Close,
}

/// Drives one accepted client connection to completion
pub(crate) struct ConnectionHandler {
  ctx: Arc<ProxyContext>,
  peer: SocketAddr,
  /// Interception flag as it was when the connection was accepted
  intercept: bool,
}

impl ConnectionHandler {
  pub(crate) fn new(ctx: Arc<ProxyContext>, peer: SocketAddr, intercept: bool) -> Self {
    ConnectionHandler {
      ctx,
      peer,
      intercept,
    }
  }

  /// Handle the connection; errors end this connection only.
  pub(crate) async fn run(self, stream: TcpStream) {
    let span = tracing::debug_span!("connection", peer = %self.peer);
    async move {
      tracing::debug!("accepted");
      match self.handle(stream).await {
        Ok(()) => tracing::debug!("closed"),
        Err(e) => tracing::debug!("closed: {}", e),
      }
    }
    .instrument(span)
    .await
  }

  async fn handle(&self, stream: TcpStream) -> Result<()> {
    let mut client = MessageReader::new(stream, self.ctx.limits);
    let (head_raw, head) = match client.read_head().await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(e @ Error::MalformedRequest(_)) => {
        self.reply(client.get_mut(), BAD_REQUEST).await?;
        return Err(e);
      }
      Err(e) => return Err(e),
    };
    if head.method().eq_ignore_ascii_case("CONNECT") {
      self.connect_tunnel(client, &head).await
    } else {
      self.plain_forward(client, head_raw, head).await
    }
  }

  async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(self.ctx.config.connect_timeout(), TcpStream::connect((host, port)))
      .await
    {
      Ok(Ok(stream)) => {
        let _ = stream.set_nodelay(true);
        Ok(stream)
      }
      Ok(Err(e)) => Err(Error::dial(addr, e)),
      Err(_) => Err(Error::dial(
        addr,
        std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
      )),
    }
  }

  /// Write `bytes` and flush, bounded by the read timeout.
  async fn reply<W: AsyncWrite + Unpin>(&self, writer: &mut W, bytes: &[u8]) -> Result<()> {
    write_all_timed(writer, bytes, self.ctx.config.read_timeout()).await
  }

  /// Framing was lost mid-message: pass the rest of the session through raw.
  async fn relay_rest<C, U>(
    &self,
    client: &mut MessageReader<C>,
    upstream: &mut MessageReader<U>,
  ) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
  {
    relay(
      client.buffered_mut(),
      upstream.buffered_mut(),
      self.ctx.config.idle_timeout(),
    )
    .await?;
    Ok(())
  }

  async fn connect_tunnel(
    &self,
    mut client: MessageReader<TcpStream>,
    head: &MessageHead,
  ) -> Result<()> {
    let (host, port) = match parse_authority(head.target(), 443) {
      Ok(target) => target,
      Err(e) => {
        self.reply(client.get_mut(), BAD_REQUEST).await?;
        return Err(e);
      }
    };
    tracing::debug!(authority = %head.target(), "CONNECT");
    let upstream = match self.dial(&host, port).await {
      Ok(upstream) => upstream,
      Err(e) => {
        self.reply(client.get_mut(), BAD_GATEWAY).await?;
        return Err(e);
      }
    };

    let leaf = match self.certificates_for(&host) {
      Some(certificates) => match certificates.get_leaf_certificate(&host).await {
        Ok(leaf) => Some(leaf),
        Err(e) => {
          self.reply(client.get_mut(), BAD_GATEWAY).await?;
          return Err(e);
        }
      },
      None => None,
    };
    self.reply(client.get_mut(), CONNECTION_ESTABLISHED).await?;

    // buffered bytes the client sent early stay in front of the stream
    let client = client.into_inner();
    match leaf {
      Some(leaf) => self.intercept_tls(client, upstream, &host, leaf).await,
      None => {
        tracing::debug!(host = %host, mode = "relay", "tunnel");
        relay(client, upstream, self.ctx.config.idle_timeout()).await?;
        Ok(())
      }
    }
  }

  /// The certificate source, if this tunnel is to be intercepted.
  fn certificates_for(&self, host: &str) -> Option<&CertificateManager> {
    if !self.ctx.config.tls_intercept || self.ctx.config.is_excluded(host) {
      return None;
    }
    self.ctx.certificates.as_ref()
  }

  async fn intercept_tls<C>(
    &self,
    client: C,
    upstream: TcpStream,
    host: &str,
    leaf: Arc<CertificateRecord>,
  ) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin,
  {
    tracing::debug!(host, mode = "intercept", "tunnel");
    let handshake_timeout = self.ctx.config.read_timeout();
    let acceptor = TlsAcceptor::from(leaf.tls_config());
    let client = tokio::time::timeout(handshake_timeout, acceptor.accept(client))
      .await
      .map_err(|_| Error::Timeout("client TLS handshake"))?
      .map_err(|e| Error::tls_handshake(format!("client for {}: {}", host, e)))?;
    let upstream = tokio::time::timeout(
      handshake_timeout,
      self.ctx.upstream_tls.connect(host, upstream),
    )
    .await
    .map_err(|_| Error::Timeout("upstream TLS handshake"))??;

    let mut client = MessageReader::new(client, self.ctx.limits);
    let mut upstream = MessageReader::new(upstream, self.ctx.limits);
    loop {
      let request = match client.read_request().await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) => {
          let _ = self.reply(client.get_mut(), BAD_REQUEST).await;
          return Err(e);
        }
      };
      let outcome = self
        .exchange(&mut client, &mut upstream, request, true, true)
        .await?;
      if outcome == Exchange::Close {
        return Ok(());
      }
      if !self.ctx.config.decode_keep_alive {
        break;
      }
    }
    relay(
      client.into_inner(),
      upstream.into_inner(),
      self.ctx.config.idle_timeout(),
    )
    .await?;
    Ok(())
  }

  async fn plain_forward(
    &self,
    mut client: MessageReader<TcpStream>,
    head_raw: Vec<u8>,
    head: MessageHead,
  ) -> Result<()> {
    let target = match PlainTarget::resolve(&head) {
      Ok(target) => target,
      Err(e) => {
        self.reply(client.get_mut(), BAD_REQUEST).await?;
        return Err(e);
      }
    };
    let request = match client.read_request_body(head_raw, head).await {
      Ok(request) => request,
      Err(e) => {
        let _ = self.reply(client.get_mut(), BAD_REQUEST).await;
        return Err(e);
      }
    };
    let observe = !self.ctx.config.is_excluded(&target.host);
    tracing::debug!(host = %target.host, port = target.port, observe, "forward");
    let upstream = match self.dial(&target.host, target.port).await {
      Ok(upstream) => upstream,
      Err(e) => {
        self.reply(client.get_mut(), BAD_GATEWAY).await?;
        return Err(e);
      }
    };
    if target.tls {
      let handshake = tokio::time::timeout(
        self.ctx.config.read_timeout(),
        self.ctx.upstream_tls.connect(&target.host, upstream),
      )
      .await
      .unwrap_or(Err(Error::Timeout("upstream TLS handshake")));
      let upstream = match handshake {
        Ok(upstream) => upstream,
        Err(e) => {
          self.reply(client.get_mut(), BAD_GATEWAY).await?;
          return Err(e);
        }
      };
      let mut upstream = MessageReader::new(upstream, self.ctx.limits);
      self
        .exchange(&mut client, &mut upstream, request, false, observe)
        .await?;
    } else {
      let mut upstream = MessageReader::new(upstream, self.ctx.limits);
      self
        .exchange(&mut client, &mut upstream, request, false, observe)
        .await?;
    }
    Ok(())
  }

  /// Forward one request, read its response, observe the pair, and forward
  /// the response.
  ///
  /// Parsing is best-effort: bytes that do not parse are still forwarded
  /// and simply go unobserved. Interceptors and observers only see traffic
  /// that is observed at all. A message whose body cannot be framed is
  /// forwarded as far as it was read and the session continues as a raw
  /// relay.
  async fn exchange<C, U>(
    &self,
    client: &mut MessageReader<C>,
    upstream: &mut MessageReader<U>,
    raw_request: RawMessage,
    secure: bool,
    observe: bool,
  ) -> Result<Exchange>
  where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
  {
    let RawMessage {
      raw,
      head: request_head,
      complete,
      ..
    } = raw_request;
    if !complete {
      tracing::debug!("request framing lost, relaying raw");
      self.reply(upstream.get_mut(), &raw).await?;
      self.relay_rest(client, upstream).await?;
      return Ok(Exchange::Close);
    }
    let method = request_head.method().to_string();
    let mut request = Request::from_raw(&raw).ok().map(|mut r| {
      r.set_secure(secure);
      r
    });
    let mut outgoing = Bytes::from(raw);
    let intercepting = observe && self.intercept && self.ctx.interceptors.has_interceptors();

    if intercepting {
      if let Some(original) = request.take() {
        match self.ctx.interceptors.process_request(original.clone()).await {
          Ok(Some(modified)) => {
            if modified != original {
              outgoing = modified.to_raw();
            }
            request = Some(modified);
          }
          Ok(None) => {
            tracing::debug!(url = %original.url(), "request dropped by interceptor");
            self.reply(client.get_mut(), FORBIDDEN).await?;
            return Ok(Exchange::Close);
          }
          Err(e) => {
            tracing::warn!("request interceptor failed: {}", e);
            request = Some(original);
          }
        }
      }
    }

    self.reply(upstream.get_mut(), &outgoing).await?;
    let raw_response = match upstream.read_response(&method).await {
      Ok(response) => response,
      Err(e) => {
        self.reply(client.get_mut(), BAD_GATEWAY).await?;
        return Err(e);
      }
    };
    if !raw_response.complete {
      tracing::debug!("response framing lost, relaying raw");
      self.reply(client.get_mut(), &raw_response.raw).await?;
      self.relay_rest(client, upstream).await?;
      return Ok(Exchange::Close);
    }
    let close = wants_close(&request_head, &raw_response.head);
    let mut response = Response::from_raw(raw_response.message()).ok();
    let mut incoming = Bytes::from(raw_response.raw);

    if intercepting {
      if let (Some(req), Some(original)) = (&request, response.take()) {
        match self.ctx.interceptors.process_response(req, original.clone()).await {
          Ok(Some(modified)) => {
            if modified != original {
              // interim 1xx responses already went out as part of the raw bytes
              let mut rewritten = incoming[..raw_response.start].to_vec();
              rewritten.extend_from_slice(&modified.to_raw());
              incoming = Bytes::from(rewritten);
            }
            response = Some(modified);
          }
          Ok(None) => {
            tracing::debug!(url = %req.url(), "response dropped by interceptor");
            self.reply(client.get_mut(), BAD_GATEWAY).await?;
            return Ok(Exchange::Close);
          }
          Err(e) => {
            tracing::warn!("response interceptor failed: {}", e);
            response = Some(original);
          }
        }
      }
    }

    if observe {
      if let (Some(request), Some(response)) = (request, response) {
        self.ctx.recorder.record(request, response).await;
      }
    }
    self.reply(client.get_mut(), &incoming).await?;
    Ok(if close {
      Exchange::Close
    } else {
      Exchange::KeepAlive
    })
  }
}

/// `write_all` plus flush, failing with [`Error::Timeout`] once `timeout` passes.
async fn write_all_timed<W: AsyncWrite + Unpin>(
  writer: &mut W,
  bytes: &[u8],
  timeout: Duration,
) -> Result<()> {
  tokio::time::timeout(timeout, async {
    writer.write_all(bytes).await?;
    writer.flush().await
  })
  .await
  .map_err(|_| Error::Timeout("write"))?
  .map_err(Error::from)
}

/// Either side asked for the connection to end after this exchange.
fn wants_close(request: &MessageHead, response: &MessageHead) -> bool {
  let close = |head: &MessageHead| {
    head
      .headers
      .get("connection")
      .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
  };
  close(request) || close(response) || response.status() == Some(101)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn authority_parsing() {
    assert_eq!(
      parse_authority("example.com:8443", 443).unwrap(),
      ("example.com".to_string(), 8443)
    );
    assert_eq!(
      parse_authority("example.com", 443).unwrap(),
      ("example.com".to_string(), 443)
    );
    assert_eq!(parse_authority("[::1]:8080", 80).unwrap(), ("::1".to_string(), 8080));
    assert_eq!(parse_authority("[::1]", 443).unwrap(), ("::1".to_string(), 443));
    assert_eq!(parse_authority("::1", 443).unwrap(), ("::1".to_string(), 443));
    assert!(matches!(
      parse_authority("example.com:http", 443),
      Err(Error::InvalidTarget(_))
    ));
    assert!(matches!(parse_authority(":443", 443), Err(Error::InvalidTarget(_))));
  }

  #[test]
  fn plain_targets_from_url_or_host_header() {
    let head = MessageHead::parse(b"GET http://example.com/a HTTP/1.1\r\nHost: other\r\n\r\n");
    assert_eq!(
      PlainTarget::resolve(&head).unwrap(),
      PlainTarget {
        host: "example.com".to_string(),
        port: 80,
        tls: false
      }
    );
    let head = MessageHead::parse(b"GET https://example.com:4443/ HTTP/1.1\r\n\r\n");
    assert_eq!(
      PlainTarget::resolve(&head).unwrap(),
      PlainTarget {
        host: "example.com".to_string(),
        port: 4443,
        tls: true
      }
    );
    let head = MessageHead::parse(b"GET /a HTTP/1.1\r\nHost: internal:8081\r\n\r\n");
    assert_eq!(PlainTarget::resolve(&head).unwrap().port, 8081);
    let head = MessageHead::parse(b"GET /a HTTP/1.1\r\n\r\n");
    assert!(matches!(PlainTarget::resolve(&head), Err(Error::InvalidTarget(_))));
  }

  #[tokio::test]
  async fn writes_to_a_stalled_peer_time_out() {
    let (mut writer, _stalled) = tokio::io::duplex(8);
    let result = write_all_timed(&mut writer, &[0u8; 64], Duration::from_millis(50)).await;
    assert!(matches!(result, Err(Error::Timeout("write"))));
    let (mut writer, mut reader) = tokio::io::duplex(64);
    write_all_timed(&mut writer, b"fits", Duration::from_millis(50))
      .await
      .unwrap();
    let mut got = [0u8; 4];
    tokio::io::AsyncReadExt::read_exact(&mut reader, &mut got)
      .await
      .unwrap();
    assert_eq!(&got, b"fits");
  }

  #[test]
  fn connection_close_on_either_side() {
    let keep = MessageHead::parse(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
    let close = MessageHead::parse(b"GET / HTTP/1.1\r\nConnection: Close\r\n\r\n");
    let ok = MessageHead::parse(b"HTTP/1.1 200 OK\r\n\r\n");
    let switching = MessageHead::parse(b"HTTP/1.1 101 Switching Protocols\r\n\r\n");
    assert!(!wants_close(&keep, &ok));
    assert!(wants_close(&close, &ok));
    assert!(wants_close(&keep, &switching));
  }
}
