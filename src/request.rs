use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use bytes::Bytes;
use http::Version;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::framing::split_message;
use crate::headers::Headers;
use crate::{now_millis, parse_version, COLON_SPACE, CR_LF, SPACE};

/// Request methods the proxy decodes.
///
/// Anything else is still relayed, it is just never observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  /// GET
  #[default]
  Get,
  /// POST
  Post,
  /// PUT
  Put,
  /// DELETE
  Delete,
  /// PATCH
  Patch,
  /// HEAD
  Head,
  /// OPTIONS
  Options,
}

impl Method {
  /// Upper-case wire name
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
      Method::Patch => "PATCH",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
    }
  }
}

impl FromStr for Method {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "DELETE" => Ok(Method::Delete),
      "PATCH" => Ok(Method::Patch),
      "HEAD" => Ok(Method::Head),
      "OPTIONS" => Ok(Method::Options),
      other => Err(Error::malformed_request(format!("unsupported method {:?}", other))),
    }
  }
}

impl Display for Method {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<Method> for http::Method {
  fn from(value: Method) -> Self {
    match value {
      Method::Get => http::Method::GET,
      Method::Post => http::Method::POST,
      Method::Put => http::Method::PUT,
      Method::Delete => http::Method::DELETE,
      Method::Patch => http::Method::PATCH,
      Method::Head => http::Method::HEAD,
      Method::Options => http::Method::OPTIONS,
    }
  }
}

/// A captured HTTP request.
///
/// `target` is kept exactly as it appeared on the request line, which is an
/// absolute URL for plain proxy requests and a path for requests decoded from
/// an intercepted TLS session.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  method: Method,
  target: String,
  #[serde(with = "http_serde::version")]
  version: Version,
  headers: Headers,
  body: Option<Bytes>,
  secure: bool,
  timestamp: u64,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("method", &self.method)
      .field("target", &self.target)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field(
        "body",
        &self.body.as_ref().map(|b| format!("{}", b.escape_ascii())),
      )
      .field("secure", &self.secure)
      .finish()
  }
}

impl Request {
  /// Start a new `HTTP/1.1` request, e.g. for replaying or fuzzing.
  pub fn new(method: Method, target: impl Into<String>) -> Self {
    Request {
      method,
      target: target.into(),
      version: Version::HTTP_11,
      headers: Headers::new(),
      body: None,
      secure: false,
      timestamp: now_millis(),
    }
  }

  /// Add or replace a header
  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// Set the body
  pub fn body(mut self, body: impl Into<Bytes>) -> Self {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
    self
  }

  /// Parse a raw request.
  ///
  /// The head ends at the first CRLFCRLF; everything after it is the body,
  /// kept as opaque bytes.
  pub fn from_raw(raw: &[u8]) -> Result<Request> {
    let (head, body) = split_message(raw);
    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();
    let request_line = lines
      .next()
      .filter(|l| !l.trim().is_empty())
      .ok_or_else(|| Error::malformed_request("empty request"))?;
    let mut parts = request_line.splitn(3, ' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() && !v.trim().is_empty() => {
        (m, t, v.trim())
      }
      _ => {
        return Err(Error::malformed_request(format!(
          "request line needs 3 tokens: {:?}",
          request_line
        )))
      }
    };
    let method = Method::from_str(method)?;
    Ok(Request {
      method,
      target: target.to_string(),
      version: parse_version(version).unwrap_or(Version::HTTP_11),
      headers: Headers::parse_lines(lines),
      body: body.filter(|b| !b.is_empty()).map(Bytes::copy_from_slice),
      secure: false,
      timestamp: now_millis(),
    })
  }

  /// Serialize as request line, headers in received order, blank line, body.
  pub fn to_raw(&self) -> Bytes {
    let mut http_request = Vec::new();
    http_request.extend(self.method.as_str().as_bytes());
    http_request.extend(SPACE);
    http_request.extend(self.target.as_bytes());
    http_request.extend(SPACE);
    http_request.extend(format!("{:?}", self.version).as_bytes());
    http_request.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_request.extend(k.as_bytes());
      http_request.extend(COLON_SPACE);
      http_request.extend(v.as_bytes());
      http_request.extend(CR_LF);
    }
    http_request.extend(CR_LF);
    if let Some(b) = &self.body {
      http_request.extend(b.as_ref());
    }
    Bytes::from(http_request)
  }

  /// Method
  pub fn method(&self) -> Method {
    self.method
  }

  /// Request target as received
  pub fn target(&self) -> &str {
    &self.target
  }

  /// HTTP version
  pub fn version(&self) -> Version {
    self.version
  }

  /// Headers
  pub fn headers(&self) -> &Headers {
    &self.headers
  }

  /// Mutable headers
  pub fn headers_mut(&mut self) -> &mut Headers {
    &mut self.headers
  }

  /// Body bytes, if any
  pub fn body_bytes(&self) -> Option<&Bytes> {
    self.body.as_ref()
  }

  /// Replace the body
  pub fn set_body(&mut self, body: impl Into<Bytes>) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }

  /// Whether the request was captured inside an intercepted TLS session
  pub fn is_secure(&self) -> bool {
    self.secure
  }

  pub(crate) fn set_secure(&mut self, secure: bool) {
    self.secure = secure;
  }

  /// Capture time in milliseconds since the UNIX epoch
  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  /// Host from the absolute target, falling back to the `Host` header.
  /// The port, if any, is stripped.
  pub fn host(&self) -> Option<String> {
    if let Some(host) = self
      .target
      .parse::<http::Uri>()
      .ok()
      .and_then(|uri| uri.host().map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string()))
    {
      return Some(host);
    }
    self.headers.get("host").map(|h| strip_port(h).to_string())
  }

  /// Absolute URL of the request.
  ///
  /// Origin-form targets are joined with the `Host` header, using `https`
  /// for requests captured over TLS.
  pub fn url(&self) -> String {
    if self.target.starts_with("http://") || self.target.starts_with("https://") {
      return self.target.clone();
    }
    match self.headers.get("host") {
      Some(host) => {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}{}", scheme, host, self.target)
      }
      None => self.target.clone(),
    }
  }
}

/// Strip a trailing `:port` from a host, leaving IPv6 literals intact.
pub(crate) fn strip_port(host: &str) -> &str {
  let host = host.trim();
  if let Some(rest) = host.strip_prefix('[') {
    return rest.split(']').next().unwrap_or(rest);
  }
  match host.rsplit_once(':') {
    Some((h, port)) if !h.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => h,
    _ => host,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_request_line_headers_and_body() {
    let raw = b"POST /login?next=%2F HTTP/1.1\r\nHost: example.com\r\nContent-Length: 7\r\n\r\nuser=me";
    let request = Request::from_raw(raw).unwrap();
    assert_eq!(request.method(), Method::Post);
    assert_eq!(request.target(), "/login?next=%2F");
    assert_eq!(request.version(), Version::HTTP_11);
    assert_eq!(request.headers().get("host"), Some("example.com"));
    assert_eq!(request.body_bytes().map(|b| b.as_ref()), Some(&b"user=me"[..]));
    assert_eq!(request.url(), "http://example.com/login?next=%2F");
  }

  #[test]
  fn rejects_short_request_line_and_unknown_method() {
    assert!(matches!(
      Request::from_raw(b"GET /\r\n\r\n"),
      Err(Error::MalformedRequest(_))
    ));
    assert!(matches!(
      Request::from_raw(b"BREW /pot HTTP/1.1\r\n\r\n"),
      Err(Error::MalformedRequest(_))
    ));
    assert!(matches!(Request::from_raw(b""), Err(Error::MalformedRequest(_))));
  }

  #[test]
  fn serialize_then_parse_preserves_fields() {
    let request = Request::new(Method::Put, "http://example.com/items/1")
      .header("Host", "example.com")
      .header("X-Token", "abc")
      .header("content-type", "application/json")
      .body(&b"{\"a\":1}"[..]);
    let parsed = Request::from_raw(&request.to_raw()).unwrap();
    assert_eq!(parsed.method(), request.method());
    assert_eq!(parsed.target(), request.target());
    assert_eq!(parsed.headers(), request.headers());
    assert_eq!(parsed.body_bytes(), request.body_bytes());
  }

  #[test]
  fn binary_body_is_passed_through() {
    let mut raw = b"PATCH /blob HTTP/1.1\r\nHost: h\r\n\r\n".to_vec();
    raw.extend_from_slice(&[0, 159, 146, 150, 13, 10, 13, 10]);
    let request = Request::from_raw(&raw).unwrap();
    assert_eq!(
      request.body_bytes().map(|b| b.to_vec()),
      Some(vec![0, 159, 146, 150, 13, 10, 13, 10])
    );
    assert!(request.to_raw().ends_with(&[0, 159, 146, 150, 13, 10, 13, 10]));
  }

  #[test]
  fn host_resolution() {
    let absolute = Request::from_raw(b"GET http://a.example:8080/x HTTP/1.1\r\nHost: b.example\r\n\r\n").unwrap();
    assert_eq!(absolute.host().as_deref(), Some("a.example"));
    let relative = Request::from_raw(b"GET /x HTTP/1.1\r\nHost: b.example:81\r\n\r\n").unwrap();
    assert_eq!(relative.host().as_deref(), Some("b.example"));
    assert_eq!(strip_port("[::1]:443"), "::1");
    assert_eq!(strip_port("::1"), "::1");
    assert_eq!(strip_port("example.com"), "example.com");
  }

  #[test]
  fn secure_requests_rebuild_https_urls() {
    let mut request = Request::from_raw(b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
    request.set_secure(true);
    assert_eq!(request.url(), "https://example.com/a");
  }
}
