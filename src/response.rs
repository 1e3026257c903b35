use std::fmt::{Debug, Formatter};
use std::io::Read;

use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use http::Version;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::framing::{dechunk, split_message};
use crate::headers::Headers;
use crate::{now_millis, parse_version, COLON_SPACE, CR_LF, SPACE};

/// A captured HTTP response.
///
/// The body is stored exactly as it came off the wire, including chunked
/// framing. A `Content-Length` that disagrees with the body is tolerated.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  #[serde(with = "http_serde::version")]
  version: Version,
  status: u16,
  reason: String,
  headers: Headers,
  body: Bytes,
  timestamp: u64,
}

impl Debug for Response {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Response")
      .field("version", &self.version)
      .field("status", &self.status)
      .field("reason", &self.reason)
      .field("headers", &self.headers)
      .field("body_len", &self.body.len())
      .finish()
  }
}

impl Response {
  /// Start a new `HTTP/1.1` response with the canonical reason phrase.
  pub fn new(status: u16) -> Result<Self> {
    let code = http::StatusCode::from_u16(status)
      .ok()
      .filter(|_| (100..=599).contains(&status))
      .ok_or_else(|| Error::malformed_response(format!("status {} out of range", status)))?;
    Ok(Response {
      version: Version::HTTP_11,
      status,
      reason: code.canonical_reason().unwrap_or_default().to_string(),
      headers: Headers::new(),
      body: Bytes::new(),
      timestamp: now_millis(),
    })
  }

  /// Add or replace a header
  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// Set the body
  pub fn body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  /// Parse a raw response.
  ///
  /// The status line is `VERSION SP STATUS SP REASON`; the reason may be
  /// missing. A non-numeric status or one outside 100..=599 is rejected.
  pub fn from_raw(raw: &[u8]) -> Result<Response> {
    let (head, body) = split_message(raw);
    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();
    let status_line = lines
      .next()
      .ok_or_else(|| Error::malformed_response("empty response"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
      .next()
      .filter(|v| v.starts_with("HTTP/"))
      .ok_or_else(|| Error::malformed_response(format!("bad status line {:?}", status_line)))?;
    let status = parts
      .next()
      .and_then(|s| s.trim().parse::<u16>().ok())
      .filter(|s| (100..=599).contains(s))
      .ok_or_else(|| Error::malformed_response(format!("bad status in {:?}", status_line)))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok(Response {
      version: parse_version(version).unwrap_or(Version::HTTP_11),
      status,
      reason,
      headers: Headers::parse_lines(lines),
      body: body.map(Bytes::copy_from_slice).unwrap_or_default(),
      timestamp: now_millis(),
    })
  }

  /// Serialize as status line, headers in received order, blank line, body.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status.to_string().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.reason().as_bytes());
    http_response.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_response.extend(k.as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    http_response.extend(self.body.as_ref());
    Bytes::from(http_response)
  }

  /// Status code
  pub fn status(&self) -> u16 {
    self.status
  }

  /// Reason phrase, the canonical one if none was received
  pub fn reason(&self) -> &str {
    if self.reason.is_empty() {
      http::StatusCode::from_u16(self.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default()
    } else {
      &self.reason
    }
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

  /// Raw body bytes
  pub fn body_bytes(&self) -> &Bytes {
    &self.body
  }

  /// Replace the body
  pub fn set_body(&mut self, body: impl Into<Bytes>) {
    self.body = body.into();
  }

  /// Capture time in milliseconds since the UNIX epoch
  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  /// Body with chunked framing removed and `gzip`/`deflate` decoded.
  pub fn decoded_body(&self) -> Result<Bytes> {
    let body = if self.headers.is_chunked() {
      dechunk(&self.body)?
    } else {
      self.body.clone()
    };
    let encoding = self
      .headers
      .get("content-encoding")
      .map(|v| v.trim().to_ascii_lowercase());
    match encoding.as_deref() {
      Some("gzip") | Some("x-gzip") => {
        let mut decoded = Vec::new();
        MultiGzDecoder::new(&body[..]).read_to_end(&mut decoded)?;
        Ok(Bytes::from(decoded))
      }
      Some("deflate") => {
        let mut decoded = Vec::new();
        ZlibDecoder::new(&body[..]).read_to_end(&mut decoded)?;
        Ok(Bytes::from(decoded))
      }
      _ => Ok(body),
    }
  }

  /// Decoded body as text, invalid UTF-8 replaced.
  pub fn text(&self) -> Result<String> {
    Ok(String::from_utf8_lossy(&self.decoded_body()?).to_string())
  }
}
