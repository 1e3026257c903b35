//! HTTP/1.x message framing on async streams
//!
//! The proxy forwards raw bytes, so everything here reads a complete message
//! and hands back exactly what was received. Parsing into [`Request`] and
//! [`Response`] happens afterwards and is best-effort.
//!
//! [`Request`]: crate::Request
//! [`Response`]: crate::Response
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::headers::Headers;

const CR_LF_CR_LF: &[u8] = b"\r\n\r\n";

/// Split a raw message into head and body at the first CRLFCRLF.
pub(crate) fn split_message(raw: &[u8]) -> (&[u8], Option<&[u8]>) {
  match raw.windows(CR_LF_CR_LF.len()).position(|w| w == CR_LF_CR_LF) {
    Some(index) => (&raw[..index], Some(&raw[index + CR_LF_CR_LF.len()..])),
    None => (raw, None),
  }
}

/// Remove chunked transfer coding from a body.
pub(crate) fn dechunk(raw: &[u8]) -> Result<Bytes> {
  let mut body = Vec::new();
  let mut rest = raw;
  loop {
    let line_end = rest
      .iter()
      .position(|b| *b == b'\n')
      .ok_or_else(|| Error::malformed_response("unterminated chunk size"))?;
    let size = parse_chunk_size(&rest[..line_end])?;
    rest = &rest[line_end + 1..];
    if size == 0 {
      break;
    }
    if rest.len() < size {
      return Err(Error::malformed_response("truncated chunk"));
    }
    body.extend_from_slice(&rest[..size]);
    rest = &rest[size..];
    rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);
  }
  Ok(Bytes::from(body))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
  let line = String::from_utf8_lossy(line);
  let size = line.split(';').next().unwrap_or_default().trim();
  usize::from_str_radix(size, 16)
    .map_err(|_| Error::malformed_response(format!("bad chunk size {:?}", size)))
}

/// Lenient view of a message head, enough to frame and route a message even
/// when it would not parse as a [`crate::Request`].
#[derive(Debug, Clone, Default)]
pub(crate) struct MessageHead {
  pub(crate) start_line: String,
  pub(crate) headers: Headers,
}

impl MessageHead {
  pub(crate) fn parse(head: &[u8]) -> MessageHead {
    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines().skip_while(|l| l.trim().is_empty());
    let start_line = lines.next().unwrap_or_default().trim().to_string();
    MessageHead {
      start_line,
      headers: Headers::parse_lines(lines),
    }
  }

  fn token(&self, index: usize) -> &str {
    self.start_line.split(' ').nth(index).unwrap_or_default()
  }

  /// First token of a request line
  pub(crate) fn method(&self) -> &str {
    self.token(0)
  }

  /// Second token of a request line
  pub(crate) fn target(&self) -> &str {
    self.token(1)
  }

  /// Status of a response line
  pub(crate) fn status(&self) -> Option<u16> {
    self.token(1).parse().ok()
  }
}

/// A message as read from the wire.
#[derive(Debug)]
pub(crate) struct RawMessage {
  pub(crate) raw: Vec<u8>,
  pub(crate) head: MessageHead,
  /// Offset of the final message; non-zero when interim 1xx responses preceded it.
  pub(crate) start: usize,
  /// `false` when the body outgrew the limits or its framing could not be
  /// followed; the rest of the message is still on the stream.
  pub(crate) complete: bool,
}

impl RawMessage {
  /// The final message, without interim responses
  pub(crate) fn message(&self) -> &[u8] {
    &self.raw[self.start..]
  }
}

/// Framing limits taken from the proxy configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct FramingLimits {
  pub(crate) read_timeout: Duration,
  pub(crate) max_head: usize,
  pub(crate) max_body: usize,
}

impl From<&ProxyConfig> for FramingLimits {
  fn from(config: &ProxyConfig) -> Self {
    FramingLimits {
      read_timeout: config.read_timeout(),
      max_head: config.max_head_size,
      max_body: config.max_body_size,
    }
  }
}

/// Whether a body was read to its end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
  Complete,
  Unframed,
}

/// Reads whole HTTP/1.x messages from a buffered stream.
pub(crate) struct MessageReader<S> {
  reader: BufReader<S>,
  limits: FramingLimits,
}

impl<S: AsyncRead + Unpin> MessageReader<S> {
  pub(crate) fn new(stream: S, limits: FramingLimits) -> Self {
    MessageReader {
      reader: BufReader::new(stream),
      limits,
    }
  }

  /// The underlying stream, e.g. to write a reply
  pub(crate) fn get_mut(&mut self) -> &mut S {
    self.reader.get_mut()
  }

  /// The buffered stream, for relaying whatever is left unread
  pub(crate) fn buffered_mut(&mut self) -> &mut BufReader<S> {
    &mut self.reader
  }

  /// Give back the buffered stream; buffered bytes are not lost.
  pub(crate) fn into_inner(self) -> BufReader<S> {
    self.reader
  }

  /// Read one line of at most `limit` bytes; a longer line is cut at `limit`.
  async fn read_line(&mut self, buf: &mut Vec<u8>, limit: usize) -> Result<usize> {
    let mut bounded = (&mut self.reader).take(limit as u64);
    tokio::time::timeout(self.limits.read_timeout, bounded.read_until(b'\n', buf))
      .await
      .map_err(|_| Error::Timeout("read"))?
      .map_err(Error::from)
  }

  /// Read a message head up to and including the blank line.
  ///
  /// Returns `None` when the peer closed before sending anything.
  pub(crate) async fn read_head(&mut self) -> Result<Option<(Vec<u8>, MessageHead)>> {
    let mut raw = Vec::new();
    loop {
      let mut line = Vec::new();
      let limit = self.limits.max_head.saturating_sub(raw.len()) + 1;
      let n = self.read_line(&mut line, limit).await?;
      if n == 0 {
        break;
      }
      let blank = line == b"\r\n" || line == b"\n";
      if blank && raw.is_empty() {
        // stray CRLF between messages
        continue;
      }
      raw.extend_from_slice(&line);
      if raw.len() > self.limits.max_head {
        return Err(Error::malformed_request("message head too large"));
      }
      if blank {
        break;
      }
    }
    if raw.is_empty() {
      return Ok(None);
    }
    let head = MessageHead::parse(&raw);
    Ok(Some((raw, head)))
  }

  /// Read one request including its body.
  pub(crate) async fn read_request(&mut self) -> Result<Option<RawMessage>> {
    match self.read_head().await? {
      Some((raw, head)) => self.read_request_body(raw, head).await.map(Some),
      None => Ok(None),
    }
  }

  /// Finish a request whose head was already read.
  pub(crate) async fn read_request_body(
    &mut self,
    mut raw: Vec<u8>,
    head: MessageHead,
  ) -> Result<RawMessage> {
    let body = if head.headers.is_chunked() {
      self.read_chunked(&mut raw).await?
    } else if let Some(length) = head.headers.content_length() {
      self.read_length(&mut raw, length).await?
    } else {
      Body::Complete
    };
    Ok(RawMessage {
      raw,
      head,
      start: 0,
      complete: body == Body::Complete,
    })
  }

  /// Read one response including its body.
  ///
  /// Interim 1xx responses are kept in the raw bytes and skipped over.
  /// Without `Content-Length` or chunked coding the body runs until the peer
  /// closes or a read times out.
  pub(crate) async fn read_response(&mut self, request_method: &str) -> Result<RawMessage> {
    let mut raw = Vec::new();
    loop {
      let start = raw.len();
      let (head_raw, head) = match self.read_head().await? {
        Some(h) => h,
        None if start == 0 => {
          return Err(Error::malformed_response("upstream closed without a response"))
        }
        None => return Err(Error::malformed_response("upstream closed after interim response")),
      };
      raw.extend_from_slice(&head_raw);
      let status = head.status().unwrap_or(200);
      if (100..200).contains(&status) && status != 101 {
        continue;
      }
      let no_body = request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304;
      let body = if no_body {
        Body::Complete
      } else if head.headers.is_chunked() {
        self.read_chunked(&mut raw).await?
      } else if let Some(length) = head.headers.content_length() {
        self.read_length(&mut raw, length).await?
      } else {
        self.read_to_close(&mut raw).await?
      };
      return Ok(RawMessage {
        raw,
        head,
        start,
        complete: body == Body::Complete,
      });
    }
  }

  async fn read_length(&mut self, raw: &mut Vec<u8>, length: usize) -> Result<Body> {
    if length > self.limits.max_body {
      tracing::debug!(length, limit = self.limits.max_body, "body exceeds limit");
      return Ok(Body::Unframed);
    }
    let mut remaining = length;
    let mut buffer = vec![0u8; 8192];
    while remaining > 0 {
      let want = remaining.min(buffer.len());
      let n = tokio::time::timeout(self.limits.read_timeout, self.reader.read(&mut buffer[..want]))
        .await
        .map_err(|_| Error::Timeout("read"))??;
      if n == 0 {
        // short body, forwarded as received
        break;
      }
      raw.extend_from_slice(&buffer[..n]);
      remaining -= n;
    }
    Ok(Body::Complete)
  }

  async fn read_chunked(&mut self, raw: &mut Vec<u8>) -> Result<Body> {
    let body_start = raw.len();
    let line_limit = self.limits.max_head;
    loop {
      let mut size_line = Vec::new();
      if self.read_line(&mut size_line, line_limit).await? == 0 {
        return Ok(Body::Complete);
      }
      raw.extend_from_slice(&size_line);
      let size = match parse_chunk_size(&size_line) {
        Ok(size) => size,
        Err(_) => return Ok(Body::Unframed),
      };
      if size == 0 {
        // trailers, terminated by a blank line
        loop {
          let mut trailer = Vec::new();
          let n = self.read_line(&mut trailer, line_limit).await?;
          raw.extend_from_slice(&trailer);
          if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
            return Ok(Body::Complete);
          }
        }
      }
      let room = self.limits.max_body.saturating_sub(raw.len() - body_start);
      if size > room {
        tracing::debug!(size, room, "chunked body exceeds limit");
        return Ok(Body::Unframed);
      }
      self.read_length(raw, size).await?;
      let mut chunk_end = Vec::new();
      self.read_line(&mut chunk_end, line_limit).await?;
      raw.extend_from_slice(&chunk_end);
    }
  }

  async fn read_to_close(&mut self, raw: &mut Vec<u8>) -> Result<Body> {
    let body_start = raw.len();
    let mut buffer = vec![0u8; 8192];
    loop {
      match tokio::time::timeout(self.limits.read_timeout, self.reader.read(&mut buffer)).await {
        Ok(Ok(0)) | Err(_) => return Ok(Body::Complete),
        Ok(Ok(n)) => {
          raw.extend_from_slice(&buffer[..n]);
          if raw.len() - body_start > self.limits.max_body {
            tracing::debug!(limit = self.limits.max_body, "unframed body exceeds limit");
            return Ok(Body::Unframed);
          }
        }
        Ok(Err(e)) => return Err(e.into()),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn limits() -> FramingLimits {
    FramingLimits {
      read_timeout: Duration::from_millis(200),
      max_head: 1024,
      max_body: 4096,
    }
  }

  fn reader(bytes: &[u8]) -> MessageReader<Cursor<Vec<u8>>> {
    MessageReader::new(Cursor::new(bytes.to_vec()), limits())
  }

  #[test]
  fn split_on_first_blank_line() {
    let (head, body) = split_message(b"GET / HTTP/1.1\r\nA: b\r\n\r\nx\r\n\r\ny");
    assert_eq!(head, b"GET / HTTP/1.1\r\nA: b");
    assert_eq!(body, Some(&b"x\r\n\r\ny"[..]));
    assert_eq!(split_message(b"GET / HTTP/1.1"), (&b"GET / HTTP/1.1"[..], None));
  }

  #[test]
  fn dechunk_strips_framing_and_extensions() {
    let body = dechunk(b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n").unwrap();
    assert_eq!(body.as_ref(), b"Wikipedia");
    assert!(dechunk(b"zz\r\n").is_err());
    assert!(dechunk(b"10\r\nshort").is_err());
  }

  #[tokio::test]
  async fn reads_request_with_content_length_and_leaves_the_rest() {
    let mut r = reader(b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n");
    let first = r.read_request().await.unwrap().unwrap();
    assert_eq!(first.raw, b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
    assert_eq!(first.head.method(), "POST");
    let second = r.read_request().await.unwrap().unwrap();
    assert_eq!(second.head.target(), "/b");
    assert!(r.read_request().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn keeps_chunked_framing_verbatim() {
    let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
    let mut r = reader(wire);
    let response = r.read_response("GET").await.unwrap();
    assert_eq!(response.raw, wire.to_vec());
    assert!(response.complete);
  }

  #[tokio::test]
  async fn unframed_body_reads_to_close() {
    let wire = b"HTTP/1.0 200 OK\r\n\r\nstreamed until close";
    let mut r = reader(wire);
    let response = r.read_response("GET").await.unwrap();
    assert_eq!(response.raw, wire.to_vec());
  }

  #[tokio::test]
  async fn head_and_no_content_have_no_body() {
    let mut r = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
    let response = r.read_response("HEAD").await.unwrap();
    assert!(response.raw.ends_with(b"\r\n\r\n"));
    let mut r = reader(b"HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 200 OK\r\n\r\n");
    let response = r.read_response("GET").await.unwrap();
    assert_eq!(response.raw, b"HTTP/1.1 204 No Content\r\n\r\n");
  }

  #[tokio::test]
  async fn interim_responses_are_kept_but_skipped() {
    let wire = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
    let mut r = reader(wire);
    let response = r.read_response("POST").await.unwrap();
    assert_eq!(response.raw, wire.to_vec());
    assert_eq!(response.head.status(), Some(201));
    assert!(response.message().starts_with(b"HTTP/1.1 201"));
  }

  #[tokio::test]
  async fn oversized_head_is_rejected() {
    let mut wire = b"GET / HTTP/1.1\r\n".to_vec();
    wire.extend(std::iter::repeat(b"X-Pad: aaaaaaaaaaaaaaaa\r\n".to_vec()).take(100).flatten());
    let mut r = reader(&wire);
    assert!(r.read_request().await.is_err());
  }

  #[tokio::test]
  async fn endless_line_is_cut_at_the_head_limit() {
    let mut r = MessageReader::new(tokio::io::repeat(b'a'), limits());
    assert!(matches!(r.read_head().await, Err(Error::MalformedRequest(_))));
  }

  #[tokio::test]
  async fn bodies_over_the_limit_are_left_on_the_stream() {
    let head = b"HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n";
    let mut wire = head.to_vec();
    wire.extend_from_slice(b"abc");
    let mut r = reader(&wire);
    let response = r.read_response("GET").await.unwrap();
    assert!(!response.complete);
    assert_eq!(response.raw, head.to_vec());
    let mut rest = Vec::new();
    r.buffered_mut().read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"abc");
  }

  #[tokio::test]
  async fn huge_chunk_size_does_not_overflow() {
    let framed = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\n";
    let mut wire = framed.to_vec();
    wire.extend_from_slice(b"abc");
    let mut r = reader(&wire);
    let response = r.read_response("GET").await.unwrap();
    assert!(!response.complete);
    assert_eq!(response.raw, framed.to_vec());
  }

  #[tokio::test]
  async fn bad_chunk_size_leaves_the_rest_unread() {
    let mut r = reader(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nhello");
    let request = r.read_request().await.unwrap().unwrap();
    assert!(!request.complete);
    assert!(request.raw.ends_with(b"\r\n\r\nzz\r\n"));
    let mut rest = Vec::new();
    r.buffered_mut().read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"hello");
  }

  #[tokio::test]
  async fn request_body_over_the_limit_is_not_read() {
    let mut r = reader(b"POST / HTTP/1.1\r\nContent-Length: 10000\r\n\r\nxyz");
    let request = r.read_request().await.unwrap().unwrap();
    assert!(!request.complete);
    assert_eq!(request.head.method(), "POST");
  }

  #[tokio::test]
  async fn empty_stream_is_none() {
    let mut r = reader(b"");
    assert!(r.read_request().await.unwrap().is_none());
    let mut r = reader(b"");
    assert!(r.read_response("GET").await.is_err());
  }
}
