use serde::{Deserialize, Serialize};

/// Ordered header map.
///
/// Names keep the case they were received with and lookups ignore case.
/// Inserting a name that is already present replaces its value in place, so
/// duplicates collapse to the last value while keeping the first position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
  entries: Vec<(String, String)>,
}

impl Headers {
  /// Empty header map
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert or replace a header, returning the previous value.
  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
    let name = name.into();
    let value = value.into();
    match self.position(&name) {
      Some(index) => Some(std::mem::replace(&mut self.entries[index].1, value)),
      None => {
        self.entries.push((name, value));
        None
      }
    }
  }

  /// Case-insensitive lookup
  pub fn get(&self, name: &str) -> Option<&str> {
    self.position(name).map(|index| self.entries[index].1.as_str())
  }

  /// Whether a header is present
  pub fn contains(&self, name: &str) -> bool {
    self.position(name).is_some()
  }

  /// Remove a header, returning its value.
  pub fn remove(&mut self, name: &str) -> Option<String> {
    self
      .position(name)
      .map(|index| self.entries.remove(index).1)
  }

  /// Iterate in received order
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Number of distinct headers
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether there are no headers
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// `Content-Length`, if present and numeric
  pub fn content_length(&self) -> Option<usize> {
    self.get("content-length").and_then(|v| v.trim().parse().ok())
  }

  /// Whether the last transfer coding is `chunked`
  pub fn is_chunked(&self) -> bool {
    self
      .get("transfer-encoding")
      .and_then(|v| v.rsplit(',').next())
      .map(|v| v.trim().eq_ignore_ascii_case("chunked"))
      .unwrap_or(false)
  }

  fn position(&self, name: &str) -> Option<usize> {
    self
      .entries
      .iter()
      .position(|(k, _)| k.eq_ignore_ascii_case(name))
  }

  /// Parse `Name: value` lines; lines without a colon are skipped.
  pub(crate) fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
    let mut headers = Headers::new();
    for line in lines {
      if let Some((name, value)) = line.split_once(':') {
        let name = name.trim();
        if name.is_empty() {
          continue;
        }
        headers.insert(name, value.trim());
      }
    }
    headers
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    let mut headers = Headers::new();
    for (k, v) in iter {
      headers.insert(k, v);
    }
    headers
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lookup_ignores_case() {
    let headers: Headers = [("Content-Type", "text/html")].into_iter().collect();
    assert_eq!(headers.get("content-type"), Some("text/html"));
    assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
    assert!(headers.contains("Content-type"));
  }

  #[test]
  fn duplicates_collapse_last_wins_in_first_position() {
    let headers = Headers::parse_lines(
      ["Set-Cookie: a=1", "Host: example.com", "set-cookie: b=2"].into_iter(),
    );
    assert_eq!(headers.len(), 2);
    assert_eq!(headers.get("Set-Cookie"), Some("b=2"));
    let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
    assert_eq!(names, vec!["Set-Cookie", "Host"]);
  }

  #[test]
  fn lines_without_colon_are_skipped() {
    let headers = Headers::parse_lines(["garbage", "X-A:  spaced  ", ": novalue"].into_iter());
    assert_eq!(headers.len(), 1);
    assert_eq!(headers.get("x-a"), Some("spaced"));
  }

  #[test]
  fn framing_helpers() {
    let mut headers = Headers::new();
    headers.insert("Content-Length", " 42 ");
    headers.insert("Transfer-Encoding", "gzip, Chunked");
    assert_eq!(headers.content_length(), Some(42));
    assert!(headers.is_chunked());
    assert_eq!(headers.remove("transfer-encoding").as_deref(), Some("gzip, Chunked"));
    assert!(!headers.is_chunked());
  }
}
