//! Response header metadata handed to response transformers.

use std::fmt;
use std::str::FromStr;

use crate::error::StreamError;

/// A header as a name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered collection of headers.
///
/// Preserves insertion order and allows duplicate names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<Header>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header::new(name, value));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// First value matching `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `Content-Length`, when present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }

    /// Parsed `Content-Range`. A malformed value is reported as an error.
    pub fn content_range(&self) -> Option<Result<ContentRange, StreamError>> {
        self.get("content-range").map(str::parse)
    }
}

impl FromIterator<Header> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = Header>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(n, v)| Header::new(n, v)).collect(),
        }
    }
}

/// A `Content-Range` value of the form `bytes <start>-<end>/<total|*>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Result<Self, StreamError> {
        value.parse()
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl FromStr for ContentRange {
    type Err = StreamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || StreamError::Client(format!("malformed content-range: {value:?}"));

        let rest = value
            .trim()
            .strip_prefix("bytes")
            .ok_or_else(malformed)?
            .trim_start();
        let (range, total) = rest.split_once('/').ok_or_else(malformed)?;
        let (start, end) = range.split_once('-').ok_or_else(malformed)?;
        let start: u64 = start.trim().parse().map_err(|_| malformed())?;
        let end: u64 = end.trim().parse().map_err(|_| malformed())?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().map_err(|_| malformed())?),
        };
        if end < start || total.is_some_and(|t| end >= t) {
            return Err(malformed());
        }
        Ok(Self { start, end, total })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{}", self.start, self.end, total),
            None => write!(f, "bytes {}-{}/*", self.start, self.end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_insert_and_get() {
        let mut map = HeaderMap::new();
        map.insert("Content-Type", "text/html");
        assert_eq!(map.get("content-type"), Some("text/html"));
        assert_eq!(map.get("CONTENT-TYPE"), Some("text/html"));
        assert_eq!(map.get("x-missing"), None);
    }

    #[test]
    fn header_map_duplicate_headers() {
        let map = HeaderMap::new()
            .with("x-amz-meta", "a")
            .with("X-Amz-Meta", "b");
        assert_eq!(map.get("x-amz-meta"), Some("a"));
        assert_eq!(map.get_all("x-amz-meta"), vec!["a", "b"]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn content_length_parses_numeric_value() {
        let map = HeaderMap::new().with("Content-Length", " 1024 ");
        assert_eq!(map.content_length(), Some(1024));
        let bad = HeaderMap::new().with("Content-Length", "lots");
        assert_eq!(bad.content_length(), None);
    }

    #[test]
    fn content_range_parses() {
        let range: ContentRange = "bytes 100-199/1000".parse().unwrap();
        assert_eq!(range.start, 100);
        assert_eq!(range.end, 199);
        assert_eq!(range.total, Some(1000));
        assert_eq!(range.len(), 100);
        assert_eq!(range.to_string(), "bytes 100-199/1000");
    }

    #[test]
    fn content_range_with_unknown_total() {
        let range: ContentRange = "bytes 0-9/*".parse().unwrap();
        assert_eq!(range.total, None);
    }

    #[test]
    fn content_range_rejects_garbage() {
        for value in ["items 0-1/2", "bytes 5-1/10", "bytes 0-10/10", "bytes 0/10", "bytes a-b/c"] {
            assert!(
                matches!(value.parse::<ContentRange>(), Err(StreamError::Client(_))),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn header_map_content_range() {
        let map = HeaderMap::new().with("Content-Range", "bytes 8-15/16");
        let range = map.content_range().unwrap().unwrap();
        assert_eq!(range, ContentRange::parse("bytes 8-15/16").unwrap());
        assert_eq!(range.start, 8);
        assert!(HeaderMap::new().content_range().is_none());
    }
}
