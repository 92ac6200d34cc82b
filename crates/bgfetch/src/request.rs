//! # Download Requests
//!
//! A request is a URL plus the headers the engine should send. Only the
//! canonical URL takes part in deduplication; headers never do.

use std::fmt;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::EngineError;

/// Canonical string form of a requested URL.
///
/// Two requests whose URLs serialize identically are the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Arc<str>);

impl ResourceId {
    pub fn from_url(url: &Url) -> Self {
        Self(Arc::from(url.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Url> for ResourceId {
    fn from(url: &Url) -> Self {
        Self::from_url(url)
    }
}

/// A download request handed to the transfer engine
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    url: Url,
    headers: HeaderMap,
}

impl DownloadRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
        }
    }

    /// Parse a URL string into a request
    pub fn parse(url: &str) -> Result<Self, EngineError> {
        let url = Url::parse(url)
            .map_err(|e| EngineError::InvalidRequest(format!("{url}: {e}")))?;
        Ok(Self::new(url))
    }

    /// Add a header, silently skipping names or values that are not valid HTTP
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let Ok((name, value)) = header_pair(name.as_ref(), value.as_ref()) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::from_url(&self.url)
    }
}

/// Parse a `Name: Value` header line. Surrounding whitespace is trimmed and
/// the value may be empty.
pub fn parse_header(line: &str) -> Result<(HeaderName, HeaderValue), EngineError> {
    let Some((name, value)) = line.split_once(':') else {
        return Err(EngineError::InvalidRequest(format!(
            "header '{line}' is not in 'Name: Value' form"
        )));
    };
    header_pair(name.trim(), value.trim())
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), EngineError> {
    let name = name
        .parse::<HeaderName>()
        .map_err(|e| EngineError::InvalidRequest(format!("header name '{name}': {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| EngineError::InvalidRequest(format!("value of header '{name}': {e}")))?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_url_same_resource() {
        let a = DownloadRequest::parse("https://example.com/a/../file.bin").unwrap();
        let b = DownloadRequest::parse("https://EXAMPLE.com/file.bin").unwrap();
        assert_eq!(a.resource_id(), b.resource_id());
        assert_eq!(a.resource_id().as_str(), "https://example.com/file.bin");
    }

    #[test]
    fn test_headers_do_not_change_identity() {
        let plain = DownloadRequest::parse("https://example.com/file.bin").unwrap();
        let with_auth = DownloadRequest::parse("https://example.com/file.bin")
            .unwrap()
            .with_header("Authorization", "Bearer token");
        assert_eq!(plain.resource_id(), with_auth.resource_id());
        assert_eq!(with_auth.headers().len(), 1);
    }

    #[test]
    fn test_invalid_header_is_skipped() {
        let request = DownloadRequest::parse("https://example.com/file.bin")
            .unwrap()
            .with_header("bad header", "value");
        assert!(request.headers().is_empty());
    }

    #[test]
    fn test_parse_header_line() {
        let (name, value) = parse_header("Referer: https://example.com/page").unwrap();
        assert_eq!(name, "referer");
        assert_eq!(value, "https://example.com/page");

        let (name, value) = parse_header("X-Empty:").unwrap();
        assert_eq!(name, "x-empty");
        assert_eq!(value, "");

        assert!(matches!(
            parse_header("no colon here"),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_header("Bad Name: value"),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_parse_rejects_relative_url() {
        let err = DownloadRequest::parse("/relative/path").unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }
}
