//! Target URL extraction and per-request relay parameters

use std::borrow::Cow;

use percent_encoding::percent_decode_str;
use url::{form_urlencoded, Url};

use crate::error::{RelayError, Result};

/// `Accept` sent upstream when the target looks like an image
pub const IMAGE_ACCEPT: &str = "image/*,*/*;q=0.8";

/// `Accept` sent upstream for everything else
pub const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Browser-like User-Agent used for every outbound request
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Default image-host substrings
pub const DEFAULT_IMAGE_HOSTS: &[&str] = &[
    "ipfs",
    "arweave",
    "imgur",
    "nftstorage",
    "pinata",
    "cloudinary",
    "shdw-drive",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico", ".avif",
];

/// Extracts the destination URL from an inbound request target
pub struct TargetResolver;

impl TargetResolver {
    /// Resolve the `url` parameter of a raw request target (`/path?url=...`).
    pub fn resolve(raw: &str) -> Result<Url> {
        let value = Self::query_param(raw)
            .or_else(|| Self::scan_raw(raw))
            .ok_or_else(|| RelayError::BadTarget("missing url parameter".to_string()))?;

        let value = Self::decode_once_more(value);

        let url = Url::parse(&value)?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            _ => Err(RelayError::BadTarget("invalid url".to_string())),
        }
    }

    /// `url` from the query string, parsed with form-urlencoded rules
    fn query_param(raw: &str) -> Option<String> {
        let (_, query) = raw.split_once('?')?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "url")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
    }

    /// Fallback scan for `[?&]url=<value>` anywhere in the raw target
    fn scan_raw(raw: &str) -> Option<String> {
        let mut search_from = 0;
        while let Some(pos) = raw[search_from..].find("url=") {
            let start = search_from + pos;
            search_from = start + "url=".len();

            let preceded = raw[..start].ends_with('?') || raw[..start].ends_with('&');
            if !preceded {
                continue;
            }

            let rest = &raw[search_from..];
            let value = rest.split('&').next().unwrap_or_default();
            if value.is_empty() {
                continue;
            }

            return Some(percent_decode_str(value).decode_utf8_lossy().into_owned());
        }
        None
    }

    /// One extra decode pass, adopted only when it changed something and
    /// still mentions `http`. Never loops: anything still encoded after this
    /// fails URL parsing.
    fn decode_once_more(value: String) -> String {
        let decoded = match percent_decode_str(&value).decode_utf8() {
            Ok(Cow::Owned(decoded)) => decoded,
            _ => return value,
        };

        if decoded != value && decoded.contains("http") {
            decoded
        } else {
            value
        }
    }
}

/// Target scheme, which decides the relay path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
}

impl TargetScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetScheme::Http => "http",
            TargetScheme::Https => "https",
        }
    }
}

/// Per-request relay parameters derived from the target URL
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub target: Url,
    pub scheme: TargetScheme,
    pub is_image_hint: bool,
}

impl RelayRequest {
    pub fn new(target: Url, image_hosts: &[String]) -> Result<Self> {
        let scheme = match target.scheme() {
            "http" => TargetScheme::Http,
            "https" => TargetScheme::Https,
            _ => return Err(RelayError::BadTarget("invalid url".to_string())),
        };
        if target.host_str().is_none() {
            return Err(RelayError::BadTarget("invalid url".to_string()));
        }

        let is_image_hint = is_image_target(&target, image_hosts);

        Ok(Self {
            target,
            scheme,
            is_image_hint,
        })
    }

    /// Target host without IPv6 brackets
    pub fn host(&self) -> &str {
        let host = self.target.host_str().unwrap_or_default();
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
    }

    pub fn port(&self) -> u16 {
        self.target
            .port_or_known_default()
            .unwrap_or(match self.scheme {
                TargetScheme::Http => 80,
                TargetScheme::Https => 443,
            })
    }

    /// `Host` header value; the port is kept only when explicit
    pub fn host_header(&self) -> String {
        let host = self.target.host_str().unwrap_or_default();
        match self.target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Authority used in the CONNECT request line
    pub fn connect_authority(&self) -> String {
        format!(
            "{}:{}",
            self.target.host_str().unwrap_or_default(),
            self.port()
        )
    }

    /// Path and query for an origin-form request line
    pub fn origin_form(&self) -> String {
        match self.target.query() {
            Some(query) => format!("{}?{}", self.target.path(), query),
            None => self.target.path().to_string(),
        }
    }

    pub fn accept(&self) -> &'static str {
        if self.is_image_hint {
            IMAGE_ACCEPT
        } else {
            HTML_ACCEPT
        }
    }

    /// Content-Type used when the upstream omits one
    pub fn fallback_content_type(&self) -> &'static str {
        if self.is_image_hint {
            "image/png"
        } else {
            "text/html"
        }
    }
}

fn is_image_target(target: &Url, image_hosts: &[String]) -> bool {
    let path = target.path().to_ascii_lowercase();
    if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return true;
    }

    let host = target.host_str().unwrap_or_default().to_ascii_lowercase();
    image_hosts
        .iter()
        .any(|needle| !needle.is_empty() && host.contains(needle.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &str) -> String {
        form_urlencoded::byte_serialize(value.as_bytes()).collect()
    }

    fn image_hosts() -> Vec<String> {
        DEFAULT_IMAGE_HOSTS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolve_plain_url_is_idempotent() {
        let url = TargetResolver::resolve("/?url=https://x.test/a?b=1").unwrap();
        assert_eq!(url.as_str(), "https://x.test/a?b=1");

        let url = TargetResolver::resolve("/proxy?url=http://plain.test/index.html").unwrap();
        assert_eq!(url.as_str(), "http://plain.test/index.html");
    }

    #[test]
    fn resolve_single_encoded() {
        let inner = "https://x.test/a?b=1";
        let raw = format!("/?url={}", encode(inner));
        assert_eq!(TargetResolver::resolve(&raw).unwrap().as_str(), inner);
    }

    #[test]
    fn resolve_double_encoded() {
        let inner = "https://x.test/a?b=1";
        let raw = format!("/?url={}", encode(&encode(inner)));
        assert_eq!(TargetResolver::resolve(&raw).unwrap().as_str(), inner);
    }

    #[test]
    fn resolve_triple_encoded_is_invalid() {
        let inner = "https://x.test/a";
        let raw = format!("/?url={}", encode(&encode(&encode(inner))));
        let err = TargetResolver::resolve(&raw).unwrap_err();
        assert!(matches!(err, RelayError::BadTarget(ref msg) if msg == "invalid url"));
    }

    #[test]
    fn resolve_missing_url_is_bad_target() {
        for raw in ["/", "/?other=1", "/?url=", "/?url=&x=1"] {
            let err = TargetResolver::resolve(raw).unwrap_err();
            assert!(
                matches!(err, RelayError::BadTarget(ref msg) if msg == "missing url parameter"),
                "{raw}"
            );
        }
    }

    #[test]
    fn resolve_falls_back_to_raw_scan() {
        let url = TargetResolver::resolve("/fetch&url=https%3A%2F%2Fx.test%2Fa").unwrap();
        assert_eq!(url.as_str(), "https://x.test/a");
    }

    #[test]
    fn resolve_rejects_unparseable_and_non_http() {
        for raw in ["/?url=not-a-url", "/?url=ftp://x.test/file", "/?url=javascript:alert(1)"] {
            let err = TargetResolver::resolve(raw).unwrap_err();
            assert!(
                matches!(err, RelayError::BadTarget(ref msg) if msg == "invalid url"),
                "{raw}"
            );
        }
    }

    #[test]
    fn image_hint_from_extension_and_host() {
        let hosts = image_hosts();

        let png = RelayRequest::new(Url::parse("https://example.test/img.PNG").unwrap(), &hosts).unwrap();
        assert!(png.is_image_hint);
        assert_eq!(png.accept(), IMAGE_ACCEPT);
        assert_eq!(png.fallback_content_type(), "image/png");

        let ipfs = RelayRequest::new(Url::parse("https://gateway.ipfs.test/abc").unwrap(), &hosts).unwrap();
        assert!(ipfs.is_image_hint);

        let page = RelayRequest::new(Url::parse("https://example.test/token/abc").unwrap(), &hosts).unwrap();
        assert!(!page.is_image_hint);
        assert_eq!(page.accept(), HTML_ACCEPT);
        assert_eq!(page.fallback_content_type(), "text/html");
    }

    #[test]
    fn relay_request_addressing() {
        let https = RelayRequest::new(Url::parse("https://example.test/a/b?c=d").unwrap(), &[]).unwrap();
        assert_eq!(https.scheme, TargetScheme::Https);
        assert_eq!(https.port(), 443);
        assert_eq!(https.host_header(), "example.test");
        assert_eq!(https.connect_authority(), "example.test:443");
        assert_eq!(https.origin_form(), "/a/b?c=d");

        let http = RelayRequest::new(Url::parse("http://example.test:8080/").unwrap(), &[]).unwrap();
        assert_eq!(http.scheme, TargetScheme::Http);
        assert_eq!(http.port(), 8080);
        assert_eq!(http.host_header(), "example.test:8080");
        assert_eq!(http.origin_form(), "/");
    }
}
