//! Parsed HTTP request and response values.
//!
//! These are the structured views the proxy engine hands to the hook layer.
//! Bodies are not buffered here; a message carries its [`BodyFraming`] and
//! the engine streams the payload separately.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::headers::HeaderMap;

/// Errors for message component parsing.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The method token was empty or contained invalid characters.
    #[error("invalid method: {0:?}")]
    InvalidMethod(String),

    /// The HTTP version string was not recognized.
    #[error("invalid HTTP version: {0:?}")]
    InvalidVersion(String),
}

/// HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    /// Any other token, preserved verbatim.
    Other(String),
}

impl Method {
    /// Returns the method as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Other(s) => s,
        }
    }

    /// Checks for the CONNECT method (tunnel establishment).
    pub fn is_connect(&self) -> bool {
        matches!(self, Method::Connect)
    }
}

impl FromStr for Method {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(MessageError::InvalidMethod(s.to_string()));
        }
        Ok(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            other => Method::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// Returns the version as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl FromStr for Version {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            other => Err(MessageError::InvalidVersion(other.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URL scheme of the intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// The well-known port for this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The target of a request: scheme, host, port, and origin-form path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path plus optional query, always starting with `/` (or `*` for
    /// OPTIONS in asterisk form).
    pub path_and_query: String,
}

impl Target {
    pub fn new(
        scheme: Scheme,
        host: impl Into<String>,
        port: u16,
        path_and_query: impl Into<String>,
    ) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            path_and_query: path_and_query.into(),
        }
    }

    /// Returns `host:port`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reassembles the full URL, omitting the port when it is the scheme
    /// default.
    pub fn url(&self) -> String {
        if self.port == self.scheme.default_port() {
            format!("{}://{}{}", self.scheme.as_str(), self.host, self.path_and_query)
        } else {
            format!(
                "{}://{}:{}{}",
                self.scheme.as_str(),
                self.host,
                self.port,
                self.path_and_query
            )
        }
    }

    /// The path component without the query string.
    pub fn path(&self) -> &str {
        match self.path_and_query.split_once('?') {
            Some((path, _)) => path,
            None => &self.path_and_query,
        }
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the header block.
    None,
    /// Exactly this many bytes follow.
    ContentLength(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Body runs until the peer closes the connection (responses only).
    Close,
}

impl BodyFraming {
    /// Whether any body bytes follow the head.
    pub fn has_body(&self) -> bool {
        !matches!(self, BodyFraming::None | BodyFraming::ContentLength(0))
    }
}

/// A parsed HTTP request.
///
/// Mutable only by the interception hook before forwarding; the engine
/// treats it as immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub target: Target,
    pub version: Version,
    pub headers: HeaderMap,
    pub framing: BodyFraming,
}

impl Request {
    /// The full URL of the request.
    pub fn url(&self) -> String {
        self.target.url()
    }

    /// The target hostname.
    pub fn host(&self) -> &str {
        &self.target.host
    }

    /// The path component without the query string.
    pub fn path(&self) -> &str {
        self.target.path()
    }

    /// Whether this request asks for the connection to close afterwards.
    pub fn wants_close(&self) -> bool {
        wants_close(&self.headers, self.version)
    }
}

/// A parsed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub framing: BodyFraming,
}

impl Response {
    /// Whether this response ends connection reuse.
    pub fn wants_close(&self) -> bool {
        matches!(self.framing, BodyFraming::Close) || wants_close(&self.headers, self.version)
    }
}

/// Connection-reuse semantics: HTTP/1.1 defaults to keep-alive unless
/// `Connection: close`; HTTP/1.0 closes unless `Connection: keep-alive`.
fn wants_close(headers: &HeaderMap, version: Version) -> bool {
    let connection = headers.get("Connection").unwrap_or("");
    match version {
        Version::Http11 => connection.eq_ignore_ascii_case("close"),
        Version::Http10 => !connection.eq_ignore_ascii_case("keep-alive"),
    }
}
