//! HTTP/1.1 message pipeline.
//!
//! Parses requests from the client-facing stream and responses from the
//! origin-facing stream into the structured values the hook layer sees,
//! and serializes them back out. Bodies are never buffered whole: they are
//! copied chunk-at-a-time from reader to writer according to the message
//! framing.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use signet_core::{BodyFraming, HeaderMap, Method, Request, Response, Scheme, Target, Version};

use crate::error::ParseError;

/// Upper bound on a request or response header block.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a single chunk-size line.
const MAX_CHUNK_LINE: usize = 1024;

/// Where a request was read from, for target resolution.
///
/// Inside an intercepted tunnel the scheme and authority are fixed by the
/// CONNECT that opened it; a plaintext proxy client supplies them in the
/// request line or the `Host` header.
#[derive(Debug, Clone)]
pub enum RequestScope {
    /// Plaintext client talking to the proxy directly.
    Proxy,
    /// Inside a TLS tunnel established for `host:port`.
    Tunnel { host: String, port: u16 },
}

/// Incremental HTTP reader over a buffered async stream.
pub struct MessageReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Releases the inner stream along with any bytes read past the last
    /// parsed message.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.io, self.buf)
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.io.read_buf(&mut self.buf).await
    }

    /// Reads one CRLF- (or bare-LF-) terminated line, without the ending.
    ///
    /// `Ok(None)` means the stream ended cleanly before any byte of the
    /// line; EOF mid-line is an error.
    async fn read_line(&mut self, max: usize) -> Result<Option<String>, ParseError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                let line = String::from_utf8(line.to_vec())
                    .map_err(|_| ParseError::InvalidHeader("non-UTF-8 header bytes".into()))?;
                return Ok(Some(line));
            }
            if self.buf.len() > max {
                return Err(ParseError::HeadTooLarge);
            }
            let empty = self.buf.is_empty();
            if self.fill().await? == 0 {
                return if empty {
                    Ok(None)
                } else {
                    Err(ParseError::UnexpectedEof)
                };
            }
        }
    }

    /// Parses one request head from the stream.
    ///
    /// Returns `Ok(None)` when the client closed cleanly between requests
    /// (normal end of a keep-alive connection).
    pub async fn read_request(
        &mut self,
        scope: &RequestScope,
    ) -> Result<Option<Request>, ParseError> {
        let line = match self.read_line(MAX_HEAD_BYTES).await? {
            Some(line) => line,
            None => return Ok(None),
        };

        let mut parts = line.splitn(3, ' ');
        let (method, raw_target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) if !t.is_empty() && !v.contains(' ') => (m, t, v),
            _ => return Err(ParseError::InvalidRequestLine(line.clone())),
        };
        let method: Method = method.parse()?;
        let version: Version = version.parse()?;
        let raw_target = raw_target.to_string();

        let headers = self.read_headers().await?;
        let target = resolve_target(&method, &raw_target, &headers, scope)?;
        let framing = if method.is_connect() {
            BodyFraming::None
        } else {
            request_framing(&headers)?
        };

        Ok(Some(Request {
            method,
            target,
            version,
            headers,
            framing,
        }))
    }

    /// Parses one response head from the stream.
    ///
    /// The request method is needed to frame the body (HEAD responses carry
    /// none regardless of their headers).
    pub async fn read_response(&mut self, request_method: &Method) -> Result<Response, ParseError> {
        let line = self
            .read_line(MAX_HEAD_BYTES)
            .await?
            .ok_or(ParseError::UnexpectedEof)?;

        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() < 2 {
            return Err(ParseError::InvalidStatusLine(line.clone()));
        }
        let version: Version = parts[0].parse()?;
        let status: u16 = match parts[1].parse() {
            Ok(s) if (100..=599).contains(&s) => s,
            _ => return Err(ParseError::InvalidStatusLine(line.clone())),
        };
        let reason = parts.get(2).copied().unwrap_or("").to_string();

        let headers = self.read_headers().await?;
        let framing = response_framing(status, request_method, &headers)?;

        Ok(Response {
            version,
            status,
            reason,
            headers,
            framing,
        })
    }

    async fn read_headers(&mut self) -> Result<HeaderMap, ParseError> {
        let mut headers = HeaderMap::new();
        let mut remaining = MAX_HEAD_BYTES;
        loop {
            let line = self
                .read_line(remaining)
                .await?
                .ok_or(ParseError::UnexpectedEof)?;
            if line.is_empty() {
                return Ok(headers);
            }
            remaining = remaining
                .checked_sub(line.len() + 2)
                .ok_or(ParseError::HeadTooLarge)?;
            let colon = match line.find(':') {
                Some(i) => i,
                None => return Err(ParseError::InvalidHeader(line)),
            };
            let name = &line[..colon];
            if name.is_empty() || name.chars().any(|c| c.is_ascii_whitespace()) {
                return Err(ParseError::InvalidHeader(line));
            }
            let value = line[colon + 1..].trim().to_string();
            let name = name.to_string();
            headers.append(name, value);
        }
    }

    /// Streams a message body to `dst` according to `framing`, returning
    /// the number of payload bytes copied.
    pub async fn copy_body<W>(
        &mut self,
        framing: BodyFraming,
        dst: &mut W,
    ) -> Result<u64, ParseError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match framing {
            BodyFraming::None => Ok(0),
            BodyFraming::ContentLength(n) => self.copy_exact(n, dst).await,
            BodyFraming::Chunked => self.copy_chunked(dst).await,
            BodyFraming::Close => self.copy_to_eof(dst).await,
        }
    }

    async fn copy_exact<W>(&mut self, mut remaining: u64, dst: &mut W) -> Result<u64, ParseError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let total = remaining;
        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(ParseError::UnexpectedEof);
            }
            let take = (self.buf.len() as u64).min(remaining) as usize;
            let bytes = self.buf.split_to(take);
            dst.write_all(&bytes).await?;
            remaining -= take as u64;
        }
        Ok(total)
    }

    async fn copy_to_eof<W>(&mut self, dst: &mut W) -> Result<u64, ParseError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;
        loop {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Ok(total);
            }
            let bytes = self.buf.split_to(self.buf.len());
            total += bytes.len() as u64;
            dst.write_all(&bytes).await?;
        }
    }

    /// Copies a chunked body, re-framing chunk-for-chunk and forwarding any
    /// trailer section verbatim.
    async fn copy_chunked<W>(&mut self, dst: &mut W) -> Result<u64, ParseError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;
        loop {
            let line = self
                .read_line(MAX_CHUNK_LINE)
                .await?
                .ok_or(ParseError::UnexpectedEof)?;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = u64::from_str_radix(size_str, 16)
                .map_err(|_| ParseError::InvalidChunk(format!("bad chunk size {size_str:?}")))?;
            if size == 0 {
                break;
            }
            dst.write_all(format!("{size:x}\r\n").as_bytes()).await?;
            self.copy_exact(size, dst).await?;
            total += size;
            self.expect_crlf().await?;
            dst.write_all(b"\r\n").await?;
        }

        dst.write_all(b"0\r\n").await?;
        loop {
            let line = self
                .read_line(MAX_HEAD_BYTES)
                .await?
                .ok_or(ParseError::UnexpectedEof)?;
            if line.is_empty() {
                break;
            }
            dst.write_all(line.as_bytes()).await?;
            dst.write_all(b"\r\n").await?;
        }
        dst.write_all(b"\r\n").await?;
        Ok(total)
    }

    async fn expect_crlf(&mut self) -> Result<(), ParseError> {
        while self.buf.len() < 2 {
            if self.fill().await? == 0 {
                return Err(ParseError::UnexpectedEof);
            }
        }
        let bytes = self.buf.split_to(2);
        if &bytes[..] != b"\r\n" {
            return Err(ParseError::InvalidChunk("missing CRLF after chunk".into()));
        }
        Ok(())
    }
}

fn resolve_target(
    method: &Method,
    raw: &str,
    headers: &HeaderMap,
    scope: &RequestScope,
) -> Result<Target, ParseError> {
    if method.is_connect() {
        let (host, port) = parse_authority(raw, 443)?;
        return Ok(Target::new(Scheme::Https, host, port, ""));
    }

    if let Some(rest) = raw.strip_prefix("http://") {
        return absolute_target(Scheme::Http, rest);
    }
    if let Some(rest) = raw.strip_prefix("https://") {
        return absolute_target(Scheme::Https, rest);
    }

    if raw.starts_with('/') || raw == "*" {
        return match scope {
            RequestScope::Tunnel { host, port } => {
                Ok(Target::new(Scheme::Https, host.clone(), *port, raw))
            }
            RequestScope::Proxy => {
                let host_header = headers
                    .get("Host")
                    .ok_or_else(|| ParseError::InvalidRequestLine(raw.to_string()))?;
                let (host, port) = parse_authority(host_header, 80)?;
                Ok(Target::new(Scheme::Http, host, port, raw))
            }
        };
    }

    Err(ParseError::InvalidRequestLine(raw.to_string()))
}

fn absolute_target(scheme: Scheme, rest: &str) -> Result<Target, ParseError> {
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = parse_authority(authority, scheme.default_port())?;
    Ok(Target::new(scheme, host, port, path))
}

fn parse_authority(s: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    if s.is_empty() {
        return Err(ParseError::InvalidRequestLine(s.to_string()));
    }
    if let Some(rest) = s.strip_prefix('[') {
        // Bracketed IPv6 literal
        let end = rest
            .find(']')
            .ok_or_else(|| ParseError::InvalidRequestLine(s.to_string()))?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ParseError::InvalidRequestLine(s.to_string()))?,
            None if rest[end + 1..].is_empty() => default_port,
            None => return Err(ParseError::InvalidRequestLine(s.to_string())),
        };
        return Ok((host, port));
    }
    match s.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Ok((s.to_string(), default_port)),
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ParseError::InvalidRequestLine(s.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((s.to_string(), default_port)),
    }
}

/// Message framing for a request head.
fn request_framing(headers: &HeaderMap) -> Result<BodyFraming, ParseError> {
    let te_chunked = transfer_encoding_chunked(headers);
    let content_length = content_length(headers)?;
    match (te_chunked, content_length) {
        // Conflicting or incomplete framing is rejected outright
        // (RFC 7230 §3.3.3 request-smuggling rules).
        (Some(true), None) => Ok(BodyFraming::Chunked),
        (Some(true), Some(_)) => Err(ParseError::InvalidFraming),
        (Some(false), _) => Err(ParseError::InvalidFraming),
        (None, Some(n)) => Ok(BodyFraming::ContentLength(n)),
        (None, None) => Ok(BodyFraming::None),
    }
}

/// Message framing for a response head.
fn response_framing(
    status: u16,
    request_method: &Method,
    headers: &HeaderMap,
) -> Result<BodyFraming, ParseError> {
    if *request_method == Method::Head
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyFraming::None);
    }
    match (transfer_encoding_chunked(headers), content_length(headers)?) {
        (Some(true), _) => Ok(BodyFraming::Chunked),
        (Some(false), _) => Ok(BodyFraming::Close),
        (None, Some(n)) => Ok(BodyFraming::ContentLength(n)),
        (None, None) => Ok(BodyFraming::Close),
    }
}

/// `Some(true)` if Transfer-Encoding is present with `chunked` as the final
/// coding, `Some(false)` if present without it, `None` if absent.
fn transfer_encoding_chunked(headers: &HeaderMap) -> Option<bool> {
    let mut codings = Vec::new();
    let mut present = false;
    for value in headers.get_all("Transfer-Encoding") {
        present = true;
        codings.extend(value.split(',').map(|c| c.trim().to_ascii_lowercase()));
    }
    if !present {
        return None;
    }
    Some(codings.last().map(|c| c == "chunked").unwrap_or(false))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut result = None;
    for value in headers.get_all("Content-Length") {
        let n: u64 = value.trim().parse().map_err(|_| ParseError::InvalidFraming)?;
        match result {
            None => result = Some(n),
            Some(prev) if prev == n => {}
            Some(_) => return Err(ParseError::InvalidFraming),
        }
    }
    Ok(result)
}

/// Serializes a request head in origin-form.
pub async fn write_request_head<W>(dst: &mut W, req: &Request) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let path = if req.target.path_and_query.is_empty() {
        "/"
    } else {
        req.target.path_and_query.as_str()
    };
    let mut head = String::with_capacity(256);
    head.push_str(req.method.as_str());
    head.push(' ');
    head.push_str(path);
    head.push(' ');
    head.push_str(req.version.as_str());
    head.push_str("\r\n");
    write_headers(&mut head, &req.headers);
    dst.write_all(head.as_bytes()).await
}

/// Serializes a response head.
pub async fn write_response_head<W>(dst: &mut W, res: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut head = String::with_capacity(256);
    head.push_str(res.version.as_str());
    head.push(' ');
    head.push_str(&res.status.to_string());
    if !res.reason.is_empty() {
        head.push(' ');
        head.push_str(&res.reason);
    }
    head.push_str("\r\n");
    write_headers(&mut head, &res.headers);
    dst.write_all(head.as_bytes()).await
}

fn write_headers(head: &mut String, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
}

/// Writes a complete synthetic response (used for gateway errors and
/// malformed-request rejections).
pub async fn write_synthetic_response<W>(
    dst: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let message = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {body}",
        body.len()
    );
    dst.write_all(message.as_bytes()).await?;
    dst.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_scope() -> RequestScope {
        RequestScope::Tunnel {
            host: "api.example.com".to_string(),
            port: 443,
        }
    }

    async fn parse_request(raw: &[u8], scope: &RequestScope) -> Result<Option<Request>, ParseError> {
        let mut reader = MessageReader::new(raw);
        reader.read_request(scope).await
    }

    #[tokio::test]
    async fn parses_origin_form_request_in_tunnel() {
        let raw = b"GET /v1/data?limit=10 HTTP/1.1\r\nHost: api.example.com\r\n\r\n";
        let req = parse_request(raw, &tunnel_scope()).await.unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target.host, "api.example.com");
        assert_eq!(req.target.port, 443);
        assert_eq!(req.target.path_and_query, "/v1/data?limit=10");
        assert_eq!(req.framing, BodyFraming::None);
        assert_eq!(req.url(), "https://api.example.com/v1/data?limit=10");
    }

    #[tokio::test]
    async fn parses_absolute_form_request() {
        let raw = b"GET http://other.com:8080/resource HTTP/1.1\r\nHost: other.com:8080\r\n\r\n";
        let req = parse_request(raw, &RequestScope::Proxy).await.unwrap().unwrap();
        assert_eq!(req.target.scheme, Scheme::Http);
        assert_eq!(req.target.host, "other.com");
        assert_eq!(req.target.port, 8080);
        assert_eq!(req.target.path_and_query, "/resource");
    }

    #[tokio::test]
    async fn origin_form_proxy_request_uses_host_header() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let req = parse_request(raw, &RequestScope::Proxy).await.unwrap().unwrap();
        assert_eq!(req.target.host, "example.com");
        assert_eq!(req.target.port, 80);
    }

    #[tokio::test]
    async fn origin_form_without_host_is_malformed() {
        let raw = b"GET /index.html HTTP/1.1\r\n\r\n";
        let err = parse_request(raw, &RequestScope::Proxy).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidRequestLine(_)));
    }

    #[tokio::test]
    async fn parses_connect_authority() {
        let raw = b"CONNECT api.example.com:443 HTTP/1.1\r\nHost: api.example.com:443\r\n\r\n";
        let req = parse_request(raw, &RequestScope::Proxy).await.unwrap().unwrap();
        assert!(req.method.is_connect());
        assert_eq!(req.target.host, "api.example.com");
        assert_eq!(req.target.port, 443);
        assert_eq!(req.framing, BodyFraming::None);
    }

    #[tokio::test]
    async fn clean_eof_between_requests_is_none() {
        let raw: &[u8] = b"";
        assert!(parse_request(raw, &tunnel_scope()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_head_is_an_error() {
        let raw: &[u8] = b"GET /v1/data HTTP/1.1\r\nHost: api";
        let err = parse_request(raw, &tunnel_scope()).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof));
        assert!(!err.responds());
    }

    #[tokio::test]
    async fn bad_request_line_is_rejected() {
        let raw = b"NOT-HTTP\r\n\r\n";
        let err = parse_request(raw, &tunnel_scope()).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidRequestLine(_)));
        assert!(err.responds());
    }

    #[tokio::test]
    async fn headerless_colon_line_is_rejected() {
        let raw = b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n";
        let err = parse_request(raw, &tunnel_scope()).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader(_)));
    }

    #[tokio::test]
    async fn conflicting_framing_is_rejected() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
        let err = parse_request(raw, &tunnel_scope()).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidFraming));
    }

    #[tokio::test]
    async fn duplicate_content_length_must_agree() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 3\r\n\r\nabc";
        let req = parse_request(raw, &tunnel_scope()).await.unwrap().unwrap();
        assert_eq!(req.framing, BodyFraming::ContentLength(3));

        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n";
        let err = parse_request(raw, &tunnel_scope()).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidFraming));
    }

    #[tokio::test]
    async fn multi_value_headers_preserve_order_and_case() {
        let raw = b"GET / HTTP/1.1\r\nX-Multi: a\r\nx-multi: b\r\n\r\n";
        let req = parse_request(raw, &tunnel_scope()).await.unwrap().unwrap();
        let values: Vec<&str> = req.headers.get_all("X-MULTI").collect();
        assert_eq!(values, vec!["a", "b"]);
        let names: Vec<&str> = req.headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Multi", "x-multi"]);
    }

    #[tokio::test]
    async fn identity_request_round_trips_exactly() {
        let raw: &[u8] =
            b"POST /v1/data?x=1 HTTP/1.1\r\nHost: api.example.com\r\nX-Multi: a\r\nx-multi: b\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = MessageReader::new(raw);
        let req = reader.read_request(&tunnel_scope()).await.unwrap().unwrap();

        let mut out = io::Cursor::new(Vec::new());
        write_request_head(&mut out, &req).await.unwrap();
        reader.copy_body(req.framing, &mut out).await.unwrap();
        assert_eq!(out.into_inner(), raw);
    }

    #[tokio::test]
    async fn chunked_request_round_trips_exactly() {
        let raw: &[u8] = b"POST /upload HTTP/1.1\r\nHost: api.example.com\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = MessageReader::new(raw);
        let req = reader.read_request(&tunnel_scope()).await.unwrap().unwrap();
        assert_eq!(req.framing, BodyFraming::Chunked);

        let mut out = io::Cursor::new(Vec::new());
        write_request_head(&mut out, &req).await.unwrap();
        let copied = reader.copy_body(req.framing, &mut out).await.unwrap();
        assert_eq!(copied, 11);
        assert_eq!(out.into_inner(), raw);
    }

    #[tokio::test]
    async fn chunked_trailers_are_forwarded() {
        let raw: &[u8] =
            b"3\r\nabc\r\n0\r\nX-Checksum: 900150983cd24fb0\r\n\r\n";
        let mut reader = MessageReader::new(raw);
        let mut out = io::Cursor::new(Vec::new());
        reader
            .copy_body(BodyFraming::Chunked, &mut out)
            .await
            .unwrap();
        assert_eq!(out.into_inner(), raw);
    }

    #[tokio::test]
    async fn corrupt_chunk_size_is_rejected() {
        let raw: &[u8] = b"zz\r\nabc\r\n0\r\n\r\n";
        let mut reader = MessageReader::new(raw);
        let mut out = io::Cursor::new(Vec::new());
        let err = reader
            .copy_body(BodyFraming::Chunked, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidChunk(_)));
    }

    #[tokio::test]
    async fn missing_chunk_terminator_is_rejected() {
        let raw: &[u8] = b"3\r\nabcXX0\r\n\r\n";
        let mut reader = MessageReader::new(raw);
        let mut out = io::Cursor::new(Vec::new());
        let err = reader
            .copy_body(BodyFraming::Chunked, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidChunk(_)));
    }

    #[tokio::test]
    async fn truncated_content_length_body_is_an_error() {
        let raw: &[u8] = b"hel";
        let mut reader = MessageReader::new(raw);
        let mut out = io::Cursor::new(Vec::new());
        let err = reader
            .copy_body(BodyFraming::ContentLength(5), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof));
    }

    #[tokio::test]
    async fn parses_response_with_content_length() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut reader = MessageReader::new(raw);
        let res = reader.read_response(&Method::Get).await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.reason, "OK");
        assert_eq!(res.framing, BodyFraming::ContentLength(2));
        assert!(!res.wants_close());
    }

    #[tokio::test]
    async fn unframed_response_reads_to_close() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nstreamed until close";
        let mut reader = MessageReader::new(raw);
        let res = reader.read_response(&Method::Get).await.unwrap();
        assert_eq!(res.framing, BodyFraming::Close);
        assert!(res.wants_close());

        let mut out = io::Cursor::new(Vec::new());
        let n = reader.copy_body(res.framing, &mut out).await.unwrap();
        assert_eq!(n, 20);
        assert_eq!(out.into_inner(), b"streamed until close");
    }

    #[tokio::test]
    async fn head_responses_have_no_body() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n";
        let mut reader = MessageReader::new(raw);
        let res = reader.read_response(&Method::Head).await.unwrap();
        assert_eq!(res.framing, BodyFraming::None);
    }

    #[tokio::test]
    async fn status_without_reason_round_trips() {
        let raw: &[u8] = b"HTTP/1.1 404\r\nContent-Length: 0\r\n\r\n";
        let mut reader = MessageReader::new(raw);
        let res = reader.read_response(&Method::Get).await.unwrap();
        assert_eq!(res.status, 404);
        assert_eq!(res.reason, "");

        let mut out = io::Cursor::new(Vec::new());
        write_response_head(&mut out, &res).await.unwrap();
        assert_eq!(out.into_inner(), raw);
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 1024));
        let err = parse_request(&raw[..], &tunnel_scope()).await.unwrap_err();
        assert!(matches!(err, ParseError::HeadTooLarge));
    }

    #[tokio::test]
    async fn synthetic_response_is_well_formed() {
        let mut out = io::Cursor::new(Vec::new());
        write_synthetic_response(&mut out, 502, "Bad Gateway", "origin unreachable")
            .await
            .unwrap();
        let bytes = out.into_inner();

        let mut reader = MessageReader::new(&bytes[..]);
        let res = reader.read_response(&Method::Get).await.unwrap();
        assert_eq!(res.status, 502);
        assert_eq!(res.framing, BodyFraming::ContentLength(18));
    }

    #[tokio::test]
    async fn keep_alive_requests_parse_sequentially() {
        let raw: &[u8] = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut reader = MessageReader::new(raw);
        let scope = tunnel_scope();
        let first = reader.read_request(&scope).await.unwrap().unwrap();
        let second = reader.read_request(&scope).await.unwrap().unwrap();
        assert_eq!(first.target.path_and_query, "/a");
        assert_eq!(second.target.path_and_query, "/b");
        assert!(reader.read_request(&scope).await.unwrap().is_none());
    }
}
