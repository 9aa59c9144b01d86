//! Error types for the proxy engine.
//!
//! Per-connection errors (`Certificate`, `TlsHandshake`, `MalformedRequest`,
//! `OriginUnreachable`, `OriginTimeout`) terminate only the connection that
//! raised them. `Bind` is fatal at startup; `Accept` is logged and the
//! accept loop continues.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listen socket. Fatal at startup.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// Failed to accept a client connection. Recovered; the loop continues.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    /// CA or leaf certificate error. Fatal for one connection.
    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// TLS handshake failure on either side. Fatal for one connection.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),

    /// The client sent an unparseable HTTP message.
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] ParseError),

    /// The origin could not be reached. Surfaced to the client as a 502.
    #[error("origin unreachable: {0}")]
    OriginUnreachable(#[source] std::io::Error),

    /// The origin did not answer in time. Surfaced to the client as a 504.
    #[error("origin timed out")]
    OriginTimeout,

    /// Other I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Key or certificate generation/signing failed.
    #[error("failed to generate certificate: {0}")]
    Generation(#[from] rcgen::Error),

    /// The hostname is not a valid DNS name or IP literal.
    #[error("invalid hostname for certificate: {0:?}")]
    InvalidHost(String),

    /// The leaf private key was rejected by the TLS stack.
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),

    /// Failed to read or write CA material on disk.
    #[error("failed to access CA files: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk CA material could not be parsed.
    #[error("failed to parse CA files: {0}")]
    Parse(String),
}

/// HTTP message parse error type.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The peer closed mid-head; no error response is possible.
    #[error("connection closed before a complete header block")]
    UnexpectedEof,

    /// The request line did not have the `METHOD TARGET VERSION` shape.
    #[error("malformed request line: {0:?}")]
    InvalidRequestLine(String),

    /// The status line did not have the `VERSION STATUS REASON` shape.
    #[error("malformed status line: {0:?}")]
    InvalidStatusLine(String),

    /// A header line was missing its colon or had an empty name.
    #[error("malformed header line: {0:?}")]
    InvalidHeader(String),

    /// Conflicting or unparseable Content-Length/Transfer-Encoding.
    #[error("invalid message framing")]
    InvalidFraming,

    /// Chunked transfer coding was corrupt.
    #[error("corrupt chunked encoding: {0}")]
    InvalidChunk(String),

    /// The header block exceeded the size cap.
    #[error("header block too large")]
    HeadTooLarge,

    /// A method or version token failed to parse.
    #[error(transparent)]
    Message(#[from] signet_core::MessageError),

    /// I/O failure while reading the message.
    #[error("I/O while parsing: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Whether the peer can still be sent a synthetic error response.
    ///
    /// After an EOF or I/O failure mid-head there is nobody to answer; a
    /// complete-but-invalid head still has a live connection to write to.
    pub fn responds(&self) -> bool {
        !matches!(self, ParseError::UnexpectedEof | ParseError::Io(_))
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
