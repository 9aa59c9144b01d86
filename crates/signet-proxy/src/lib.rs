//! Signet Proxy - intercepting HTTPS proxy engine.
//!
//! This crate implements the core of the Signet proxy from the sockets up:
//! it terminates client connections, performs on-the-fly TLS interception
//! with dynamically generated leaf certificates, parses and forwards
//! HTTP/1.1 traffic, and invokes the interception hook on every request
//! before it leaves for the origin.
//!
//! ## Architecture
//!
//! ```text
//! Client ──► Acceptor ──► first line CONNECT?
//!                              │
//!            ┌─────────────────┴─────────────────┐
//!            │ No (plaintext)                    │ Yes (HTTPS)
//!            ▼                                   ▼
//!       HTTP Pipeline                 200 Established + TLS with
//!            │                        CA-signed leaf; TLS to origin
//!            │                                   │
//!            └─────────────────┬─────────────────┘
//!                              ▼
//!                    parse ► Hook ► Forward ► relay response
//! ```
//!
//! ## Features
//!
//! - Generates an ephemeral root CA per run (or persists one to disk)
//! - Signs per-host leaf certificates on the fly, cached by hostname
//! - Duplex request/response streaming without whole-body buffering
//! - Keep-alive reuse on both the client and the origin side
//! - Graceful drain on shutdown with a bounded grace period
//!
//! Per-connection failures (certificates, handshakes, malformed messages,
//! unreachable origins) never escape their connection task.

mod ca;
mod error;
mod forwarder;
mod interceptor;
mod pipeline;
mod proxy;
mod rewind;
mod tls;

pub use ca::{CertificateError, RootAuthority};
pub use error::{ParseError, ProxyError, Result};
pub use pipeline::{
    write_request_head, write_response_head, write_synthetic_response, MessageReader,
    RequestScope, MAX_HEAD_BYTES,
};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use rewind::Rewind;
pub use tls::OriginConnector;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8899;
