//! Per-connection TLS interception.
//!
//! State machine for one accepted client connection: sniff the first
//! request line to decide plaintext-HTTP vs CONNECT, reply to CONNECT with
//! a synthetic 200, terminate the client's TLS with a CA-signed leaf, reach
//! the origin, and hand the established streams to the forwarder. Every
//! failure here aborts only this connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use signet_core::Scheme;

use crate::ca::RootAuthority;
use crate::error::{ProxyError, Result};
use crate::forwarder::Forwarder;
use crate::pipeline::{self, MessageReader, RequestScope};
use crate::rewind::Rewind;
use crate::tls;

/// State shared by all connections: the CA and the forwarding setup. The
/// CA's leaf cache is the only cross-connection mutable state.
pub(crate) struct Shared {
    pub authority: Arc<RootAuthority>,
    pub forwarder: Forwarder,
}

/// Handles one accepted client connection to completion.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> Result<()> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = MessageReader::new(read_half);

    let first = match reader.read_request(&RequestScope::Proxy).await {
        Ok(Some(req)) => req,
        Ok(None) => return Ok(()),
        Err(e) => {
            if e.responds() {
                let _ = pipeline::write_synthetic_response(
                    &mut write_half,
                    400,
                    "Bad Request",
                    "malformed request",
                )
                .await;
            }
            return Err(ProxyError::MalformedRequest(e));
        }
    };

    if !first.method.is_connect() {
        debug!(%peer, "plaintext request");
        return shared
            .forwarder
            .serve_parts(reader, write_half, RequestScope::Proxy, Some(first), None)
            .await;
    }

    let host = first.target.host.clone();
    let port = first.target.port;
    debug!(%peer, host, port, "CONNECT tunnel requested");

    // Reunite the stream; bytes the sniff buffered past the CONNECT head
    // are replayed into the TLS handshake.
    let (read_half, leftover) = reader.into_parts();
    let mut stream = read_half.unsplit(write_half);
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let config = tls::server_config(Arc::clone(&shared.authority), &host);
    let tls_stream = TlsAcceptor::from(config)
        .accept(Rewind::new(leftover.freeze(), stream))
        .await
        .map_err(ProxyError::TlsHandshake)?;

    // The SNI wins over the CONNECT authority when both are present.
    let host = match tls_stream.get_ref().1.server_name() {
        Some(sni) => sni.to_string(),
        None => host,
    };
    debug!(%peer, host, "client TLS established");

    // Reach the origin before exchanging; on failure the per-request
    // connect will retry and surface a gateway error to the client.
    let origin = match shared
        .forwarder
        .connect_origin(Scheme::Https, &host, port)
        .await
    {
        Ok(origin) => Some(origin),
        Err(e) => {
            debug!(host, error = %e, "eager origin connect failed");
            None
        }
    };

    let scope = RequestScope::Tunnel { host, port };
    shared.forwarder.serve(tls_stream, scope, origin).await
}
