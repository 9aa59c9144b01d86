//! Request forwarding and response relay.
//!
//! Drives the exchange loop on an established client stream: parse a
//! request, run the interception hook, serialize to the origin, and relay
//! the response back. Within one exchange the request-body upload and the
//! response relay run concurrently; exchanges themselves stay strictly
//! sequential, so response N is complete before response N+1 begins.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use signet_core::{Request, RequestHook, Scheme};

use crate::error::{ProxyError, Result};
use crate::pipeline::{self, MessageReader, RequestScope};
use crate::tls::OriginConnector;

/// Stream to the origin server, plain TCP or TLS depending on the scheme.
enum OriginIo {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OriginIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            OriginIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            OriginIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            OriginIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(s) => Pin::new(s).poll_flush(cx),
            OriginIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            OriginIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An established proxy-to-origin connection, reusable across sequential
/// requests to the same authority while the client connection stays open.
pub(crate) struct Origin {
    authority: (Scheme, String, u16),
    reader: MessageReader<ReadHalf<OriginIo>>,
    writer: WriteHalf<OriginIo>,
    reusable: bool,
}

/// Outcome of one request/response exchange.
enum ExchangeOutcome {
    /// The origin's response was relayed; reuse state is on the `Origin`.
    Relayed,
    /// A synthetic gateway response was written; the origin is gone but the
    /// client connection is intact.
    Synthetic,
}

/// Outcome of the response-relay half of an exchange.
enum DownloadOutcome {
    Relayed { close: bool },
    /// The origin failed before any response byte reached the client.
    OriginFailed(ProxyError),
    /// Client-side write failed; the connection is dead.
    ClientFailed(ProxyError),
    /// The origin died mid-body after the head was relayed; the client's
    /// framing is unrecoverable.
    RelayBroken(ProxyError),
}

/// Forwards hooked requests to origins and relays responses.
pub(crate) struct Forwarder {
    hook: Arc<dyn RequestHook>,
    connector: OriginConnector,
    origin_timeout: Duration,
}

impl Forwarder {
    pub fn new(hook: Arc<dyn RequestHook>, connector: OriginConnector, origin_timeout: Duration) -> Self {
        Self {
            hook,
            connector,
            origin_timeout,
        }
    }

    /// Serves exchanges on a freshly established client stream.
    pub async fn serve<S>(&self, stream: S, scope: RequestScope, origin: Option<Origin>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        self.serve_parts(MessageReader::new(read_half), write_half, scope, None, origin)
            .await
    }

    /// Serves exchanges when the first request head was already parsed
    /// while sniffing for CONNECT.
    pub async fn serve_parts<S>(
        &self,
        mut reader: MessageReader<ReadHalf<S>>,
        mut writer: WriteHalf<S>,
        scope: RequestScope,
        mut pending: Option<Request>,
        mut origin: Option<Origin>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        loop {
            let mut req = match pending.take() {
                Some(req) => req,
                None => match reader.read_request(&scope).await {
                    Ok(Some(req)) => req,
                    Ok(None) => {
                        debug!("client closed the connection");
                        return Ok(());
                    }
                    Err(e) => {
                        if e.responds() {
                            let _ = pipeline::write_synthetic_response(
                                &mut writer,
                                400,
                                "Bad Request",
                                "malformed request",
                            )
                            .await;
                        }
                        return Err(ProxyError::MalformedRequest(e));
                    }
                },
            };

            if req.method.is_connect() {
                // CONNECT is only valid as the first request on a
                // connection; it is consumed before this loop starts.
                let _ = pipeline::write_synthetic_response(
                    &mut writer,
                    400,
                    "Bad Request",
                    "unexpected CONNECT",
                )
                .await;
                return Ok(());
            }

            self.hook.apply(&mut req);

            if matches!(scope, RequestScope::Proxy) {
                req.headers.remove("Proxy-Connection");
                req.headers.remove("Proxy-Authorization");
            }
            if !req.headers.contains("Host") {
                req.headers.set("Host", req.target.authority());
            }

            let authority = (req.target.scheme, req.target.host.clone(), req.target.port);
            let mut conn = match origin.take() {
                Some(conn) if conn.reusable && conn.authority == authority => conn,
                _ => {
                    match self
                        .connect_origin(authority.0, &authority.1, authority.2)
                        .await
                    {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(host = %authority.1, error = %e, "origin connect failed");
                            // The request body must be drained first or the
                            // next head would be parsed out of body bytes.
                            let drained = reader
                                .copy_body(req.framing, &mut tokio::io::sink())
                                .await
                                .is_ok();
                            let (status, reason) = gateway_status(&e);
                            pipeline::write_synthetic_response(
                                &mut writer,
                                status,
                                reason,
                                &e.to_string(),
                            )
                            .await?;
                            if !drained || req.wants_close() {
                                return Ok(());
                            }
                            continue;
                        }
                    }
                }
            };

            let outcome = self
                .exchange(&mut conn, &req, &mut reader, &mut writer)
                .await?;

            match outcome {
                ExchangeOutcome::Relayed => {
                    if conn.reusable {
                        origin = Some(conn);
                    }
                }
                ExchangeOutcome::Synthetic => {}
            }

            if req.wants_close() {
                debug!("client requested connection close");
                return Ok(());
            }
        }
    }

    /// Opens a connection to the origin, with TLS when the scheme demands.
    pub(crate) async fn connect_origin(
        &self,
        scheme: Scheme,
        host: &str,
        port: u16,
    ) -> Result<Origin> {
        debug!(host, port, "connecting to origin");
        let tcp = timeout(self.origin_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::OriginTimeout)?
            .map_err(ProxyError::OriginUnreachable)?;

        let io = match scheme {
            Scheme::Https => OriginIo::Tls(Box::new(self.connector.connect(host, tcp).await?)),
            Scheme::Http => OriginIo::Plain(tcp),
        };
        let (read_half, write_half) = tokio::io::split(io);
        Ok(Origin {
            authority: (scheme, host.to_string(), port),
            reader: MessageReader::new(read_half),
            writer: write_half,
            reusable: true,
        })
    }

    /// Runs one exchange: upload the request and relay the response as two
    /// concurrently scheduled halves.
    async fn exchange<S>(
        &self,
        conn: &mut Origin,
        req: &Request,
        reader: &mut MessageReader<ReadHalf<S>>,
        writer: &mut WriteHalf<S>,
    ) -> Result<ExchangeOutcome>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let Origin {
            reader: origin_reader,
            writer: origin_writer,
            reusable,
            ..
        } = conn;
        let method = req.method.clone();
        let origin_timeout = self.origin_timeout;

        let upload = async {
            pipeline::write_request_head(origin_writer, req).await?;
            reader.copy_body(req.framing, origin_writer).await?;
            origin_writer.flush().await?;
            Ok::<(), ProxyError>(())
        };

        let download = async {
            loop {
                let head = timeout(origin_timeout, origin_reader.read_response(&method)).await;
                let res = match head {
                    Err(_) => break DownloadOutcome::OriginFailed(ProxyError::OriginTimeout),
                    Ok(Err(e)) => break DownloadOutcome::OriginFailed(e.into()),
                    Ok(Ok(res)) => res,
                };
                if let Err(e) = pipeline::write_response_head(writer, &res).await {
                    break DownloadOutcome::ClientFailed(e.into());
                }
                if (100..200).contains(&res.status) {
                    // Interim response; the final one follows.
                    continue;
                }
                if let Err(e) = origin_reader.copy_body(res.framing, writer).await {
                    break DownloadOutcome::RelayBroken(e.into());
                }
                if let Err(e) = writer.flush().await {
                    break DownloadOutcome::ClientFailed(e.into());
                }
                break DownloadOutcome::Relayed {
                    close: res.wants_close(),
                };
            }
        };

        let (upload, download) = tokio::join!(upload, download);

        match download {
            DownloadOutcome::Relayed { close } => {
                *reusable = !close;
                // The response got through, but a failed upload leaves the
                // client stream in an unknown state.
                upload?;
                Ok(ExchangeOutcome::Relayed)
            }
            DownloadOutcome::OriginFailed(e) => {
                warn!(error = %e, "origin failed before responding");
                let (status, reason) = gateway_status(&e);
                pipeline::write_synthetic_response(writer, status, reason, &e.to_string()).await?;
                // A clean upload drained the request body, so the client
                // connection can keep serving.
                upload.map_err(|_| e)?;
                Ok(ExchangeOutcome::Synthetic)
            }
            DownloadOutcome::ClientFailed(e) | DownloadOutcome::RelayBroken(e) => Err(e),
        }
    }
}

fn gateway_status(e: &ProxyError) -> (u16, &'static str) {
    match e {
        ProxyError::OriginTimeout => (504, "Gateway Timeout"),
        _ => (502, "Bad Gateway"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use signet_core::BearerInjector;

    /// Minimal keep-alive origin that echoes the Authorization header back
    /// in the response body.
    async fn spawn_origin() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = tokio::io::split(stream);
                    let mut reader = MessageReader::new(read_half);
                    while let Ok(Some(req)) = reader.read_request(&RequestScope::Proxy).await {
                        let _ = reader.copy_body(req.framing, &mut tokio::io::sink()).await;
                        let body = format!(
                            "auth={}",
                            req.headers.get("Authorization").unwrap_or("<none>")
                        );
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        if write_half.write_all(response.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (addr, connections)
    }

    fn forwarder(pattern: &str) -> Forwarder {
        let hook = Arc::new(BearerInjector::new("abc123", pattern));
        Forwarder::new(hook, OriginConnector::new(), Duration::from_secs(5))
    }

    async fn roundtrip(request: &str, pattern: &str) -> (String, Arc<AtomicUsize>) {
        let (addr, connections) = spawn_origin().await;
        let request = request.replace("{addr}", &addr.to_string());

        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let fwd = forwarder(pattern);
        let serve = tokio::spawn(async move {
            let _ = fwd.serve(server, RequestScope::Proxy, None).await;
        });

        client.write_all(request.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        serve.await.unwrap();
        (out, connections)
    }

    #[tokio::test]
    async fn injects_bearer_for_matching_host() {
        let (out, _) = roundtrip(
            "GET http://{addr}/v1/data HTTP/1.1\r\nHost: {addr}\r\n\r\n",
            "127.0.0.1",
        )
        .await;
        assert!(out.contains("200 OK"));
        assert!(out.contains("auth=Bearer abc123"));
    }

    #[tokio::test]
    async fn excluded_path_passes_through_unmodified() {
        let (out, _) = roundtrip(
            "GET http://{addr}/oauth2/token HTTP/1.1\r\nHost: {addr}\r\n\r\n",
            "127.0.0.1",
        )
        .await;
        assert!(out.contains("auth=<none>"));
    }

    #[tokio::test]
    async fn non_matching_host_passes_through_unmodified() {
        let (out, _) = roundtrip(
            "GET http://{addr}/v1/data HTTP/1.1\r\nHost: {addr}\r\n\r\n",
            "api.example.com",
        )
        .await;
        assert!(out.contains("auth=<none>"));
    }

    #[tokio::test]
    async fn keep_alive_reuses_one_origin_connection() {
        let (out, connections) = roundtrip(
            concat!(
                "GET http://{addr}/a HTTP/1.1\r\nHost: {addr}\r\n\r\n",
                "GET http://{addr}/b HTTP/1.1\r\nHost: {addr}\r\n\r\n",
            ),
            "127.0.0.1",
        )
        .await;
        assert_eq!(out.matches("200 OK").count(), 2);
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_body_is_uploaded() {
        let (out, _) = roundtrip(
            "POST http://{addr}/v1/data HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 4\r\n\r\nping",
            "127.0.0.1",
        )
        .await;
        assert!(out.contains("200 OK"));
    }

    #[tokio::test]
    async fn refused_origin_yields_synthetic_502() {
        // Grab a port that is certainly closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let fwd = forwarder("127.0.0.1");
        let serve = tokio::spawn(async move {
            let _ = fwd.serve(server, RequestScope::Proxy, None).await;
        });

        let request = format!("GET http://{addr}/v1/data HTTP/1.1\r\nHost: {addr}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        serve.await.unwrap();

        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let fwd = forwarder("127.0.0.1");
        let serve = tokio::spawn(async move { fwd.serve(server, RequestScope::Proxy, None).await });

        client.write_all(b"THIS IS NOT HTTP AT ALL\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();

        assert!(out.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(matches!(
            serve.await.unwrap(),
            Err(ProxyError::MalformedRequest(_))
        ));
    }
}
