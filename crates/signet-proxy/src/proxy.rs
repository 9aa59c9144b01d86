//! Proxy server lifecycle: bind, accept, drain, shut down.
//!
//! One task per accepted connection; a broadcast signal stops the accept
//! loop, in-flight connections drain within the grace period, and whatever
//! remains is aborted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use signet_core::RequestHook;

use crate::ca::RootAuthority;
use crate::error::{ProxyError, Result};
use crate::forwarder::Forwarder;
use crate::interceptor::{self, Shared};
use crate::tls::OriginConnector;
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Directory for a persistent root CA; `None` generates an ephemeral
    /// root for this run.
    pub ca_dir: Option<PathBuf>,
    /// Validate origin certificates against the webpki roots.
    pub verify_origin: bool,
    /// Timeout for origin connect and response-head reads.
    pub origin_timeout: Duration,
    /// How long in-flight connections may drain during shutdown.
    pub grace_period: Duration,
    /// Listen backlog for the accept socket.
    pub backlog: u32,
}

impl ProxyConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_dir: None,
            verify_origin: true,
            origin_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(10),
            backlog: 1024,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (keeps the configured host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Persists the root CA under the given directory.
    pub fn with_ca_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(dir.into());
        self
    }

    /// Disables origin certificate verification.
    pub fn with_insecure_origin(mut self) -> Self {
        self.verify_origin = false;
        self
    }

    /// Sets the origin connect/response timeout.
    pub fn with_origin_timeout(mut self, timeout: Duration) -> Self {
        self.origin_timeout = timeout;
        self
    }

    /// Sets the shutdown drain period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Sets the listen backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The intercepting proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    authority: Arc<RootAuthority>,
    shared: Arc<Shared>,
}

impl ProxyServer {
    /// Prepares the CA and binds the listen socket.
    ///
    /// Bind failure is fatal at startup; everything past this point only
    /// ever fails per-connection.
    pub async fn bind(config: ProxyConfig, hook: Arc<dyn RequestHook>) -> Result<Self> {
        let authority = Arc::new(match &config.ca_dir {
            Some(dir) => RootAuthority::load_or_generate(dir)?,
            None => RootAuthority::generate()?,
        });

        let listener = bind_listener(config.addr, config.backlog)?;
        let local_addr = listener.local_addr().map_err(ProxyError::Bind)?;

        let connector = if config.verify_origin {
            OriginConnector::new()
        } else {
            OriginConnector::insecure()
        };
        let forwarder = Forwarder::new(hook, connector, config.origin_timeout);
        let shared = Arc::new(Shared {
            authority: Arc::clone(&authority),
            forwarder,
        });

        info!("proxy listening on {}", local_addr);
        Ok(Self {
            config,
            listener,
            local_addr,
            authority,
            shared,
        })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the root certificate in PEM format (for client install).
    pub fn ca_cert_pem(&self) -> &str {
        self.authority.cert_pem()
    }

    /// Returns the root certificate in DER format.
    pub fn ca_cert_der(&self) -> &[u8] {
        self.authority.cert_der().as_ref()
    }

    /// Runs the accept loop until `shutdown` fires, then drains.
    pub async fn run_until(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("shutdown signal received, no longer accepting");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let shared = Arc::clone(&self.shared);
                        connections.spawn(async move {
                            if let Err(e) = interceptor::handle_connection(stream, peer, shared).await {
                                debug!(%peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("{}", ProxyError::Accept(e));
                    }
                },
            }

            // Reap finished connection tasks without blocking the loop.
            while connections.try_join_next().is_some() {}
        }

        drop(self.listener);
        drain(connections, self.config.grace_period).await;
        Ok(())
    }

    /// Runs the proxy until externally cancelled.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let result = self.run_until(shutdown_rx).await;
        drop(shutdown_tx);
        result
    }

    /// Starts the proxy in the background, returning a control handle.
    pub fn start(self) -> ProxyHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let addr = self.local_addr;

        let handle = tokio::spawn(async move {
            if let Err(e) = self.run_until(shutdown_rx).await {
                error!("proxy server error: {}", e);
            }
        });

        ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(ProxyError::Bind)?;
    socket.set_reuseaddr(true).map_err(ProxyError::Bind)?;
    socket.bind(addr).map_err(ProxyError::Bind)?;
    socket.listen(backlog).map_err(ProxyError::Bind)
}

/// Lets in-flight connections finish within the grace period, then aborts
/// the rest.
async fn drain(mut connections: JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }
    info!("draining {} active connections", connections.len());
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match tokio::time::timeout_at(deadline, connections.join_next()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "grace period expired, aborting {} connections",
                    connections.len()
                );
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                break;
            }
        }
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish draining.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
