//! Signet - transparent bearer-token injection proxy.
//!
//! Thin CLI shell around the engine: parses arguments, sets up logging,
//! starts the proxy, and turns an interrupt into a drained shutdown.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use signet_core::{BearerInjector, MatchPolicy};
use signet_proxy::{ProxyConfig, ProxyServer};

/// Signet - MITM proxy that injects a bearer token into API requests
#[derive(Parser, Debug)]
#[command(name = "signet", version, about)]
struct Args {
    /// Bearer token injected into matching requests
    #[arg(long)]
    token: String,

    /// TCP port to listen on
    #[arg(long)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Host pattern selecting requests for injection
    #[arg(long, default_value = "googleapis.com")]
    host_pattern: String,

    /// URL fragment that suppresses injection (repeatable)
    #[arg(long = "exclude", default_values_t = [String::from("oauth2")])]
    exclude: Vec<String>,

    /// How the host pattern is matched: "substring" keeps the permissive
    /// legacy behavior, "exact" requires a host match
    #[arg(long, default_value_t = MatchPolicy::Substring)]
    match_policy: MatchPolicy,

    /// Persist the root CA under this directory instead of generating a
    /// fresh one per run
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Skip origin certificate validation (insecure)
    #[arg(long)]
    insecure_origin: bool,

    /// Shutdown drain period in seconds
    #[arg(long, default_value_t = 10)]
    grace: u64,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Initialize console logging.
fn init_logging(args: &Args) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("signet={},warn", args.log_level)));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    tracing::info!("Starting Signet...");

    let hook = Arc::new(
        BearerInjector::new(args.token.clone(), args.host_pattern.clone())
            .with_exclude(args.exclude.clone())
            .with_policy(args.match_policy),
    );

    let mut config = ProxyConfig::new()
        .with_addr(SocketAddr::new(args.bind, args.port))
        .with_grace_period(Duration::from_secs(args.grace));
    if let Some(dir) = &args.ca_dir {
        config = config.with_ca_dir(dir);
    }
    if args.insecure_origin {
        config = config.with_insecure_origin();
    }

    // Bind failures exit non-zero before any traffic is accepted.
    let server = ProxyServer::bind(config, hook)
        .await
        .context("failed to start proxy")?;

    tracing::info!(
        "intercepting {:?} ({} matching) on {}",
        args.host_pattern,
        args.match_policy,
        server.local_addr()
    );
    if let Some(dir) = &args.ca_dir {
        tracing::info!("root CA persisted under {:?}", dir);
    }

    let handle = server.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    tracing::info!("interrupt received, draining connections");
    handle.stop().await;

    tracing::info!("Signet shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_and_port_are_required() {
        assert!(Args::try_parse_from(["signet"]).is_err());
        assert!(Args::try_parse_from(["signet", "--token", "abc"]).is_err());
        assert!(Args::try_parse_from(["signet", "--port", "8080"]).is_err());
        assert!(Args::try_parse_from(["signet", "--token", "abc", "--port", "8080"]).is_ok());
    }

    #[test]
    fn defaults_match_the_original_deployment() {
        let args =
            Args::try_parse_from(["signet", "--token", "abc", "--port", "8080"]).unwrap();
        assert_eq!(args.host_pattern, "googleapis.com");
        assert_eq!(args.exclude, vec!["oauth2".to_string()]);
        assert_eq!(args.match_policy, MatchPolicy::Substring);
        assert_eq!(args.bind.to_string(), "0.0.0.0");
        assert!(!args.insecure_origin);
    }

    #[test]
    fn policy_and_excludes_are_configurable() {
        let args = Args::try_parse_from([
            "signet",
            "--token",
            "abc",
            "--port",
            "8080",
            "--match-policy",
            "exact",
            "--exclude",
            "oauth2",
            "--exclude",
            "token-exchange",
        ])
        .unwrap();
        assert_eq!(args.match_policy, MatchPolicy::Exact);
        assert_eq!(args.exclude.len(), 2);
    }
}
