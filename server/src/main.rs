use anyhow::{Context, Result};
use clap::Parser;
use dreamrun_server::{Api, Backend, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Path to the SQLite document (non-durable in-memory when omitted).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Shared admin secret (falls back to ADMIN_TOKEN). Unset blocks all
    /// admin operations.
    #[arg(long)]
    admin_token: Option<String>,

    /// Token guarding the metrics endpoints (falls back to METRICS_TOKEN).
    /// Unset leaves them open.
    #[arg(long)]
    metrics_token: Option<String>,

    /// Salt for public display codes (falls back to PUBLIC_SALT).
    #[arg(long)]
    public_salt: Option<String>,

    /// Submission rate-limit window per client IP in seconds (0 disables
    /// rate limiting).
    #[arg(long, default_value_t = 15)]
    submit_window_secs: u64,

    /// Submissions allowed per window (0 disables rate limiting).
    #[arg(long, default_value_t = 3)]
    submit_burst: u32,

    /// Max request body size in bytes (0 disables the limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,
}

fn build_config(args: &Args) -> ServerConfig {
    let defaults = ServerConfig::default();
    let admin_token = args
        .admin_token
        .clone()
        .or_else(|| std::env::var("ADMIN_TOKEN").ok())
        .filter(|token| !token.is_empty());
    let metrics_token = args
        .metrics_token
        .clone()
        .or_else(|| std::env::var("METRICS_TOKEN").ok())
        .filter(|token| !token.is_empty());
    let public_salt = args
        .public_salt
        .clone()
        .or_else(|| std::env::var("PUBLIC_SALT").ok())
        .filter(|salt| !salt.is_empty())
        .unwrap_or_else(|| defaults.public_salt.clone());
    let http_body_limit_bytes = match args.http_body_limit_bytes {
        Some(0) => None,
        Some(limit) => Some(limit),
        None => defaults.http_body_limit_bytes,
    };

    ServerConfig {
        db_path: args.db.clone(),
        admin_token,
        metrics_token,
        public_salt,
        submit_window_secs: args.submit_window_secs,
        submit_burst: args.submit_burst,
        http_body_limit_bytes,
        ..defaults
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = build_config(&args);

    if config.admin_token.is_none() {
        warn!("no admin token configured; all admin endpoints will return 401");
    }
    if config.public_salt == ServerConfig::default().public_salt {
        warn!("using default PUBLIC_SALT; set one for production");
    }

    let backend = Arc::new(Backend::new(config).context("initialize backend")?);
    let app = Api::new(backend).router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "server started");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_picks_up_flags() {
        let args = Args::parse_from([
            "server",
            "--db",
            "/tmp/board.db",
            "--admin-token",
            "sekrit",
            "--submit-window-secs",
            "30",
            "--submit-burst",
            "5",
        ]);
        let config = build_config(&args);
        assert_eq!(config.db_path.as_deref().unwrap().to_str(), Some("/tmp/board.db"));
        assert_eq!(config.admin_token.as_deref(), Some("sekrit"));
        assert_eq!(config.submit_window_secs, 30);
        assert_eq!(config.submit_burst, 5);
    }

    #[test]
    fn zero_body_limit_disables_it() {
        let args = Args::parse_from(["server", "--http-body-limit-bytes", "0"]);
        assert_eq!(build_config(&args).http_body_limit_bytes, None);
    }

    #[test]
    fn empty_admin_token_counts_as_unset() {
        let args = Args::parse_from(["server", "--admin-token", ""]);
        assert_eq!(build_config(&args).admin_token, None);
    }
}
