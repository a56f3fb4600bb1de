use std::net::SocketAddr;
use std::sync::Arc;
use imagesip::{
    cache::spawn_sweeper,
    config::{SipConfig, DEFAULT_PORT},
    transform::RasterEncoder,
    SipServer,
};

/// Image proxy entry point.
///
/// Initializes tracing, loads configuration from the environment, rebuilds
/// the cache index from disk and serves every path on a single endpoint.
///
/// # Configuration
/// Environment variables:
/// - `SIP_OUTPUT` / `SIP_CONTEXT`: absolute cache root and source directory
/// - `SIP_FORMATS`: offered formats in preference order (default: "image/avif,image/webp")
/// - `SIP_TTL_MS`: cache entry lifetime (default: 7 days)
/// - `SIP_KEY_POLICY`: "request" (default) or "source"
/// - `SIP_CLIENT_TIMEOUT_MS`: how long a non-reading client may stall a transcode (default: 10s)
/// - `SIP_SWEEP_INTERVAL_SECS`: enable periodic deletion of expired entries
/// - `PORT`: HTTP listen port (default: 7000)
/// - `RUST_LOG`: Logging verbosity (default: "imagesip=debug,tower_http=debug")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagesip=debug,tower_http=debug".into())
        )
        .init();

    tracing::info!("Starting image proxy");

    let cfg = SipConfig::from_env()?;
    let encoder = Arc::new(RasterEncoder::new(cfg.quality, cfg.max_input_size));
    let sweep_interval = cfg.sweep_interval;
    let server = SipServer::new(cfg, encoder).await?;

    if let Some(every) = sweep_interval {
        tracing::info!(?every, "Expired entry sweeper enabled");
        spawn_sweeper(server.cache().clone(), every);
    }

    let port = match std::env::var("PORT") {
        Ok(p) => p.parse::<u16>()?,
        Err(_) => DEFAULT_PORT,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(
        %addr,
        output = %server.config().output.display(),
        context = %server.config().context.display(),
        formats = ?server.config().formats,
        "Server listening"
    );

    axum::serve(tokio::net::TcpListener::bind(addr).await?, server.router()).await?;
    Ok(())
}
