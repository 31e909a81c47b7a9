//! Credential Relay
//!
//! A reverse proxy that attaches a credential from a self-replenishing pool
//! to every forwarded request.

use anyhow::Result;
use clap::Parser;
use credential_relay::{
    config::{Environment, LogFormat, Settings},
    server::App,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Credential Relay
///
/// Forwards requests to an upstream API, rotating through a pool of
/// credentials that is kept topped up and persisted.
#[derive(Parser, Debug)]
#[command(name = "credential-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides HOST env var)
    #[arg(long)]
    host: Option<String>,

    /// Log level: trace, debug, info, warn, error (overrides LOG_LEVEL env var)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format (overrides LOG_FORMAT env var)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Environment: dev, staging, prod (overrides ENVIRONMENT env var)
    #[arg(short, long, value_enum)]
    env: Option<Environment>,

    /// Upstream base URL (overrides BASE_URL env var)
    #[arg(long)]
    base_url: Option<String>,

    /// Minimum number of active credentials (overrides MIN_API_KEYS env var)
    #[arg(long)]
    min_keys: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (before logging, so we can use log_level)
    let mut settings = Settings::load()?;

    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(log_level) = args.log_level {
        settings.log_level = log_level;
    }
    if let Some(log_format) = args.log_format {
        settings.log_format = log_format;
    }
    if let Some(env) = args.env {
        settings.environment = env;
    }
    if let Some(base_url) = args.base_url {
        settings.upstream.base_url = base_url;
    }
    if let Some(min_keys) = args.min_keys {
        settings.pool.min_api_keys = min_keys;
    }
    settings.validate()?;

    init_tracing(&settings.log_level, settings.log_format);

    tracing::info!(
        app_name = %settings.app_name,
        version = %settings.app_version,
        environment = %settings.environment,
        host = %settings.host,
        port = %settings.port,
        upstream = %settings.upstream.base_url,
        min_api_keys = settings.pool.min_api_keys,
        store = %settings.store.backend,
        "Starting application"
    );

    let app = App::new(settings).await?;
    app.run_with_graceful_shutdown().await?;

    tracing::info!("Application shutdown complete");

    Ok(())
}

/// Initialize the tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let layer = match format {
        LogFormat::Json => fmt::layer().json().with_filter(filter).boxed(),
        LogFormat::Text => fmt::layer().with_target(true).with_filter(filter).boxed(),
    };

    tracing_subscriber::registry().with(layer).init();
}
