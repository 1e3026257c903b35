use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use webscan_proxy::{LoggingInterceptor, ProxyConfig, ProxyServer, Result};

#[derive(Parser, Debug)]
#[command(name = "webscan-proxy")]
#[command(about = "Intercepting HTTP/HTTPS proxy for web application testing", long_about = None)]
struct Args {
  /// Path to configuration file (YAML/JSON/TOML)
  #[arg(short, long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Listen host, overrides the configuration
  #[arg(long)]
  host: Option<String>,

  /// Listen port, overrides the configuration
  #[arg(short, long)]
  port: Option<u16>,

  /// Relay CONNECT tunnels without decrypting them
  #[arg(long)]
  no_tls_intercept: bool,

  /// Log every intercepted request and response
  #[arg(long)]
  intercept: bool,

  /// Enable debug logging
  #[arg(short, long)]
  debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  let log_level = if args.debug { "debug" } else { "info" };
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("webscan_proxy={log_level}")));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let mut config = match &args.config {
    Some(path) => {
      info!("Loading configuration from: {}", path.display());
      ProxyConfig::load(path)?
    }
    None => ProxyConfig::from_default_locations()?,
  };
  if let Some(host) = args.host {
    config.host = host;
  }
  if let Some(port) = args.port {
    config.port = port;
  }
  if args.no_tls_intercept {
    config.tls_intercept = false;
  }

  let server = ProxyServer::builder(config)
    .request_interceptor(Arc::new(LoggingInterceptor))
    .response_interceptor(Arc::new(LoggingInterceptor))
    .tolerate_ca_failure(true)
    .build()
    .await?;
  server.set_intercept(args.intercept);
  if let Some(path) = server.ca_cert_path() {
    info!("Install {} as a trusted root to inspect HTTPS", path.display());
  }

  let server = Arc::new(server);
  let stopper = server.clone();
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => {
        info!("Shutting down");
        stopper.stop();
      }
      Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
    }
  });

  server.run().await
}
