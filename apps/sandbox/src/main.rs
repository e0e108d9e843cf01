use std::env;

use anyhow::Result;
use clap::Parser;
use promsandbox_service::config::{Config, LogFormat};
use promsandbox_service::shutdown::ShutdownTrigger;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Ephemeral Prometheus sandboxes for CI run metrics")]
struct Args {
    /// Listener address, overrides SANDBOX_BIND_ADDR.
    #[arg(long)]
    bind_addr: Option<String>,
    /// Target namespace, overrides SANDBOX_NAMESPACE.
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_lookup(|key| match key {
        "SANDBOX_BIND_ADDR" if args.bind_addr.is_some() => args.bind_addr.clone(),
        "SANDBOX_NAMESPACE" if args.namespace.is_some() => args.namespace.clone(),
        _ => env::var(key).ok(),
    })?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let (trigger, shutdown) = ShutdownTrigger::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            trigger.trigger();
        }
    });

    promsandbox_service::serve(config, shutdown).await
}
