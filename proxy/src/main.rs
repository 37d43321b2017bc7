use clap::Parser;
use log::{error, info};
use proxy::{Args, ProxyConfig, ProxyServer, StaticDiscovery};
use std::sync::Arc;

/// Main-method of the relay.
/// Parses command-line arguments, builds the configuration and runs the proxy until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let config = ProxyConfig::try_from(args)?;
    for (class, addr) in &config.backends {
        info!("Backend {:?} -> {}", class, addr);
    }

    let discovery = Arc::new(StaticDiscovery::new(config.backends.clone()));
    let mut server = ProxyServer::bind(config, discovery).await?;

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Proxy stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
