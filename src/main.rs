//! Soul Relay Server
//!
//! Connects to a soul engine session and relays its `says` and `thinks` events
//! to browser clients over WebSocket. Client messages are dispatched back to
//! the soul as `said` actions.

mod config;
mod server;
mod soul;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::RelayConfig;
use server::{RelayServer, ServerConfig};
use soul::SoulClient;

/// Soul Relay Server
///
/// WebSocket relay between a soul engine session and browser clients
#[derive(Parser, Debug)]
#[command(name = "soul-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file (defaults to ./relay.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Soul engine organization
    #[arg(long)]
    organization: Option<String>,

    /// Soul blueprint to connect to
    #[arg(long)]
    blueprint: Option<String>,

    /// Soul engine WebSocket URL
    #[arg(long)]
    engine_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Apply command line overrides on top of the loaded config
    fn apply(self, config: &mut RelayConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(organization) = self.organization {
            config.soul.organization = organization;
        }
        if let Some(blueprint) = self.blueprint {
            config.soul.blueprint = blueprint;
        }
        if let Some(engine_url) = self.engine_url {
            config.soul.engine_url = engine_url;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Soul Relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RelayConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    // Upstream first, so no client is accepted before the soul client exists
    let soul = match SoulClient::connect(&config.soul).await {
        Ok(soul) => soul,
        Err(e) => {
            error!("Could not connect to soul engine: {}", e);
            warn!("Running without a soul engine session; client messages will be rejected");
            SoulClient::offline()
        }
    };
    if soul.is_connected() {
        info!(
            "Relaying soul {}/{} (session {})",
            config.soul.organization,
            config.soul.blueprint,
            soul.soul_id()
        );
    }

    let server_config = ServerConfig::new(config.bind, config.port);
    let server = Arc::new(RelayServer::new(server_config, Arc::new(soul)));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults_keep_config() {
        let args = Args::parse_from(["soul-relay"]);
        let mut config = RelayConfig::default();
        args.apply(&mut config);
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "soul-relay",
            "--port",
            "6000",
            "--bind",
            "127.0.0.1",
            "--blueprint",
            "other-soul",
            "--engine-url",
            "ws://engine.local:4000",
        ]);
        let mut config = RelayConfig::default();
        args.apply(&mut config);

        assert_eq!(config.port, 6000);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.soul.blueprint, "other-soul");
        assert_eq!(config.soul.organization, "tommy1901");
        assert_eq!(config.soul.engine_url, "ws://engine.local:4000");
    }

    #[test]
    fn test_cli_overrides_invalid_file_value() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[soul]\nengine_url = \"wss://engine.example\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::parse_from([
            "soul-relay",
            "--config",
            path.as_str(),
            "--engine-url",
            "ws://engine.local:4000",
        ]);
        let mut config = RelayConfig::load(args.config.as_deref()).unwrap();
        args.apply(&mut config);

        assert_eq!(config.soul.engine_url, "ws://engine.local:4000");
        assert!(config.validate().is_ok());
    }
}
