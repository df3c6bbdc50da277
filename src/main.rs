//! vless-tunnel - VLESS-over-WebSocket tunnel server
//!
//! Accepts WebSocket connections carrying the VLESS binary handshake and
//! relays them to their destinations, with one-shot failover and
//! DNS-over-HTTPS forwarding for tunneled DNS.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;

use vless_tunnel::{TunnelConfig, TunnelServer};

#[derive(Parser)]
#[command(name = "vless-tunnel")]
#[command(version)]
#[command(about = "VLESS-over-WebSocket tunnel server", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server
    Serve {
        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Client secret token (32 hex chars, UUID dashes allowed)
        #[arg(short, long, env = "VLESS_SECRET")]
        secret: Option<String>,

        /// Fallback host for the one-shot outbound retry
        #[arg(short, long, env = "VLESS_FALLBACK")]
        fallback: Option<String>,

        /// DoH endpoint for tunneled DNS queries
        #[arg(long, env = "VLESS_DOH_URL")]
        doh_url: Option<String>,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Generate a fresh 128-bit secret token
    Genkey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve {
            listen,
            secret,
            fallback,
            doh_url,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(secret) = secret {
                config.secret = secret;
            }
            if let Some(fallback) = fallback {
                config.fallback_addr = fallback;
            }
            if let Some(doh_url) = doh_url {
                config.doh_url = doh_url;
            }

            let server = TunnelServer::new(&config).context("Invalid configuration")?;
            server.run().await
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_deref())?;
            config.validate().map_err(anyhow::Error::msg)?;
            println!("{}", toml::to_string_pretty(&config)?);
            info!("Configuration is valid");
            Ok(())
        }
        Commands::Genkey => {
            let token: [u8; 16] = rand::random();
            let hex = hex::encode(token);
            println!("hex:  {hex}");
            println!(
                "uuid: {}-{}-{}-{}-{}",
                &hex[0..8],
                &hex[8..12],
                &hex[12..16],
                &hex[16..20],
                &hex[20..32]
            );
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<TunnelConfig> {
    match path {
        Some(path) => TunnelConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(TunnelConfig::default()),
    }
}
