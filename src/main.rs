//! rustsvcs - services link daemon

use clap::{Parser, Subcommand};
use rustsvcs_core::{protocol, Config, Reactor, Session};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Links to an IRC network as a TS6 services server
#[derive(Parser)]
#[command(name = "rustsvcs")]
#[command(about = "TS6 services link daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "rustsvcs.toml")]
    config: PathBuf,

    /// Log level, overriding the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Test configuration and exit
    #[arg(long)]
    test_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "rustsvcs.toml")]
        output: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { output }) => return generate_config(&output),
        Some(Commands::Version) => {
            println!("rustsvcs {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        None => {}
    }

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level);

    if cli.config.exists() {
        info!("Loaded configuration from {:?}", cli.config);
    } else {
        info!("Configuration file {:?} not found, using defaults", cli.config);
    }

    if let Err(e) = config.validate() {
        error!("{}", e);
        return Err(e.into());
    }
    if cli.test_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let mut session = Session::new(config);
    protocol::install(&mut session);
    session.connect_uplink();

    let mut reactor = Reactor::new(session);
    tokio::select! {
        result = reactor.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    if !reactor.session().is_shutdown() {
        reactor.session_mut().request_shutdown();
        reactor.run().await?;
    }

    Ok(())
}

/// Install the fmt subscriber; unknown level names fall back to info
fn init_logging(level: &str) {
    let max_level = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .init();
}

/// Generate default configuration file
fn generate_config(output: &Path) -> anyhow::Result<()> {
    let config = Config::default();
    config.to_file(output)?;
    println!("Generated default configuration file: {:?}", output);
    Ok(())
}
