//! cmlink CLI
//!
//! Connects to CM servers over TCP, UDP or WebSocket.

mod config;
mod session;

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cmlink_discovery::SmartCmServerList;
use cmlink_transport::ProtocolTypes;

use config::Config;
use session::{SessionRunner, SessionSettings};

/// cmlink - CM server connection tool
#[derive(Parser)]
#[command(name = "cmlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to ~/.config/cmlink/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the server list and sample candidate draws
    Servers {
        /// Number of candidates to draw
        #[arg(short, long, default_value_t = 100)]
        samples: usize,

        /// Restrict to these carriers (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        protocols: Vec<String>,
    },

    /// Connect to a server and stay connected
    Connect {
        /// Seconds to stay connected
        #[arg(short, long, default_value_t = 30)]
        duration: u64,

        /// Restrict to these carriers (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        protocols: Vec<String>,

        /// Override the configured attempt limit
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    match cli.command {
        Commands::Servers { samples, protocols } => {
            show_servers(&config, samples, &protocols)?;
        }
        Commands::Connect {
            duration,
            protocols,
            max_attempts,
        } => {
            connect(&config, Duration::from_secs(duration), &protocols, max_attempts)?;
        }
    }

    Ok(())
}

/// Server list built from `[[servers]]`
fn load_servers(config: &Config) -> anyhow::Result<SmartCmServerList> {
    let servers = SmartCmServerList::with_config(config.server_list_config())?;
    servers.replace_list(config.server_records()?);
    if servers.is_empty() {
        anyhow::bail!("No servers configured (add [[servers]] entries to the config)");
    }
    Ok(servers)
}

/// Protocol mask from the command line, falling back to the config
fn protocol_override(config: &Config, names: &[String]) -> anyhow::Result<ProtocolTypes> {
    if names.is_empty() {
        return config.protocol_mask();
    }
    config::parse_protocols(names)
}

/// Print the list and how often each entry is drawn
fn show_servers(config: &Config, samples: usize, protocols: &[String]) -> anyhow::Result<()> {
    let servers = load_servers(config)?;
    let mask = protocol_override(config, protocols)?;

    println!("Servers ({} entries):", servers.len());
    for (record, weighting) in servers.weightings() {
        println!("  {:<40} weighting {}", record.to_string(), weighting);
    }
    println!();

    let mut draws: BTreeMap<String, usize> = BTreeMap::new();
    for _ in 0..samples {
        if let Some(record) = servers.next_server_candidate(mask) {
            *draws.entry(record.to_string()).or_default() += 1;
        }
    }

    println!("Candidates for {mask} ({samples} draws):");
    if draws.is_empty() {
        println!("  none");
    }
    for (record, count) in draws {
        println!("  {record:<40} {count}");
    }

    Ok(())
}

/// Run a session until `duration` passes
fn connect(
    config: &Config,
    duration: Duration,
    protocols: &[String],
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let servers = load_servers(config)?;
    let mask = protocol_override(config, protocols)?;

    // WebSocket-only sessions do not need the universe key
    let envelope = if mask.intersects(ProtocolTypes::TCP | ProtocolTypes::UDP) {
        Some(config.envelope_config()?)
    } else {
        None
    };

    let settings = SessionSettings {
        protocols: mask,
        connect_timeout: config.connect_timeout(),
        max_attempts: max_attempts.unwrap_or(config.connection.max_attempts).max(1),
        websocket: config.websocket_options(),
    };

    let runner = SessionRunner::new(&servers, settings, envelope);
    let server = runner.run(duration)?;
    println!("Session with {server} completed after {}s", duration.as_secs());

    Ok(())
}
