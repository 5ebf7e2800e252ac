use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "mcpproxy",
    about = "Multiplexing reverse proxy for MCP servers",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy supervisor in the foreground.
    Serve {
        /// Path to the JSON config file.
        #[arg(short, long, default_value = "mcpproxy.json")]
        config: PathBuf,
        /// Total shutdown budget in seconds once a stop signal arrives.
        #[arg(long, default_value_t = 10)]
        shutdown_timeout: u64,
    },
    /// Load and validate a config file, reporting the effective settings.
    CheckConfig {
        #[arg(short, long, default_value = "mcpproxy.json")]
        config: PathBuf,
    },
}
